use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),
    #[error("session expired")]
    SessionExpired,
    /// A node vanished between listing and use. Recovered internally by
    /// retrying with a fresh snapshot; never returned from public operations.
    #[error("race lost on {path}")]
    RaceLost { path: String },
    #[error("store protocol error: {0}")]
    StoreProtocol(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("no such node: {0}")]
    NoNode(String),
    #[error("candidate already volunteered in this session")]
    AlreadyVolunteered,
    #[error("candidate has not volunteered")]
    NotVolunteered,
    #[error("already registered at {0}")]
    AlreadyRegistered(String),
    #[error("candidate {0} is no longer in the election namespace")]
    CandidateMissing(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl Error {
    /// Errors that end the current election or registration term. The caller
    /// has to reconnect and volunteer/register again from scratch.
    pub fn is_term_fatal(&self) -> bool {
        matches!(self, Error::SessionExpired | Error::CandidateMissing(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
