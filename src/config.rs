use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::is_valid_path;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    /// Store connect string. The in-memory ensemble only uses it as its name.
    pub connect: String,
    /// A store outage at least this long expires the session.
    pub session_timeout_ms: u64,
    pub election_namespace: String,
    pub candidate_prefix: String,
    pub registry_namespace: String,
    pub member_prefix: String,
    /// Zero-padding width of sequential suffixes. Lexicographic order of
    /// child names only matches creation order while this stays fixed.
    pub sequence_width: usize,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            connect: "localhost:2181".to_string(),
            session_timeout_ms: 3_000,
            election_namespace: "/election".to_string(),
            candidate_prefix: "c_".to_string(),
            registry_namespace: "/service_registry".to_string(),
            member_prefix: "n_".to_string(),
            sequence_width: 10,
        }
    }
}

impl HeraldConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, namespace) in [
            ("election_namespace", &self.election_namespace),
            ("registry_namespace", &self.registry_namespace),
        ] {
            if namespace == "/" || !is_valid_path(namespace) {
                return Err(Error::Config(format!(
                    "{name} must be an absolute non-root path, got {namespace:?}"
                )));
            }
        }
        if self.election_namespace == self.registry_namespace {
            return Err(Error::Config(
                "election and registry namespaces must differ".to_string(),
            ));
        }
        for (name, prefix) in [
            ("candidate_prefix", &self.candidate_prefix),
            ("member_prefix", &self.member_prefix),
        ] {
            if prefix.is_empty() || prefix.contains('/') {
                return Err(Error::Config(format!(
                    "{name} must be a non-empty name without '/', got {prefix:?}"
                )));
            }
        }
        if self.sequence_width == 0 {
            return Err(Error::Config("sequence_width must be positive".to_string()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn candidate_path_prefix(&self) -> String {
        format!("{}/{}", self.election_namespace, self.candidate_prefix)
    }

    pub fn member_path_prefix(&self) -> String {
        format!("{}/{}", self.registry_namespace, self.member_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HeraldConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.candidate_path_prefix(), "/election/c_");
        assert_eq!(config.member_path_prefix(), "/service_registry/n_");
        assert_eq!(config.session_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn rejects_root_and_relative_namespaces() {
        let mut config = HeraldConfig::default();
        config.election_namespace = "/".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.election_namespace = "election".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_shared_namespace_and_bad_prefix() {
        let mut config = HeraldConfig::default();
        config.registry_namespace = config.election_namespace.clone();
        assert!(config.validate().is_err());

        let mut config = HeraldConfig::default();
        config.member_prefix = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: HeraldConfig =
            serde_json::from_str(r#"{"registry_namespace": "/workers"}"#).expect("parse");
        assert_eq!(config.registry_namespace, "/workers");
        assert_eq!(config.election_namespace, "/election");
        assert_eq!(config.sequence_width, 10);
    }
}
