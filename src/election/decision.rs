//! Pure election decision over a snapshot of candidate names.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The local candidate has the lowest sequence.
    Lead,
    /// Someone else leads; watch the candidate directly ahead of us.
    Follow { leader: String, predecessor: String },
    /// The local candidate is not in the snapshot.
    Absent,
}

/// Decides leadership for `local` given the current election children.
///
/// Names compare lexicographically, which matches creation order as long as
/// the store pads sequence suffixes to a fixed width.
pub fn decide(mut children: Vec<String>, local: &str) -> Decision {
    children.sort_unstable();
    match children.binary_search_by(|child| child.as_str().cmp(local)) {
        Ok(0) => Decision::Lead,
        Ok(idx) => Decision::Follow {
            leader: children[0].clone(),
            predecessor: children[idx - 1].clone(),
        },
        Err(_) => Decision::Absent,
    }
}
