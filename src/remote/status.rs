//! Remote state codes and their classification.
//!
//! The detection and reduction services are independent and number their
//! states differently (detection reports completion as `3`, reduction as
//! `2`). Each gets its own named [`StatusTable`]; this file is the only
//! place to touch when a service renumbers its states.

use serde::{Deserialize, Serialize};

/// Pipeline-side meaning of a remote state code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// A code missing from the table. Treated as still pending.
    Unknown(i64),
}

impl RemoteState {
    /// `Completed`, `Failed` and `Cancelled` end polling for a job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RemoteState::Completed | RemoteState::Failed | RemoteState::Cancelled
        )
    }
}

/// A named mapping from one service's integer codes to [`RemoteState`].
#[derive(Debug)]
pub struct StatusTable {
    pub name: &'static str,
    entries: &'static [(i64, RemoteState)],
}

impl StatusTable {
    pub const fn new(name: &'static str, entries: &'static [(i64, RemoteState)]) -> Self {
        Self { name, entries }
    }

    /// Classify a state code. Codes absent from the table map to
    /// [`RemoteState::Unknown`].
    pub fn classify(&self, code: i64) -> RemoteState {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, state)| *state)
            .unwrap_or(RemoteState::Unknown(code))
    }

    pub fn entries(&self) -> &'static [(i64, RemoteState)] {
        self.entries
    }
}

/// AI-detection service codes.
pub static DETECTION_STATES: StatusTable = StatusTable::new(
    "detection",
    &[
        (-1, RemoteState::Failed),
        (0, RemoteState::Queued),
        (1, RemoteState::Running),
        // not terminal here; detection completes on 3
        (2, RemoteState::Running),
        (3, RemoteState::Completed),
        (4, RemoteState::Cancelled),
    ],
);

/// Rewrite ("reduce") service codes.
pub static REDUCTION_STATES: StatusTable = StatusTable::new(
    "reduction",
    &[
        (-1, RemoteState::Failed),
        (0, RemoteState::Queued),
        (1, RemoteState::Running),
        (2, RemoteState::Completed),
        (3, RemoteState::Cancelled),
    ],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_completes_on_three() {
        assert_eq!(DETECTION_STATES.classify(3), RemoteState::Completed);
        assert_eq!(DETECTION_STATES.classify(2), RemoteState::Running);
    }

    #[test]
    fn reduction_completes_on_two() {
        assert_eq!(REDUCTION_STATES.classify(2), RemoteState::Completed);
        assert_eq!(REDUCTION_STATES.classify(3), RemoteState::Cancelled);
    }

    #[test]
    fn failure_code_is_terminal_in_both() {
        for table in [&DETECTION_STATES, &REDUCTION_STATES] {
            assert_eq!(table.classify(-1), RemoteState::Failed, "{}", table.name);
            assert!(table.classify(-1).is_terminal());
        }
    }

    #[test]
    fn unknown_code_is_not_terminal() {
        let state = DETECTION_STATES.classify(42);
        assert_eq!(state, RemoteState::Unknown(42));
        assert!(!state.is_terminal());
    }

    #[test]
    fn tables_have_unique_codes_and_one_completion() {
        for table in [&DETECTION_STATES, &REDUCTION_STATES] {
            let mut codes: Vec<i64> = table.entries().iter().map(|(c, _)| *c).collect();
            codes.sort_unstable();
            codes.dedup();
            assert_eq!(codes.len(), table.entries().len(), "{}", table.name);
            let completions = table
                .entries()
                .iter()
                .filter(|(_, s)| *s == RemoteState::Completed)
                .count();
            assert_eq!(completions, 1, "{}", table.name);
        }
    }
}
