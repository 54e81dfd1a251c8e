//! Changeset state machine
//!
//! ```text
//! Open --commit--> Committed
//! Committed | Stashed --reopen--> Open
//! Open --stash--> Stashed
//! Open | Committed --apply--> Applied
//! Open | Committed --discard--> Discarded
//! ```
//!
//! Applied and Discarded are terminal.

use std::fmt;

use tessera_common::{Result, TesseraError};
use tessera_persistence::{ActionType, ChangesetState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Commit,
    Reopen,
    Stash,
    Apply,
    Discard,
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Commit => "commit",
            Transition::Reopen => "reopen",
            Transition::Stash => "stash",
            Transition::Apply => "apply",
            Transition::Discard => "discard",
        }
    }

    /// States the transition may start from
    pub fn sources(self) -> &'static [ChangesetState] {
        match self {
            Transition::Commit | Transition::Stash => &[ChangesetState::Open],
            Transition::Reopen => &[ChangesetState::Committed, ChangesetState::Stashed],
            Transition::Apply | Transition::Discard => {
                &[ChangesetState::Open, ChangesetState::Committed]
            }
        }
    }

    pub fn target(self) -> ChangesetState {
        match self {
            Transition::Commit => ChangesetState::Committed,
            Transition::Reopen => ChangesetState::Open,
            Transition::Stash => ChangesetState::Stashed,
            Transition::Apply => ChangesetState::Applied,
            Transition::Discard => ChangesetState::Discarded,
        }
    }

    /// Audit action recorded when the transition happens
    pub fn action(self) -> ActionType {
        match self {
            Transition::Commit => ActionType::Commit,
            Transition::Reopen => ActionType::Reopen,
            Transition::Stash => ActionType::Stash,
            Transition::Apply => ActionType::Apply,
            Transition::Discard => ActionType::Discard,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target state of `transition` from `from`, or `InvalidOperation` naming the source state
pub fn check_transition(from: ChangesetState, transition: Transition) -> Result<ChangesetState> {
    if transition.sources().contains(&from) {
        Ok(transition.target())
    } else {
        Err(TesseraError::InvalidOperation(format!(
            "cannot {} a changeset in state {}",
            transition, from
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ChangesetState; 5] = [
        ChangesetState::Open,
        ChangesetState::Committed,
        ChangesetState::Applied,
        ChangesetState::Discarded,
        ChangesetState::Stashed,
    ];

    #[test]
    fn test_allowed_transitions() {
        use ChangesetState::*;
        assert_eq!(check_transition(Open, Transition::Commit).unwrap(), Committed);
        assert_eq!(check_transition(Committed, Transition::Reopen).unwrap(), Open);
        assert_eq!(check_transition(Stashed, Transition::Reopen).unwrap(), Open);
        assert_eq!(check_transition(Open, Transition::Stash).unwrap(), Stashed);
        assert_eq!(check_transition(Open, Transition::Apply).unwrap(), Applied);
        assert_eq!(check_transition(Committed, Transition::Apply).unwrap(), Applied);
        assert_eq!(check_transition(Open, Transition::Discard).unwrap(), Discarded);
        assert_eq!(
            check_transition(Committed, Transition::Discard).unwrap(),
            Discarded
        );
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for transition in [
            Transition::Commit,
            Transition::Reopen,
            Transition::Stash,
            Transition::Apply,
            Transition::Discard,
        ] {
            for state in [ChangesetState::Applied, ChangesetState::Discarded] {
                let err = check_transition(state, transition).unwrap_err();
                assert!(matches!(err, TesseraError::InvalidOperation(_)));
                assert!(err.to_string().contains(state.as_str()));
            }
        }
    }

    #[test]
    fn test_sources_are_exact() {
        let mut allowed = 0;
        for transition in [
            Transition::Commit,
            Transition::Reopen,
            Transition::Stash,
            Transition::Apply,
            Transition::Discard,
        ] {
            for state in ALL_STATES {
                if check_transition(state, transition).is_ok() {
                    allowed += 1;
                }
            }
        }
        assert_eq!(allowed, 8);
    }

    #[test]
    fn test_stashed_cannot_be_applied() {
        let err = check_transition(ChangesetState::Stashed, Transition::Apply).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid operation: cannot apply a changeset in state STASHED"
        );
    }
}
