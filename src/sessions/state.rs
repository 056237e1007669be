use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a migration session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Unpacking,
    Analyzing,
    Transforming,
    Running,
    Paused,
    Validating,
    Completed,
    Failed,
    Merged,
}

impl SessionState {
    pub const ALL: [SessionState; 10] = [
        SessionState::Created,
        SessionState::Unpacking,
        SessionState::Analyzing,
        SessionState::Transforming,
        SessionState::Running,
        SessionState::Paused,
        SessionState::Validating,
        SessionState::Completed,
        SessionState::Failed,
        SessionState::Merged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Unpacking => "unpacking",
            SessionState::Analyzing => "analyzing",
            SessionState::Transforming => "transforming",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Validating => "validating",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Merged => "merged",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Merged
        )
    }

    /// States a session passes through before the agent is first started
    pub fn is_pre_run(&self) -> bool {
        matches!(
            self,
            SessionState::Created
                | SessionState::Unpacking
                | SessionState::Analyzing
                | SessionState::Transforming
        )
    }

    /// Legal successor states. Every non-terminal state may also fail.
    pub fn successors(&self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Created => &[Unpacking, Analyzing, Running, Failed],
            Unpacking => &[Analyzing, Failed],
            Analyzing => &[Transforming, Running, Failed],
            Transforming => &[Running, Failed],
            Running => &[Paused, Validating, Completed, Merged, Failed],
            Paused => &[Running, Validating, Completed, Merged, Failed],
            Validating => &[Completed, Merged, Failed],
            Completed | Failed | Merged => &[],
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown session state: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_successors() {
        for state in SessionState::ALL {
            assert_eq!(state.is_terminal(), state.successors().is_empty());
        }
    }

    #[test]
    fn every_non_terminal_state_can_fail() {
        for state in SessionState::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(SessionState::Failed), "{}", state);
        }
    }

    #[test]
    fn stop_and_resume_are_mutual() {
        assert!(SessionState::Running.can_transition_to(SessionState::Paused));
        assert!(SessionState::Paused.can_transition_to(SessionState::Running));
    }

    #[test]
    fn no_backwards_edges_into_setup_states() {
        for state in SessionState::ALL {
            assert!(!state.can_transition_to(SessionState::Created));
        }
        assert!(!SessionState::Running.can_transition_to(SessionState::Analyzing));
        assert!(!SessionState::Merged.can_transition_to(SessionState::Running));
    }

    #[test]
    fn round_trips_through_str() {
        for state in SessionState::ALL {
            assert_eq!(state.as_str().parse::<SessionState>().unwrap(), state);
        }
        assert_eq!("RUNNING".parse::<SessionState>().unwrap(), SessionState::Running);
        assert!("bogus".parse::<SessionState>().is_err());
    }
}
