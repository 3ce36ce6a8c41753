//! Orchestrator lifecycle state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    #[default]
    Initializing,
    Ready,
    Running,
    Paused,
    Completing,
    Completed,
    Failed,
    Terminated,
}

impl OrchestratorState {
    pub fn allowed_transitions(&self) -> &'static [OrchestratorState] {
        use OrchestratorState::*;
        match self {
            Initializing => &[Ready, Failed, Terminated],
            Ready => &[Running, Failed, Terminated],
            Running => &[Paused, Completing, Failed, Terminated],
            Paused => &[Running, Completing, Failed, Terminated],
            Completing => &[Completed, Failed, Terminated],
            Completed => &[],
            Failed => &[Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, target: OrchestratorState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    /// Whether `submit` is accepted in this state.
    pub fn accepts_submissions(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Paused)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Completing => "Completing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        };
        write!(f, "{}", s)
    }
}

/// A recorded transition, for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: OrchestratorState,
    pub to: OrchestratorState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(
        from: OrchestratorState,
        to: OrchestratorState,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Validate a transition, producing the error the public API returns.
pub fn check_transition(from: OrchestratorState, to: OrchestratorState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrchestratorError::invalid_state(
            format!("state allowing {to}"),
            from,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        assert!(OrchestratorState::Initializing.can_transition_to(OrchestratorState::Ready));
        assert!(OrchestratorState::Ready.can_transition_to(OrchestratorState::Running));
        assert!(OrchestratorState::Running.can_transition_to(OrchestratorState::Completing));
        assert!(OrchestratorState::Completing.can_transition_to(OrchestratorState::Completed));
    }

    #[test]
    fn test_pause_resume_cycle() {
        assert!(OrchestratorState::Running.can_transition_to(OrchestratorState::Paused));
        assert!(OrchestratorState::Paused.can_transition_to(OrchestratorState::Running));
        assert!(OrchestratorState::Paused.can_transition_to(OrchestratorState::Completing));
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(OrchestratorState::Completed.allowed_transitions().is_empty());
        assert!(OrchestratorState::Terminated.allowed_transitions().is_empty());
        assert!(!OrchestratorState::Completed.can_transition_to(OrchestratorState::Running));
    }

    #[test]
    fn test_failed_can_only_terminate() {
        assert_eq!(
            OrchestratorState::Failed.allowed_transitions(),
            &[OrchestratorState::Terminated]
        );
    }

    #[test]
    fn test_submissions_only_while_running() {
        assert!(OrchestratorState::Running.accepts_submissions());
        assert!(!OrchestratorState::Paused.accepts_submissions());
        assert!(!OrchestratorState::Ready.accepts_submissions());
    }

    #[test]
    fn test_check_transition_error() {
        let err = check_transition(OrchestratorState::Ready, OrchestratorState::Paused)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }
}
