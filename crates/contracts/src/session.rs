//! Session lifecycle state shared between the orchestrator and observers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Capture session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    /// CMD_START broadcast, collecting acknowledgments
    Arming,
    Recording,
    /// CMD_STOP broadcast, best-effort drain
    Stopping,
}

/// Quorum shortfall handling while arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Abort the whole session when the quorum is not reached in time
    #[default]
    Strict,
    /// Proceed with the acknowledged subset once the quorum is met
    Degraded,
}

/// Read-only session view published over a watch channel.
///
/// `members` uses a BTreeSet so snapshots render deterministically in logs
/// and dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub members: BTreeSet<String>,
    pub acked: BTreeSet<String>,
    /// Devices armed but excluded by a degraded-mode decision or heartbeat loss
    pub excluded: BTreeSet<String>,
}

/// Final result of one arm/record/stop cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    /// Every armed member acknowledged and recorded
    Complete { session_id: String },
    /// Session ran with a reduced member set
    Degraded {
        session_id: String,
        excluded: Vec<String>,
    },
    /// Quorum not reached in strict mode, or explicit abort
    Aborted { session_id: String, reason: String },
}

impl SessionOutcome {
    /// Session id regardless of outcome.
    pub fn session_id(&self) -> &str {
        match self {
            SessionOutcome::Complete { session_id }
            | SessionOutcome::Degraded { session_id, .. }
            | SessionOutcome::Aborted { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_idle() {
        assert_eq!(SessionState::default(), SessionState::Idle);
        assert_eq!(SessionSnapshot::default().state, SessionState::Idle);
    }

    #[test]
    fn test_outcome_session_id() {
        let outcome = SessionOutcome::Degraded {
            session_id: "s1".to_string(),
            excluded: vec!["c".to_string()],
        };
        assert_eq!(outcome.session_id(), "s1");
    }
}
