//! Action instance state.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of one action instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    /// Prepared, waiting for start.
    Preparing,
    /// The effect is active.
    Running,
    /// Revert in progress.
    Stopping,
    /// Terminal: effect reverted (or never started).
    Stopped,
    /// Terminal: the action failed.
    Failed,
}

impl ActionState {
    /// True for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Status response for one action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Action instance id.
    pub action_id: String,
    /// Current state.
    pub state: ActionState,
    /// When the effect started, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Failure message, when the state is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stop response for one action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    /// Action instance id.
    pub action_id: String,
    /// Terminal state reached.
    pub state: ActionState,
    /// Revert problems; the state is terminal regardless.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub revert_errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ActionState::Stopped.is_terminal());
        assert!(ActionState::Failed.is_terminal());
        assert!(!ActionState::Running.is_terminal());
        assert!(!ActionState::Stopping.is_terminal());
        assert!(!ActionState::Preparing.is_terminal());
    }

    #[test]
    fn status_serializes_camel_case() {
        let report = StatusReport {
            action_id: "a1".to_string(),
            state: ActionState::Running,
            started_at: None,
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["actionId"], "a1");
        assert_eq!(json["state"], "running");
        assert!(json.get("error").is_none());
    }
}
