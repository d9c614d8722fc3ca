mod classifier;
mod rules;
mod store;

pub use classifier::{Classifier, ExitOutcome};
pub use rules::{strip_ansi, Rule, RuleError, RuleSet};
pub use store::{StatusStore, StoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity state of a supervised agent, inferred from its terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// Nothing classified yet
    #[default]
    Unknown,
    /// Agent is producing output
    Working,
    /// Agent is waiting for user input (prompt, confirmation)
    Waiting,
    /// Agent was working and has gone quiet
    Idle,
    /// An error banner was seen, the process died, or the backend is gone
    Error,
    /// Wrapped process exited cleanly
    Exited,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Unknown => "unknown",
            ActivityState::Working => "working",
            ActivityState::Waiting => "waiting",
            ActivityState::Idle => "idle",
            ActivityState::Error => "error",
            ActivityState::Exited => "exited",
        }
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest classified status of one session, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: ActivityState,
    /// Most recent non-empty visible line, bounded in length
    #[serde(default)]
    pub last_output: String,
    pub updated_at: DateTime<Utc>,
    /// Backend session was found missing during reconciliation
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreachable: bool,
}

impl SessionStatus {
    pub fn new(state: ActivityState, last_output: impl Into<String>) -> Self {
        Self {
            state,
            last_output: last_output.into(),
            updated_at: Utc::now(),
            unreachable: false,
        }
    }

    /// Status used when no record exists.
    pub fn unknown() -> Self {
        Self::new(ActivityState::Unknown, "")
    }

    /// Status written for a session whose backend session no longer exists.
    pub fn unreachable(last_output: impl Into<String>) -> Self {
        Self {
            unreachable: true,
            ..Self::new(ActivityState::Error, last_output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ActivityState::Waiting).unwrap();
        assert_eq!(json, "\"waiting\"");
        let back: ActivityState = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(back, ActivityState::Idle);
    }

    #[test]
    fn test_unreachable_flag_only_serialized_when_set() {
        let plain = serde_json::to_value(SessionStatus::new(ActivityState::Working, "x")).unwrap();
        assert!(plain.get("unreachable").is_none());

        let gone = serde_json::to_value(SessionStatus::unreachable("gone")).unwrap();
        assert_eq!(gone["unreachable"], true);
        assert_eq!(gone["state"], "error");
    }

    #[test]
    fn test_reads_record_without_optional_fields() {
        let status: SessionStatus = serde_json::from_str(
            r#"{"state":"working","updated_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(status.state, ActivityState::Working);
        assert!(status.last_output.is_empty());
        assert!(!status.unreachable);
    }
}
