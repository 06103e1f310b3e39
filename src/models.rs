//! Status models reported by running services.
//!
//! These are plain serde types so daemons can expose them over their own
//! RPC handlers or dump them as JSON.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a service listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Accepting connections.
    Running,
    /// Listener fail-stopped after exhausting its retry budget.
    Degraded,
    /// Shut down on request.
    Stopped,
}

impl ServiceState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ServiceState::Running => 0,
            ServiceState::Degraded => 1,
            ServiceState::Stopped => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::Running,
            1 => ServiceState::Degraded,
            _ => ServiceState::Stopped,
        }
    }

    /// Whether the listener is still accepting connections.
    pub fn is_accepting(&self) -> bool {
        matches!(self, ServiceState::Running)
    }
}

/// Point-in-time snapshot of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub name: String,
    pub socket_path: PathBuf,
    pub state: ServiceState,
    /// Slots currently held by in-flight exchanges.
    pub active: usize,
    /// Admission ceiling.
    pub limit: usize,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&ServiceState::Degraded).unwrap(),
            r#""DEGRADED""#
        );
        let state: ServiceState = serde_json::from_str(r#""RUNNING""#).unwrap();
        assert_eq!(state, ServiceState::Running);
    }

    #[test]
    fn test_state_u8_encoding() {
        for state in [
            ServiceState::Running,
            ServiceState::Degraded,
            ServiceState::Stopped,
        ] {
            assert_eq!(ServiceState::from_u8(state.as_u8()), state);
        }
        assert!(ServiceState::Running.is_accepting());
        assert!(!ServiceState::Degraded.is_accepting());
    }

    #[test]
    fn test_stats_json_shape() {
        let stats = ServiceStats {
            name: "echo".to_string(),
            socket_path: PathBuf::from("/tmp/echo"),
            state: ServiceState::Running,
            active: 1,
            limit: 4,
            started_at: DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["state"], "RUNNING");
        assert_eq!(value["active"], 1);
        assert_eq!(value["limit"], 4);
        assert_eq!(value["socket_path"], "/tmp/echo");
    }
}
