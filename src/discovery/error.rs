//! Error types for the membership layer.
//!
//! Join and administrative calls return these errors to the caller. Failures that
//! happen after a node has joined are never returned from anywhere; they are
//! delivered to the listener as topology events instead.

use std::time::Duration;

use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::types::NodeId;

/// Result type for membership operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors surfaced by the membership protocol and the discovery component.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The coordination client failed (timed out, expired, closed, ...).
    #[error("Coordination failed: {0}")]
    Coordination(#[from] CoordinationError),

    /// The cluster root structure is missing from the coordination store.
    #[error("Cluster is not initialized at {root}; bootstrap it first")]
    ClusterNotInitialized { root: String },

    /// The coordination store holds data this node cannot interpret.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The call is not valid in the current membership state.
    #[error("Invalid state for {op}: {state}")]
    InvalidState { op: &'static str, state: String },

    /// No live member with this id.
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// The operation is not supported in this form.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration failed validation.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    /// Record (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The local node did not appear in its own topology in time.
    #[error("Join did not complete within {0:?}")]
    JoinTimedOut(Duration),
}

impl DiscoveryError {
    /// Check if the local session is gone and membership must restart from scratch.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, DiscoveryError::Coordination(e) if e.is_session_expired())
    }

    /// Check if the error stems from malformed coordination-store content.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DiscoveryError::ProtocolViolation(_)
                | DiscoveryError::Serde(_)
                | DiscoveryError::Coordination(CoordinationError::ProtocolViolation(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_coordination_error() {
        let err: DiscoveryError = CoordinationError::SessionExpired.into();
        assert!(err.is_session_expired());
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_cluster_not_initialized_display() {
        let err = DiscoveryError::ClusterNotInitialized {
            root: "/zk".to_string(),
        };
        assert!(err.to_string().contains("/zk"));
    }

    #[test]
    fn test_config_error_joins_messages() {
        let err = DiscoveryError::Config(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Invalid configuration: a; b");
    }

    #[test]
    fn test_protocol_violation_classification() {
        assert!(DiscoveryError::ProtocolViolation("x".to_string()).is_protocol_violation());
        let serde_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(DiscoveryError::from(serde_err).is_protocol_violation());
        assert!(!DiscoveryError::JoinTimedOut(Duration::from_secs(1)).is_protocol_violation());
    }

    #[test]
    fn test_invalid_state_display() {
        let err = DiscoveryError::InvalidState {
            op: "send_custom_event",
            state: "joining".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("send_custom_event"));
        assert!(display.contains("joining"));
    }
}
