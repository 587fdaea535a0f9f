//! Error types for the coordination client.
//!
//! # Failure Taxonomy
//!
//! Raw session failures are folded into a small client-visible taxonomy:
//!
//! ## Transient (retried internally)
//!
//! Connection loss and single-server fail-over. The client retries these until the
//! session window closes; callers only ever see them as [`CoordinationError::TimedOut`].
//!
//! ## Session Expired (fatal to the session)
//!
//! All ephemeral state owned by the session is gone. The owner must start a new
//! session and a new membership lifecycle; the client never recreates ephemeral
//! nodes silently.
//!
//! ## Permanent (fail fast)
//!
//! Missing parents, conflicting nodes, malformed data, a client that never managed
//! to connect, or a client that was closed. These are never retried.
//!
//! ## Guidelines
//!
//! - **Join path**: propagate every error; the node must not enter the cluster half-done
//! - **Watch callbacks**: log and convert to topology events, never panic
//! - **Queries**: best-effort where a stale answer is acceptable

use std::time::Duration;

use thiserror::Error;

use super::ensemble::EnsembleError;

/// Result type for coordination client operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors surfaced by [`CoordinationClient`](super::client::CoordinationClient).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    /// The client never established a session with the ensemble.
    #[error("Failed to connect to ensemble: {0}")]
    ConnectionFailed(String),

    /// The operation could not complete within one session window.
    #[error("Coordination operation {op} timed out after {timeout:?}")]
    TimedOut { op: &'static str, timeout: Duration },

    /// The session expired; its ephemeral nodes are gone.
    #[error("Coordination session expired")]
    SessionExpired,

    /// The client was closed by its owner.
    #[error("Coordination client closed")]
    Closed,

    /// Transient connection loss. Only observed inside the retry loop.
    #[error("Connection to ensemble lost")]
    ConnectionLoss,

    /// Node (or parent) does not exist.
    #[error("No node at {0}")]
    NoNode(String),

    /// Node already exists.
    #[error("Node already exists at {0}")]
    NodeExists(String),

    /// Node still has children.
    #[error("Node {0} is not empty")]
    NotEmpty(String),

    /// Conditional update lost a race.
    #[error("Version mismatch on {0}")]
    BadVersion(String),

    /// Request rejected by the ensemble as malformed.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl CoordinationError {
    /// Check if this error is transient and worth retrying inside the session window.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoordinationError::ConnectionLoss)
    }

    /// Check if the session behind this error is gone for good.
    #[inline]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, CoordinationError::SessionExpired)
    }

    /// Check if the operation ran out of its session window.
    #[inline]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, CoordinationError::TimedOut { .. })
    }

    /// Check if every later operation on the same client will fail the same way.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CoordinationError::ConnectionFailed(_)
                | CoordinationError::SessionExpired
                | CoordinationError::Closed
        )
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            CoordinationError::ConnectionFailed(_) => "connection_failed",
            CoordinationError::TimedOut { .. } => "timed_out",
            CoordinationError::SessionExpired => "session_expired",
            CoordinationError::Closed => "closed",
            CoordinationError::ConnectionLoss => "connection_loss",
            CoordinationError::NoNode(_) => "no_node",
            CoordinationError::NodeExists(_) => "node_exists",
            CoordinationError::NotEmpty(_) => "not_empty",
            CoordinationError::BadVersion(_) => "bad_version",
            CoordinationError::ProtocolViolation(_) => "protocol_violation",
        }
    }
}

impl From<EnsembleError> for CoordinationError {
    fn from(e: EnsembleError) -> Self {
        match e {
            EnsembleError::ConnectionLoss => CoordinationError::ConnectionLoss,
            EnsembleError::SessionExpired => CoordinationError::SessionExpired,
            EnsembleError::SessionClosed => CoordinationError::Closed,
            EnsembleError::NoNode(path) => CoordinationError::NoNode(path),
            EnsembleError::NodeExists(path) => CoordinationError::NodeExists(path),
            EnsembleError::NotEmpty(path) => CoordinationError::NotEmpty(path),
            EnsembleError::BadVersion(path) => CoordinationError::BadVersion(path),
            EnsembleError::NoChildrenForEphemerals(path) => CoordinationError::ProtocolViolation(
                format!("ephemeral node {} cannot have children", path),
            ),
            EnsembleError::InvalidPath(path) => {
                CoordinationError::ProtocolViolation(format!("invalid path {}", path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_out_display() {
        let err = CoordinationError::TimedOut {
            op: "create_if_needed",
            timeout: Duration::from_secs(3),
        };
        let display = err.to_string();
        assert!(display.contains("create_if_needed"));
        assert!(display.contains("3s"));
    }

    #[test]
    fn test_only_connection_loss_is_retriable() {
        assert!(CoordinationError::ConnectionLoss.is_retriable());
        assert!(!CoordinationError::SessionExpired.is_retriable());
        assert!(!CoordinationError::NoNode("/a".to_string()).is_retriable());
        assert!(
            !CoordinationError::TimedOut {
                op: "x",
                timeout: Duration::ZERO
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_expired_and_timed_out_are_distinguished() {
        let expired = CoordinationError::SessionExpired;
        let timed_out = CoordinationError::TimedOut {
            op: "get_data",
            timeout: Duration::from_millis(500),
        };
        assert!(expired.is_session_expired());
        assert!(!expired.is_timed_out());
        assert!(timed_out.is_timed_out());
        assert!(!timed_out.is_session_expired());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(CoordinationError::SessionExpired.is_permanent());
        assert!(CoordinationError::Closed.is_permanent());
        assert!(CoordinationError::ConnectionFailed("x".to_string()).is_permanent());
        assert!(!CoordinationError::NodeExists("/a".to_string()).is_permanent());
        assert!(!CoordinationError::ConnectionLoss.is_permanent());
    }

    #[test]
    fn test_from_ensemble_error() {
        assert_eq!(
            CoordinationError::from(EnsembleError::ConnectionLoss),
            CoordinationError::ConnectionLoss
        );
        assert_eq!(
            CoordinationError::from(EnsembleError::SessionClosed),
            CoordinationError::Closed
        );
        assert_eq!(
            CoordinationError::from(EnsembleError::NoNode("/p".to_string())),
            CoordinationError::NoNode("/p".to_string())
        );
        assert!(matches!(
            CoordinationError::from(EnsembleError::InvalidPath("bad".to_string())),
            CoordinationError::ProtocolViolation(_)
        ));
    }

    #[test]
    fn test_metric_labels_are_snake_case() {
        let errors = [
            CoordinationError::ConnectionFailed(String::new()),
            CoordinationError::SessionExpired,
            CoordinationError::Closed,
            CoordinationError::ConnectionLoss,
            CoordinationError::NoNode(String::new()),
            CoordinationError::ProtocolViolation(String::new()),
        ];
        for err in errors {
            let label = err.as_metric_label();
            assert_eq!(label, label.to_lowercase());
            assert!(!label.contains(' '));
        }
    }
}
