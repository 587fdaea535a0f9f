//! Session state machine for the coordination client.
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED <-> SUSPENDED -> EXPIRED
//!                      |            |             |
//!                      v            v             v
//!                DISCONNECTED     CLOSED        CLOSED
//! ```
//!
//! `DISCONNECTED` is both the initial state and the terminal state of a client that
//! never managed to connect. `EXPIRED`, `CLOSED` and a post-connect `DISCONNECTED` are
//! absorbing: once reached, no further transition is accepted.
//!
//! # Safety Properties
//!
//! 1. **Single source of truth**: the state lives in one `tokio::sync::watch` channel,
//!    so every waiter observes the same sequence of states
//! 2. **Validated transitions**: illegal transitions are rejected and logged, never applied
//! 3. **Metrics integration**: every applied transition is recorded to Prometheus

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics;

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session. Initial state, and terminal after a failed connect.
    Disconnected,
    /// Initial session establishment in progress.
    Connecting,
    /// Session established; operations proceed normally.
    Connected,
    /// Transport lost; operations wait for the session to come back.
    Suspended,
    /// Session lost for good; its ephemeral nodes are gone.
    Expired,
    /// Closed by the owner.
    Closed,
}

impl SessionState {
    /// Numeric code published through the session state gauge.
    pub fn as_code(&self) -> i64 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Suspended => 3,
            SessionState::Expired => 4,
            SessionState::Closed => 5,
        }
    }

    /// Lowercase label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Suspended => "suspended",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Closed)
                | (Connected, Suspended)
                | (Connected, Expired)
                | (Connected, Closed)
                | (Suspended, Connected)
                | (Suspended, Expired)
                | (Suspended, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable holder for a [`SessionState`].
#[derive(Debug)]
pub struct SessionStateCell {
    tx: watch::Sender<SessionState>,
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateCell {
    /// Create a cell in [`SessionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Disconnected);
        Self { tx }
    }

    /// Current state.
    #[inline]
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every later transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Apply `next` if it is a legal transition from the current state.
    ///
    /// Returns `true` if the state changed.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                debug!(from = %from, to = %next, "Session state transition");
                metrics::record_session_state(next.as_code(), next.as_str());
                if next == SessionState::Expired {
                    metrics::SESSIONS_EXPIRED.inc();
                }
            }
            None => {
                let current = self.get();
                if current != next {
                    warn!(from = %current, to = %next, "Rejected illegal session state transition");
                }
            }
        }
        changed
    }

    /// Apply `next` only if the current state equals `expected`.
    pub fn transition_from(&self, expected: SessionState, next: SessionState) -> bool {
        if self.get() != expected {
            return false;
        }
        self.transition(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_disconnected() {
        let cell = SessionStateCell::new();
        assert_eq!(cell.get(), SessionState::Disconnected);
    }

    #[test]
    fn test_happy_path_transitions() {
        let cell = SessionStateCell::new();
        assert!(cell.transition(SessionState::Connecting));
        assert!(cell.transition(SessionState::Connected));
        assert!(cell.transition(SessionState::Suspended));
        assert!(cell.transition(SessionState::Connected));
        assert!(cell.transition(SessionState::Closed));
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn test_expired_is_absorbing() {
        let cell = SessionStateCell::new();
        cell.transition(SessionState::Connecting);
        cell.transition(SessionState::Connected);
        cell.transition(SessionState::Suspended);
        assert!(cell.transition(SessionState::Expired));

        assert!(!cell.transition(SessionState::Connected));
        assert!(!cell.transition(SessionState::Closed));
        assert!(!cell.transition(SessionState::Suspended));
        assert_eq!(cell.get(), SessionState::Expired);
    }

    #[test]
    fn test_failed_connect_is_terminal() {
        let cell = SessionStateCell::new();
        cell.transition(SessionState::Connecting);
        assert!(cell.transition(SessionState::Disconnected));
        assert!(!cell.transition(SessionState::Connected));
        assert_eq!(cell.get(), SessionState::Disconnected);
    }

    #[test]
    fn test_cannot_skip_connecting() {
        let cell = SessionStateCell::new();
        assert!(!cell.transition(SessionState::Connected));
        assert!(!cell.transition(SessionState::Suspended));
        assert_eq!(cell.get(), SessionState::Disconnected);
    }

    #[test]
    fn test_transition_from_checks_expected() {
        let cell = SessionStateCell::new();
        cell.transition(SessionState::Connecting);
        cell.transition(SessionState::Connected);
        assert!(!cell.transition_from(SessionState::Suspended, SessionState::Expired));
        assert_eq!(cell.get(), SessionState::Connected);
        assert!(cell.transition_from(SessionState::Connected, SessionState::Suspended));
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let cell = SessionStateCell::new();
        let mut rx = cell.subscribe();
        cell.transition(SessionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Connecting);
    }

    #[test]
    fn test_codes_are_distinct() {
        let states = [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Suspended,
            SessionState::Expired,
            SessionState::Closed,
        ];
        let mut codes: Vec<i64> = states.iter().map(|s| s.as_code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), states.len());
    }
}
