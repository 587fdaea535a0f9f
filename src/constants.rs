//! Centralized coordination and membership constants.
//!
//! This module consolidates the magic numbers and path names used throughout
//! the discovery layer. Having them in one place makes it easier to:
//!
//! - Understand the coordination-store layout
//! - Update values consistently
//! - Keep path parsing and path construction in agreement
//!
//! # Categories
//!
//! - **Store Layout**: node names under the cluster root
//! - **Naming Constants**: widths used when parsing sequential child names
//! - **Session Constants**: default and minimum session timings

// =============================================================================
// Store Layout
// =============================================================================

/// Default cluster root path in the coordination store.
pub const DEFAULT_ROOT_PATH: &str = "/zkdiscovery";

/// Node holding cluster-wide metadata (start time).
pub const CLUSTER_NODE: &str = "cluster";

/// Parent of the persistent join-history entries.
pub const JOIN_HISTORY_NODE: &str = "join-history";

/// Parent of the ephemeral liveness markers.
pub const ALIVE_NODE: &str = "alive";

/// Parent of the persistent custom-event entries.
pub const EVENTS_NODE: &str = "events";

// =============================================================================
// Naming Constants
// =============================================================================

/// Length of a hyphenated UUID in its canonical text form.
///
/// Child names under `alive/` and `join-history/` start with exactly this many
/// characters of node id, followed by `-` and the sequence suffix.
pub const NODE_ID_LEN: usize = 36;

/// Number of digits the ensemble uses for sequential suffixes.
///
/// Sequence numbers are zero-padded so that lexicographic and numeric order agree.
pub const SEQUENCE_DIGITS: usize = 10;

/// Join order reserved for "not yet assigned".
///
/// The first marker created gets sequence 0 and therefore join order 1.
pub const UNASSIGNED_ORDER: u64 = 0;

// =============================================================================
// Session Constants
// =============================================================================

/// Default connect string when none is configured.
pub const DEFAULT_CONNECT_STRING: &str = "127.0.0.1:2181";

/// Default session timeout in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5_000;

/// Smallest session timeout accepted by configuration validation.
pub const MIN_SESSION_TIMEOUT_MS: u64 = 100;

/// Lower bound for the delay between retries of a transient failure.
pub const RETRY_MIN_DELAY_MS: u64 = 20;

/// Upper bound for the delay between retries of a transient failure.
pub const RETRY_MAX_DELAY_MS: u64 = 1_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_len_matches_uuid() {
        let id = uuid::Uuid::new_v4().to_string();
        assert_eq!(id.len(), NODE_ID_LEN);
    }

    #[test]
    fn test_retry_bounds_ordered() {
        assert!(RETRY_MIN_DELAY_MS < RETRY_MAX_DELAY_MS);
        assert!(MIN_SESSION_TIMEOUT_MS <= DEFAULT_SESSION_TIMEOUT_MS);
    }
}
