//! Logging setup for processes embedding discovery.
//!
//! The library only emits `tracing` events. Installing a subscriber is up to the
//! embedding application; [`init_logging`] is the setup used by this repository's own
//! tooling and tests.
//!
//! ```rust,no_run
//! use zkdiscovery::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::from_env()).expect("no subscriber installed yet");
//! ```
//!
//! `LOG_FORMAT=json` switches to one JSON object per line; anything else keeps the
//! human-readable layout. `RUST_LOG` filters as usual and defaults to `info`.
//!
//! # Structured fields
//!
//! Discovery events carry a fixed set of fields so logs from many nodes can be merged:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `node_id` | Local node identifier |
//! | `order` | Join order of the node an event is about |
//! | `topology_version` | Snapshot version after the event was applied |
//! | `session_id` | Raw session identifier |
//! | `state` | Session or membership state |

use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Error returned when a global subscriber is already installed.
pub type InitError = Box<dyn std::error::Error + Send + Sync>;

/// Output layout of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-column text for terminals.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Lenient: `json` in any case selects [`LogFormat::Json`], everything else is pretty.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().eq_ignore_ascii_case("json") {
            Ok(LogFormat::Json)
        } else {
            Ok(LogFormat::Pretty)
        }
    }
}

impl LogFormat {
    /// Format named by `LOG_FORMAT`, pretty when unset.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }
}

fn filter_or(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber.
///
/// Fails if one is already installed.
pub fn init_logging(format: LogFormat) -> Result<(), InitError> {
    let registry = tracing_subscriber::registry().with(filter_or("info"));
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer()).try_init()?,
    }
    Ok(())
}

/// Subscriber for tests: output goes through the harness capture, default level `warn`.
///
/// Only the first call in a process installs anything.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(filter_or("warn"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_selected_case_insensitively() {
        for raw in ["json", "JSON", " Json "] {
            assert_eq!(raw.parse::<LogFormat>().unwrap(), LogFormat::Json, "{raw:?}");
        }
    }

    #[test]
    fn test_unknown_formats_fall_back_to_pretty() {
        for raw in ["pretty", "text", ""] {
            assert_eq!(raw.parse::<LogFormat>().unwrap(), LogFormat::Pretty, "{raw:?}");
        }
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_init_test_logging_is_repeatable() {
        init_test_logging();
        init_test_logging();
    }
}
