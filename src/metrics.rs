//! Prometheus metrics for coordination sessions and cluster membership.
//!
//! Metrics cover:
//! - Session lifecycle (current state, transitions)
//! - Coordination operations (count and latency per operation, retries)
//! - Topology (member count, snapshot version)
//! - Membership events delivered to listeners
//! - Protocol violations observed in the coordination store
//!
//! All metrics live in the [`REGISTRY`] below, prefixed `zkdiscovery_`, so an embedding
//! application can merge or expose them without clashing with its own default
//! registry. A metric that fails to register still works; it is just not exported.
//!
//! Gauges are process-wide. When several discovery instances share one process
//! (as tests do) the gauges reflect whichever instance wrote last.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

/// Registry holding every discovery metric.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("zkdiscovery".to_string()), None).unwrap_or_else(|_| Registry::new())
});

macro_rules! gauge {
    ($name:ident, $metric:literal, $help:literal) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| registered($metric, IntGauge::new($metric, $help)));
    };
}

macro_rules! counter {
    ($name:ident, $metric:literal, $help:literal) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| registered($metric, IntCounter::new($metric, $help)));
    };
    ($name:ident, $metric:literal, $help:literal, [$($label:literal),+]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            registered($metric, IntCounterVec::new(Opts::new($metric, $help), &[$($label),+]))
        });
    };
}

macro_rules! histogram {
    ($name:ident, $metric:literal, $help:literal, [$($label:literal),+], [$($bucket:expr),+]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            let opts = HistogramOpts::new($metric, $help).buckets(vec![$($bucket),+]);
            registered($metric, HistogramVec::new(opts, &[$($label),+]))
        });
    };
}

/// Add `metric` to [`REGISTRY`]; on a registration clash keep it unexported.
///
/// Construction only fails on malformed names or labels, which are literals here.
fn registered<C>(name: &str, metric: prometheus::Result<C>) -> C
where
    C: Collector + Clone + 'static,
{
    let metric = metric.expect("metric names and labels are static literals");
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        warn!(metric = name, error = %e, "Metric not registered, recording without export");
    }
    metric
}

// =============================================================================
// Session metrics
// =============================================================================

gauge!(
    SESSION_STATE,
    "session_state",
    "Current coordination session state (0=disconnected, 1=connecting, 2=connected, 3=suspended, 4=expired, 5=closed)"
);
counter!(
    SESSION_TRANSITIONS,
    "session_transitions_total",
    "Coordination session state transitions",
    ["to"]
);
counter!(
    SESSIONS_EXPIRED,
    "sessions_expired_total",
    "Sessions that reached the expired state"
);

// =============================================================================
// Operation metrics
// =============================================================================

counter!(
    COORDINATION_OPS,
    "coordination_ops_total",
    "Coordination operations by operation and outcome",
    ["op", "status"]
);
histogram!(
    COORDINATION_OP_DURATION,
    "coordination_op_duration_seconds",
    "Coordination operation duration including retries",
    ["op"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
);
counter!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Membership metrics
// =============================================================================

gauge!(
    TOPOLOGY_SIZE,
    "topology_size",
    "Number of members in the local topology snapshot"
);
gauge!(
    TOPOLOGY_VERSION,
    "topology_version",
    "Version of the local topology snapshot"
);
counter!(
    MEMBERSHIP_EVENTS,
    "membership_events_total",
    "Events delivered to the discovery listener",
    ["kind"]
);
counter!(
    JOIN_ATTEMPTS,
    "join_attempts_total",
    "Cluster join attempts by outcome",
    ["status"]
);
counter!(
    PROTOCOL_VIOLATIONS,
    "protocol_violations_total",
    "Malformed or unexpected entries found in the coordination store",
    ["kind"]
);

/// Force registration of every metric so they show up before first use.
///
/// Idempotent.
pub fn init_metrics() {
    let _ = &*SESSION_STATE;
    let _ = &*SESSION_TRANSITIONS;
    let _ = &*SESSIONS_EXPIRED;
    let _ = &*COORDINATION_OPS;
    let _ = &*COORDINATION_OP_DURATION;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*TOPOLOGY_SIZE;
    let _ = &*TOPOLOGY_VERSION;
    let _ = &*MEMBERSHIP_EVENTS;
    let _ = &*JOIN_ATTEMPTS;
    let _ = &*PROTOCOL_VIOLATIONS;
}

/// Render [`REGISTRY`] in the Prometheus text exposition format.
pub fn gather_text() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let mut out = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut out)?;
    Ok(String::from_utf8(out)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

/// Record a session state transition.
pub fn record_session_state(code: i64, state_label: &str) {
    SESSION_STATE.set(code);
    SESSION_TRANSITIONS.with_label_values(&[state_label]).inc();
}

/// Record the outcome and duration of one coordination operation.
pub fn record_op(op: &str, status: &str, duration_secs: f64) {
    COORDINATION_OPS.with_label_values(&[op, status]).inc();
    COORDINATION_OP_DURATION
        .with_label_values(&[op])
        .observe(duration_secs);
}

/// Publish the current snapshot shape.
pub fn set_topology(size: usize, version: u64) {
    TOPOLOGY_SIZE.set(size as i64);
    TOPOLOGY_VERSION.set(version as i64);
}

/// Count one event delivered to the listener (`joined`, `failed`, `custom`).
pub fn record_membership_event(kind: &str) {
    MEMBERSHIP_EVENTS.with_label_values(&[kind]).inc();
}

/// Count one join attempt by outcome (`ok`, `error`).
pub fn record_join_attempt(status: &str) {
    JOIN_ATTEMPTS.with_label_values(&[status]).inc();
}

/// Count one protocol violation.
pub fn record_protocol_violation(kind: &str) {
    PROTOCOL_VIOLATIONS.with_label_values(&[kind]).inc();
}
