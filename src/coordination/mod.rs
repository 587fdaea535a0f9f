//! Coordination layer: a resilient client over a ZooKeeper-style ensemble.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------+
//! |  MembershipProtocol       |  (discovery module)
//! +-------------+-------------+
//!               |  create / read / children / watch
//! +-------------v-------------+
//! |  CoordinationClient       |  session state machine, retry window,
//! |                           |  serial notification dispatcher
//! +-------------+-------------+
//!               |  EnsembleSession trait
//! +-------------v-------------+
//! |  ensemble client library  |  (or MemoryEnsemble in tests)
//! +---------------------------+
//! ```
//!
//! # Modules
//!
//! - [`ensemble`]: raw session traits and wire-level types
//! - [`client`]: [`CoordinationClient`] and one-shot [`Watch`] handles
//! - [`session`]: [`SessionState`] machine
//! - [`retry`]: backoff policies bounded by the session window
//! - [`error`]: [`CoordinationError`] taxonomy
//! - `memory`: in-process ensemble (`test-utilities` feature)

pub mod client;
pub mod ensemble;
pub mod error;
#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;
pub mod retry;
pub mod session;

pub use client::{ConnectionLostHook, CoordinationClient, Watch};
pub use ensemble::{
    CreateMode, EnsembleConnector, EnsembleError, EnsembleResult, EnsembleSession, Op, OpResult,
    SessionEvent, SessionEvents, SessionId, Stat, WatchKind, WatchedEvent,
};
pub use error::{CoordinationError, CoordinationResult};
#[cfg(any(test, feature = "test-utilities"))]
pub use memory::MemoryEnsemble;
pub use session::{SessionState, SessionStateCell};
