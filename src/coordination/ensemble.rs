//! Raw session traits for the external coordination ensemble.
//!
//! These traits are the seam between the resilient [`CoordinationClient`] and
//! whatever client library actually talks to the ensemble. They abstract:
//! - Session establishment against a connect string
//! - Node primitives (persistent/ephemeral, plain/sequential)
//! - One-shot watches, delivered through the session event stream
//! - Atomic multi-operation transactions
//!
//! # Available Implementations
//!
//! - [`MemoryEnsemble`](super::memory::MemoryEnsemble): in-process ensemble for testing
//!   (requires the `test-utilities` feature outside of unit tests)
//!
//! # Semantics Expected From Implementations
//!
//! - Reads and writes are linearizable.
//! - Ephemeral nodes live exactly as long as the session that created them.
//! - A watch set by a read fires at most once; continued notification requires a new read.
//! - Sequential suffixes are assigned centrally, are zero-padded to
//!   [`SEQUENCE_DIGITS`](crate::constants::SEQUENCE_DIGITS) digits, and never repeat for
//!   a given parent.
//! - Transient transport trouble surfaces as [`EnsembleError::ConnectionLoss`] together
//!   with a [`SessionEvent::Disconnected`]; a terminal session surfaces as
//!   [`EnsembleError::SessionExpired`] with [`SessionEvent::Expired`].
//!
//! [`CoordinationClient`]: super::client::CoordinationClient

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Ensemble-assigned session identifier.
pub type SessionId = u64;

/// Stream of events produced by one raw session.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Error codes reported by the raw session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnsembleError {
    /// Transport to the ensemble is currently broken (server down, fail-over).
    #[error("connection to the ensemble lost")]
    ConnectionLoss,

    /// The ensemble expired this session; its ephemeral nodes are gone.
    #[error("session expired")]
    SessionExpired,

    /// The session was closed by its owner.
    #[error("session closed")]
    SessionClosed,

    /// The addressed node (or its parent, for creates) does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// The node still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// Conditional update failed.
    #[error("version mismatch on {0}")]
    BadVersion(String),

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    /// The path is malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl EnsembleError {
    /// True for failures that a reconnect may resolve.
    #[inline]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, EnsembleError::ConnectionLoss)
    }
}

/// Result type for raw session operations.
pub type EnsembleResult<T> = Result<T, EnsembleError>;

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Survives the creating session; name gets a sequential suffix.
    PersistentSequential,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Removed when the creating session ends; name gets a sequential suffix.
    EphemeralSequential,
}

impl CreateMode {
    /// Whether the ensemble appends a sequence suffix to the requested name.
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    /// Whether the node is bound to the creating session.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// One operation of an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Create a node.
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    /// Delete a node; `version: None` matches any version.
    Delete { path: String, version: Option<i32> },
    /// Replace node data; `version: None` matches any version.
    SetData {
        path: String,
        data: Bytes,
        version: Option<i32>,
    },
    /// Assert that a node exists (and optionally has the given version).
    Check { path: String, version: Option<i32> },
}

impl Op {
    /// Convenience constructor for [`Op::Create`].
    pub fn create(path: impl Into<String>, data: impl Into<Bytes>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            data: data.into(),
            mode,
        }
    }

    /// Convenience constructor for an unconditional [`Op::Delete`].
    pub fn delete(path: impl Into<String>) -> Self {
        Op::Delete {
            path: path.into(),
            version: None,
        }
    }

    /// Path the operation addresses.
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. }
            | Op::Delete { path, .. }
            | Op::SetData { path, .. }
            | Op::Check { path, .. } => path,
        }
    }
}

/// Per-operation result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// Actual path of the created node (includes any sequence suffix).
    Created(String),
    Deleted,
    /// New data version.
    DataSet(i32),
    Checked,
}

impl OpResult {
    /// Created path, if this result came from a create.
    pub fn created_path(&self) -> Option<&str> {
        match self {
            OpResult::Created(path) => Some(path),
            _ => None,
        }
    }
}

/// Node metadata returned alongside data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped by every data update.
    pub version: i32,
    /// Number of children.
    pub num_children: usize,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<SessionId>,
    /// Creation time, epoch millis.
    pub ctime: i64,
}

/// Kind of change a watch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKind::NodeCreated => write!(f, "node_created"),
            WatchKind::NodeDeleted => write!(f, "node_deleted"),
            WatchKind::NodeDataChanged => write!(f, "node_data_changed"),
            WatchKind::NodeChildrenChanged => write!(f, "node_children_changed"),
        }
    }
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: WatchKind,
    pub path: String,
}

/// Events emitted by a raw session, in the order the ensemble produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session (re-)established with some ensemble member.
    Connected,
    /// Transport lost; the session may still be restored.
    Disconnected,
    /// The ensemble expired the session.
    Expired,
    /// A one-shot watch fired.
    Watch(WatchedEvent),
}

/// Opens raw sessions against an ensemble.
#[async_trait]
pub trait EnsembleConnector: Send + Sync {
    /// Establish a new session.
    ///
    /// Fails with [`EnsembleError::ConnectionLoss`] when no member listed in
    /// `connect_string` is reachable.
    async fn connect(
        &self,
        connect_string: &str,
        session_timeout: Duration,
    ) -> EnsembleResult<(Arc<dyn EnsembleSession>, SessionEvents)>;
}

/// One live session to the ensemble.
///
/// Methods taking `watch: bool` leave a one-shot watch on the addressed path when the
/// read succeeds; the watch fires through [`SessionEvents`].
#[async_trait]
pub trait EnsembleSession: Send + Sync {
    /// Session identifier assigned by the ensemble.
    fn session_id(&self) -> SessionId;

    /// Create a node, returning its actual path.
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> EnsembleResult<String>;

    /// Delete a node.
    async fn delete(&self, path: &str, version: Option<i32>) -> EnsembleResult<()>;

    /// Check existence. A watch on a missing node fires on creation.
    async fn exists(&self, path: &str, watch: bool) -> EnsembleResult<Option<Stat>>;

    /// Read node data.
    async fn get_data(&self, path: &str, watch: bool) -> EnsembleResult<(Bytes, Stat)>;

    /// Replace node data.
    async fn set_data(&self, path: &str, data: Bytes, version: Option<i32>)
    -> EnsembleResult<Stat>;

    /// List child names (not full paths) of a node.
    async fn get_children(&self, path: &str, watch: bool) -> EnsembleResult<Vec<String>>;

    /// Apply all operations atomically, or none.
    async fn multi(&self, ops: Vec<Op>) -> EnsembleResult<Vec<OpResult>>;

    /// Close the session; its ephemeral nodes are removed.
    async fn close(&self) -> EnsembleResult<()>;
}
