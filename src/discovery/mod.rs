//! Cluster membership over the coordination layer.
//!
//! - [`paths`]: store layout, child-name parsing, record encoding, bootstrap
//! - [`node`]: records stored in the coordination store
//! - [`topology`]: immutable [`TopologySnapshot`] and its publication point
//! - [`listener`]: collaborators called by the protocol
//! - [`protocol`]: [`MembershipProtocol`]
//! - [`spi`]: the [`Discovery`] interface and [`ZkDiscovery`]

pub mod error;
pub mod listener;
pub mod node;
pub mod paths;
pub mod protocol;
pub mod spi;
pub mod topology;

pub use error::{DiscoveryError, DiscoveryResult};
#[cfg(any(test, feature = "test-utilities"))]
pub use listener::RecordingListener;
pub use listener::{DataExchange, DiscoveryEvent, DiscoveryListener, NoopDataExchange};
pub use node::{ClusterData, CustomEventRecord, JoiningNodeData, NodeRecord};
pub use paths::{NodeChild, ZkPaths, bootstrap_cluster};
pub use protocol::{MembershipProtocol, MembershipState};
pub use spi::{Discovery, DiscoveryCapabilities, ZkDiscovery};
pub use topology::{TopologyDiff, TopologyHolder, TopologySnapshot};
