//! # zkdiscovery
//! Cluster membership for a compute grid on top of a ZooKeeper-style coordination
//! ensemble.
//!
//! Nodes that join get a cluster-wide, strictly increasing join order. Every member
//! sees the same live topology. Failures are detected through ephemeral liveness
//! markers, and application-defined custom events are delivered to every member in
//! one total order.
//!
//! # Layers
//! - [`coordination`]: a resilient client over one ensemble session. It keeps a
//!   session state machine, retries transient connection loss within the session
//!   timeout, reports expiry as terminal, and serializes all callbacks on one
//!   notification context.
//! - [`discovery`]: the membership protocol. Cluster state is a tree in the store;
//!   the protocol watches it and derives an immutable [`TopologySnapshot`](discovery::TopologySnapshot).
//!
//! ## Getting started
//! ```rust,no_run
//! use std::sync::Arc;
//! use zkdiscovery::prelude::*;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl DiscoveryListener for Printer {
//!     async fn on_local_node_initialized(&self, node: Arc<NodeRecord>) {
//!         println!("local node has order {}", node.order);
//!     }
//!     async fn on_node_joined(&self, node: Arc<NodeRecord>, _topology: Arc<TopologySnapshot>) {
//!         println!("joined: {}", node);
//!     }
//!     async fn on_node_failed(&self, node: Arc<NodeRecord>, _topology: Arc<TopologySnapshot>) {
//!         println!("failed: {}", node);
//!     }
//!     async fn on_custom_event(
//!         &self,
//!         event: CustomEventRecord,
//!         _sender: Option<Arc<NodeRecord>>,
//!         _topology: Arc<TopologySnapshot>,
//!     ) {
//!         println!("event #{} from {}", event.sequence, event.sender);
//!     }
//! }
//!
//! # async fn run(connector: Arc<dyn EnsembleConnector>) -> Result<(), DiscoveryError> {
//! let config = DiscoveryConfig::new("zk1:2181,zk2:2181,zk3:2181").with_bootstrap_if_absent(true);
//! let discovery = ZkDiscovery::new(config, connector, Arc::new(Printer), None)?;
//! let local = discovery.start().await?;
//! discovery.send_custom_event(bytes::Bytes::from_static(b"hello")).await?;
//! # let _ = local;
//! discovery.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! The ensemble client library plugs in through [`EnsembleConnector`](coordination::EnsembleConnector).
//! With the `test-utilities` feature, [`MemoryEnsemble`](coordination::MemoryEnsemble)
//! provides an in-process ensemble with server stop/restart and session expiry.

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod coordination;
pub mod discovery;
pub mod metrics;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for embedding discovery in a grid node.
    pub use crate::config::DiscoveryConfig;
    pub use crate::coordination::{
        CoordinationClient, CoordinationError, CoordinationResult, CreateMode, EnsembleConnector,
        SessionState, Watch,
    };
    pub use crate::discovery::{
        CustomEventRecord, DataExchange, Discovery, DiscoveryCapabilities, DiscoveryError,
        DiscoveryListener, DiscoveryResult, MembershipState, NodeRecord, TopologySnapshot,
        ZkDiscovery,
    };
    pub use crate::types::{NodeId, NodeOrder, ProductVersion};

    pub use bytes;
}
