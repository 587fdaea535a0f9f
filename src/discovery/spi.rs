//! The discovery component as the surrounding grid sees it.
//!
//! [`Discovery`] is the interface a grid node programs against; [`ZkDiscovery`] implements
//! it on top of [`MembershipProtocol`]. What the implementation supports is declared
//! in [`DiscoveryCapabilities`] and checked by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::info;

use super::error::DiscoveryResult;
use super::listener::{DataExchange, DiscoveryListener, NoopDataExchange};
use super::node::NodeRecord;
use super::protocol::{MembershipProtocol, MembershipState};
use super::topology::TopologySnapshot;
use crate::config::DiscoveryConfig;
use crate::coordination::EnsembleConnector;
use crate::types::NodeId;

/// What a discovery implementation guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryCapabilities {
    /// Several instances may run in one process.
    pub multiple_instances: bool,
    /// Members carry a cluster-wide join order.
    pub order: bool,
    /// Join history is kept.
    pub history: bool,
}

/// A discovery component: membership, failure detection and custom events.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Join the cluster. Returns the local node once it is a member.
    async fn start(&self) -> DiscoveryResult<Arc<NodeRecord>>;

    /// Leave the cluster.
    async fn stop(&self);

    /// Drop the session and report the local node cut off.
    async fn disconnect(&self);

    fn local_node(&self) -> Option<Arc<NodeRecord>>;

    fn remote_nodes(&self) -> Vec<Arc<NodeRecord>>;

    fn get_node(&self, id: NodeId) -> Option<Arc<NodeRecord>>;

    async fn known_node(&self, id: NodeId) -> bool;

    async fn ping_node(&self, id: NodeId) -> bool;

    /// Broadcast `payload`; returns its position in the event order.
    async fn send_custom_event(&self, payload: Bytes) -> DiscoveryResult<u64>;

    async fn fail_node(&self, id: NodeId) -> DiscoveryResult<()>;

    fn grid_start_time(&self) -> Option<DateTime<Utc>>;

    fn is_client_mode(&self) -> bool;

    fn consistent_id(&self) -> String;

    fn capabilities(&self) -> DiscoveryCapabilities;
}

/// Discovery backed by a ZooKeeper-style coordination ensemble.
#[derive(Debug, Clone)]
pub struct ZkDiscovery {
    protocol: MembershipProtocol,
}

impl ZkDiscovery {
    pub const CAPABILITIES: DiscoveryCapabilities = DiscoveryCapabilities {
        multiple_instances: true,
        order: true,
        history: true,
    };

    /// Build a discovery component. Nothing is joined until [`Discovery::start`].
    pub fn new(
        config: DiscoveryConfig,
        connector: Arc<dyn EnsembleConnector>,
        listener: Arc<dyn DiscoveryListener>,
        exchange: Option<Arc<dyn DataExchange>>,
    ) -> DiscoveryResult<Self> {
        let exchange = exchange.unwrap_or_else(|| Arc::new(NoopDataExchange));
        let protocol = MembershipProtocol::new(config, connector, listener, exchange)?;
        Ok(Self { protocol })
    }

    pub fn protocol(&self) -> &MembershipProtocol {
        &self.protocol
    }

    pub fn state(&self) -> MembershipState {
        self.protocol.state()
    }

    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.protocol.topology()
    }
}

#[async_trait]
impl Discovery for ZkDiscovery {
    async fn start(&self) -> DiscoveryResult<Arc<NodeRecord>> {
        let config = self.protocol.config();
        info!(
            node_id = %config.node_id,
            client_mode = config.client_mode,
            session_timeout_ms = config.session_timeout.as_millis() as u64,
            "Starting discovery"
        );
        self.protocol.join_topology().await
    }

    async fn stop(&self) {
        self.protocol.stop().await;
    }

    async fn disconnect(&self) {
        self.protocol.disconnect().await;
    }

    fn local_node(&self) -> Option<Arc<NodeRecord>> {
        self.protocol.local_node()
    }

    fn remote_nodes(&self) -> Vec<Arc<NodeRecord>> {
        self.protocol.remote_nodes()
    }

    fn get_node(&self, id: NodeId) -> Option<Arc<NodeRecord>> {
        self.protocol.get_node(id)
    }

    async fn known_node(&self, id: NodeId) -> bool {
        self.protocol.known_node(id).await
    }

    async fn ping_node(&self, id: NodeId) -> bool {
        self.protocol.ping_node(id).await
    }

    async fn send_custom_event(&self, payload: Bytes) -> DiscoveryResult<u64> {
        self.protocol.send_custom_event(payload).await
    }

    async fn fail_node(&self, id: NodeId) -> DiscoveryResult<()> {
        self.protocol.fail_node(id).await
    }

    fn grid_start_time(&self) -> Option<DateTime<Utc>> {
        self.protocol.grid_start_time()
    }

    fn is_client_mode(&self) -> bool {
        self.protocol.config().client_mode
    }

    fn consistent_id(&self) -> String {
        self.protocol.config().effective_consistent_id()
    }

    fn capabilities(&self) -> DiscoveryCapabilities {
        Self::CAPABILITIES
    }
}
