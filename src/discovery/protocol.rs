//! Cluster membership on top of the coordination store.
//!
//! # Join
//!
//! 1. Verify (or, with `bootstrap_if_absent`, create) the cluster subtree.
//! 2. Read the cluster metadata and note the newest custom event, so only later
//!    events are delivered to this node.
//! 3. In one transaction, append the join-history entry and create the ephemeral
//!    liveness marker. Neither can be observed without the other.
//! 4. The marker's sequence suffix gives the join order (`sequence + 1`).
//! 5. On the notification context: report the local node, list the markers with a
//!    watch, and once the local marker shows up in the listing, arm the events watch
//!    and switch to `CONNECTED`.
//!
//! # Maintenance
//!
//! Every alive-children notification re-lists the markers (re-arming the watch in
//! the same call) and diffs them against the snapshot. Failures are delivered first,
//! then joins in ascending join order. Every member therefore reports joins in the
//! same order. A vanished marker is a failure; a clean leave looks the same.
//!
//! If the local marker disappears or the session is lost, the local node is cut off:
//! every remaining member, then the local node itself, is reported failed and the
//! protocol stops in `FAILED`. It never rejoins in place.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::error::{DiscoveryError, DiscoveryResult};
use super::listener::{DataExchange, DiscoveryListener};
use super::node::{ClusterData, CustomEventRecord, JoiningNodeData, NodeRecord};
use super::paths::{
    NodeChild, ZkPaths, bootstrap_cluster, child_name, decode_record, encode_record,
    node_child_name, parse_node_child, parse_sequence,
};
use super::topology::{TopologyHolder, TopologySnapshot};
use crate::config::DiscoveryConfig;
use crate::coordination::{
    ConnectionLostHook, CoordinationClient, CoordinationError, CreateMode, EnsembleConnector, Op,
    OpResult, SessionState, Watch, WatchKind, WatchedEvent,
};
use crate::metrics;
use crate::types::NodeId;

/// Lifecycle of one membership instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipState {
    NotStarted,
    Joining,
    /// Member of the cluster.
    Connected,
    /// Cut off from the cluster (session lost or evicted). Terminal.
    Failed,
    /// Stopped by its owner. Terminal.
    Left,
}

impl MembershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipState::NotStarted => "not_started",
            MembershipState::Joining => "joining",
            MembershipState::Connected => "connected",
            MembershipState::Failed => "failed",
            MembershipState::Left => "left",
        }
    }

    /// Whether the protocol still follows the store.
    pub fn is_active(&self) -> bool {
        matches!(self, MembershipState::Joining | MembershipState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MembershipState::Failed | MembershipState::Left)
    }

    pub fn can_transition_to(&self, next: MembershipState) -> bool {
        use MembershipState::*;
        matches!(
            (self, next),
            (NotStarted, Joining)
                | (NotStarted, Left)
                | (Joining, Connected)
                | (Joining, Failed)
                | (Joining, Left)
                | (Connected, Failed)
                | (Connected, Left)
        )
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum RefreshTarget {
    Alive,
    Events,
}

impl RefreshTarget {
    fn as_str(&self) -> &'static str {
        match self {
            RefreshTarget::Alive => "alive",
            RefreshTarget::Events => "events",
        }
    }
}

struct ProtocolInner {
    config: DiscoveryConfig,
    paths: ZkPaths,
    client: CoordinationClient,
    listener: Arc<dyn DiscoveryListener>,
    exchange: Arc<dyn DataExchange>,
    state: watch::Sender<MembershipState>,
    failure: Mutex<Option<CoordinationError>>,
    topology: TopologyHolder,
    local: RwLock<Option<Arc<NodeRecord>>>,
    cluster: RwLock<Option<ClusterData>>,
    next_event: Mutex<u64>,
    join_history: DashMap<NodeId, String>,
    alive_watch: Watch,
    events_watch: Watch,
}

/// Membership protocol for one node. Cheap to clone.
///
/// Owns its coordination session exclusively: it is opened in [`new`](Self::new) and
/// closed by [`stop`](Self::stop), by [`disconnect`](Self::disconnect), or when the
/// node is cut off.
#[derive(Clone)]
pub struct MembershipProtocol {
    inner: Arc<ProtocolInner>,
}

impl fmt::Debug for MembershipProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipProtocol")
            .field("node_id", &self.inner.config.node_id)
            .field("root", &self.inner.paths.root())
            .field("state", &self.state())
            .finish()
    }
}

impl MembershipProtocol {
    /// Validate `config` and start connecting to the ensemble.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: DiscoveryConfig,
        connector: Arc<dyn EnsembleConnector>,
        listener: Arc<dyn DiscoveryListener>,
        exchange: Arc<dyn DataExchange>,
    ) -> DiscoveryResult<Self> {
        config.validate().map_err(DiscoveryError::Config)?;
        let paths = ZkPaths::new(config.root_path.clone());
        let (state, _) = watch::channel(MembershipState::NotStarted);

        let inner = Arc::new_cyclic(move |weak: &Weak<ProtocolInner>| {
            let hook_target = weak.clone();
            let conn_lost: ConnectionLostHook = Box::new(move || {
                if let Some(inner) = hook_target.upgrade() {
                    inner.on_connection_lost();
                }
            });
            let client = CoordinationClient::new(
                connector,
                config.connect_string.clone(),
                config.session_timeout,
                Some(conn_lost),
            );
            ProtocolInner {
                alive_watch: refresh_watch(weak.clone(), RefreshTarget::Alive),
                events_watch: refresh_watch(weak.clone(), RefreshTarget::Events),
                config,
                paths,
                client,
                listener,
                exchange,
                state,
                failure: Mutex::new(None),
                topology: TopologyHolder::new(),
                local: RwLock::new(None),
                cluster: RwLock::new(None),
                next_event: Mutex::new(0),
                join_history: DashMap::new(),
            }
        });
        Ok(Self { inner })
    }

    /// Join the cluster and wait until the local node is part of its own topology.
    ///
    /// Only valid once, from `NOT_STARTED`. On failure the session is closed and the
    /// protocol ends in `FAILED`.
    pub async fn join_topology(&self) -> DiscoveryResult<Arc<NodeRecord>> {
        let inner = &self.inner;
        if !inner.transition(MembershipState::Joining) {
            return Err(DiscoveryError::InvalidState {
                op: "join_topology",
                state: self.state().to_string(),
            });
        }
        info!(
            node_id = %inner.config.node_id,
            root = inner.paths.root(),
            connect_string = %inner.config.connect_string,
            "Joining cluster"
        );

        let result = match inner.join().await {
            Ok(local) => inner.await_membership(local).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(local) => {
                metrics::record_join_attempt("ok");
                info!(
                    node_id = %local.id,
                    order = %local.order,
                    topology_size = inner.topology.load().len(),
                    "Joined cluster"
                );
            }
            Err(e) => {
                metrics::record_join_attempt("error");
                error!(node_id = %inner.config.node_id, error = %e, "Join failed");
                inner.transition(MembershipState::Failed);
                inner.client.close().await;
            }
        }
        result
    }

    /// Broadcast `payload` to every member, this one included.
    ///
    /// Returns the sequence number the ensemble assigned, which fixes the event's
    /// position in the total order.
    pub async fn send_custom_event(&self, payload: impl Into<Bytes>) -> DiscoveryResult<u64> {
        let local = self.inner.require_connected("send_custom_event")?;
        let record = CustomEventRecord {
            sequence: 0,
            sender: local.id,
            payload: payload.into(),
        };
        let path = self
            .inner
            .client
            .create(
                &self.inner.paths.event_prefix(),
                encode_record(&record)?,
                CreateMode::PersistentSequential,
            )
            .await?;
        let sequence = parse_sequence(child_name(&path))?;
        debug!(sequence, bytes = record.payload.len(), "Custom event published");
        Ok(sequence)
    }

    /// Force a remote member out of the cluster by deleting its liveness marker.
    ///
    /// Every member, the target included, then observes an ordinary failure.
    pub async fn fail_node(&self, id: NodeId) -> DiscoveryResult<()> {
        let local = self.inner.require_connected("fail_node")?;
        if id == local.id {
            return Err(DiscoveryError::Unsupported(
                "a node cannot evict itself; stop it instead".to_string(),
            ));
        }
        let record = self
            .topology()
            .by_id(id)
            .cloned()
            .ok_or(DiscoveryError::UnknownNode(id))?;
        let sequence = record.order.sequence().ok_or_else(|| {
            DiscoveryError::ProtocolViolation(format!("member {} has no join order", id))
        })?;
        let marker = self.inner.paths.alive_marker(&node_child_name(id, sequence));
        let removed = self.inner.client.delete_if_exists(&marker, None).await?;
        warn!(node_id = %id, order = %record.order, removed, "Evicting node");
        Ok(())
    }

    /// Leave the cluster. Peers observe the departure as a failure.
    ///
    /// Idempotent. No events are delivered locally.
    pub async fn stop(&self) {
        if self.inner.transition(MembershipState::Left) {
            info!(node_id = %self.inner.config.node_id, "Leaving cluster");
        }
        self.inner.client.close().await;
    }

    /// Drop the session abruptly, as if the connection were lost for good.
    ///
    /// Unlike [`stop`](Self::stop), the local listener observes the cut-off: every
    /// member, the local one last, is reported failed.
    pub async fn disconnect(&self) {
        warn!(node_id = %self.inner.config.node_id, "Disconnecting from cluster");
        self.inner.client.close().await;
        let inner = Arc::clone(&self.inner);
        self.inner.client.notify(async move {
            inner
                .segment(Some(CoordinationError::Closed), "disconnected")
                .await;
        });
    }

    pub fn state(&self) -> MembershipState {
        *self.inner.state.borrow()
    }

    /// Observe membership state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<MembershipState> {
        self.inner.state.subscribe()
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.inner.topology.load()
    }

    /// The local node's record, once the join transaction committed.
    pub fn local_node(&self) -> Option<Arc<NodeRecord>> {
        self.inner.local.read().clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn get_node(&self, id: NodeId) -> Option<Arc<NodeRecord>> {
        self.topology().by_id(id).cloned()
    }

    /// Members other than the local node, in join order.
    pub fn remote_nodes(&self) -> Vec<Arc<NodeRecord>> {
        self.topology().remote_nodes()
    }

    /// Whether the store currently holds a liveness marker for `id`.
    ///
    /// Asks the store rather than the snapshot. Failures are logged and reported as
    /// `false`.
    pub async fn known_node(&self, id: NodeId) -> bool {
        match self
            .inner
            .client
            .get_children(self.inner.paths.alive(), None)
            .await
        {
            Ok(children) => children
                .iter()
                .filter_map(|name| parse_node_child(name).ok())
                .any(|child| child.node_id == id),
            Err(e) => {
                warn!(node_id = %id, error = %e, "Failed to list alive markers");
                false
            }
        }
    }

    /// Whether `id` is a member and its liveness marker still exists.
    pub async fn ping_node(&self, id: NodeId) -> bool {
        let Some(record) = self.get_node(id) else {
            return false;
        };
        if record.local {
            return self.state() == MembershipState::Connected;
        }
        let Some(sequence) = record.order.sequence() else {
            return false;
        };
        let marker = self.inner.paths.alive_marker(&node_child_name(id, sequence));
        match self.inner.client.exists(&marker, None).await {
            Ok(stat) => stat.is_some(),
            Err(e) => {
                debug!(node_id = %id, error = %e, "Ping failed");
                false
            }
        }
    }

    /// When the cluster structure was first created.
    pub fn grid_start_time(&self) -> Option<DateTime<Utc>> {
        (*self.inner.cluster.read()).and_then(|c| c.start_time_utc())
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    /// The coordination client this protocol owns.
    pub fn client(&self) -> &CoordinationClient {
        &self.inner.client
    }
}

fn refresh_watch(inner: Weak<ProtocolInner>, target: RefreshTarget) -> Watch {
    Watch::new(move |event: WatchedEvent| {
        let inner = inner.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            debug!(target = target.as_str(), kind = %event.kind, path = %event.path, "Refreshing");
            match target {
                RefreshTarget::Alive => inner.refresh_alive().await,
                RefreshTarget::Events => inner.refresh_events().await,
            }
        }
    })
}

impl ProtocolInner {
    fn state(&self) -> MembershipState {
        *self.state.borrow()
    }

    fn transition(&self, next: MembershipState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "Membership state transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn local(&self) -> Option<Arc<NodeRecord>> {
        self.local.read().clone()
    }

    fn require_connected(&self, op: &'static str) -> DiscoveryResult<Arc<NodeRecord>> {
        let state = self.state();
        match (state, self.local()) {
            (MembershipState::Connected, Some(local)) => Ok(local),
            _ => Err(DiscoveryError::InvalidState {
                op,
                state: state.to_string(),
            }),
        }
    }

    async fn join(&self) -> DiscoveryResult<Arc<NodeRecord>> {
        let paths = &self.paths;
        let cluster = if self.config.bootstrap_if_absent {
            bootstrap_cluster(&self.client, paths).await?
        } else {
            self.verify_structure().await?;
            let (raw, _) = self.client.get_data(paths.cluster(), None).await?;
            decode_record(&raw)?
        };
        *self.cluster.write() = Some(cluster);

        let next_event = self.event_baseline().await?;
        *self.next_event.lock() = next_event;

        let node_id = self.config.node_id;
        let joining = JoiningNodeData {
            node_id,
            consistent_id: self.config.effective_consistent_id(),
            attributes: self.config.attributes.clone(),
            version: self.config.version,
            client: self.config.client_mode,
            exchange: self.exchange.collect(node_id),
        };
        let results = self
            .client
            .multi(vec![
                Op::create(
                    paths.join_history_prefix(node_id),
                    encode_record(&joining)?,
                    CreateMode::PersistentSequential,
                ),
                Op::create(
                    paths.alive_marker_prefix(node_id),
                    Bytes::new(),
                    CreateMode::EphemeralSequential,
                ),
            ])
            .await?;

        let created = |idx: usize| {
            results
                .get(idx)
                .and_then(OpResult::created_path)
                .map(|path| child_name(path).to_string())
                .ok_or_else(|| {
                    DiscoveryError::ProtocolViolation(
                        "join transaction returned no created path".to_string(),
                    )
                })
        };
        let history_name = created(0)?;
        let marker_name = created(1)?;
        let marker = parse_node_child(&marker_name)?;
        self.join_history.insert(node_id, history_name);
        self.remove_stale_markers(node_id, &marker_name).await?;

        let local = Arc::new(NodeRecord {
            order: marker.order(),
            id: node_id,
            attributes: joining.attributes,
            version: joining.version,
            client: joining.client,
            consistent_id: joining.consistent_id,
            local: true,
        });
        *self.local.write() = Some(Arc::clone(&local));
        info!(
            node_id = %node_id,
            order = %local.order,
            marker = %marker_name,
            "Join transaction committed"
        );

        let listener = Arc::clone(&self.listener);
        let initialized = Arc::clone(&local);
        self.client.notify(async move {
            metrics::record_membership_event("local_initialized");
            listener.on_local_node_initialized(initialized).await;
        });
        self.client.notify(self.alive_watch.trigger(WatchedEvent {
            kind: WatchKind::NodeChildrenChanged,
            path: paths.alive().to_string(),
        }));
        Ok(local)
    }

    async fn verify_structure(&self) -> DiscoveryResult<()> {
        let paths = &self.paths;
        for path in [
            paths.root(),
            paths.cluster(),
            paths.join_history(),
            paths.alive(),
            paths.events(),
        ] {
            if self.client.exists(path, None).await?.is_none() {
                warn!(path, "Cluster structure missing");
                return Err(DiscoveryError::ClusterNotInitialized {
                    root: paths.root().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Sequence of the first custom event this node should see.
    async fn event_baseline(&self) -> DiscoveryResult<u64> {
        let children = self.client.get_children(self.paths.events(), None).await?;
        Ok(children
            .iter()
            .filter_map(|name| parse_sequence(name).ok())
            .max()
            .map_or(0, |newest| newest + 1))
    }

    /// Drop markers left under our id by a retried join or an earlier incarnation.
    async fn remove_stale_markers(&self, node_id: NodeId, keep: &str) -> DiscoveryResult<()> {
        let children = self.client.get_children(self.paths.alive(), None).await?;
        for name in children {
            if name == keep {
                continue;
            }
            if matches!(parse_node_child(&name), Ok(child) if child.node_id == node_id) {
                warn!(marker = %name, "Removing stale alive marker");
                self.client
                    .delete_if_exists(&self.paths.alive_marker(&name), None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn await_membership(&self, local: Arc<NodeRecord>) -> DiscoveryResult<Arc<NodeRecord>> {
        let timeout = self.config.join_timeout;
        let mut rx = self.state.subscribe();
        let outcome = match tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != MembershipState::Joining),
        )
        .await
        {
            Err(_) => None,
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => Some(MembershipState::Failed),
        };
        match outcome {
            None => Err(DiscoveryError::JoinTimedOut(timeout)),
            Some(MembershipState::Connected) => Ok(local),
            Some(state) => match self.failure.lock().clone() {
                Some(cause) => Err(DiscoveryError::Coordination(cause)),
                None => Err(DiscoveryError::InvalidState {
                    op: "join_topology",
                    state: state.to_string(),
                }),
            },
        }
    }

    async fn refresh_alive(self: &Arc<Self>) {
        if !self.state().is_active() {
            return;
        }
        let listed = self
            .client
            .get_children(self.paths.alive(), Some(self.alive_watch.clone()))
            .await;
        let result = match listed {
            Ok(children) => self.apply_alive(children).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.handle_refresh_error(RefreshTarget::Alive, e).await;
        }
    }

    async fn apply_alive(self: &Arc<Self>, children: Vec<String>) -> DiscoveryResult<()> {
        let Some(local) = self.local() else {
            return Ok(());
        };

        let mut live = BTreeMap::new();
        for name in &children {
            match parse_node_child(name) {
                Ok(child) if child.node_id == local.id && child.order() != local.order => {
                    debug!(marker = %name, "Skipping stale local marker");
                }
                Ok(child) => {
                    live.insert(child.order(), child);
                }
                Err(e) => error!(marker = %name, error = %e, "Ignoring foreign alive marker"),
            }
        }

        let diff = self.topology.load().diff(&live);
        if diff.local_lost {
            self.segment(None, "local alive marker removed").await;
            return Ok(());
        }
        if self.state() == MembershipState::Joining && !live.contains_key(&local.order) {
            debug!(order = %local.order, "Local marker not listed yet");
        }

        for node in diff.failed {
            if !self.state().is_active() {
                return Ok(());
            }
            self.join_history.remove(&node.id);
            self.deliver_failed(node).await;
        }

        for child in diff.joined {
            if !self.state().is_active() {
                return Ok(());
            }
            if child.node_id == local.id {
                self.complete_join(&local).await;
                continue;
            }
            let data = self.load_join_data(child).await?;
            self.exchange.on_exchange(child.node_id, data.exchange.clone());
            let node = Arc::new(NodeRecord::from_join_data(child.order(), &data));
            let topology = self
                .topology
                .publish(self.topology.load().with_joined(Arc::clone(&node)));
            metrics::record_membership_event("joined");
            info!(
                node_id = %node.id,
                order = %node.order,
                topology_version = topology.version(),
                "Node joined"
            );
            self.listener.on_node_joined(node, topology).await;
        }
        Ok(())
    }

    async fn complete_join(self: &Arc<Self>, local: &Arc<NodeRecord>) {
        let topology = self
            .topology
            .publish(self.topology.load().with_joined(Arc::clone(local)));
        self.refresh_events().await;
        if self.transition(MembershipState::Connected) {
            debug!(
                order = %local.order,
                topology_version = topology.version(),
                "Local node visible in topology"
            );
        }
    }

    async fn load_join_data(&self, child: NodeChild) -> DiscoveryResult<JoiningNodeData> {
        let cached = self.join_history.get(&child.node_id).map(|e| e.value().clone());
        let name = match cached {
            Some(name) => name,
            None => {
                self.index_join_history().await?;
                let indexed = self.join_history.get(&child.node_id).map(|e| e.value().clone());
                indexed.ok_or_else(|| {
                    metrics::record_protocol_violation("missing_join_history");
                    DiscoveryError::ProtocolViolation(format!(
                        "no join-history entry for node {}",
                        child.node_id
                    ))
                })?
            }
        };
        let (raw, _) = self
            .client
            .get_data(&self.paths.join_history_entry(&name), None)
            .await?;
        let data: JoiningNodeData = decode_record(&raw)?;
        if data.node_id != child.node_id {
            metrics::record_protocol_violation("join_history_mismatch");
            return Err(DiscoveryError::ProtocolViolation(format!(
                "join-history entry {} belongs to {}, expected {}",
                name, data.node_id, child.node_id
            )));
        }
        Ok(data)
    }

    async fn index_join_history(&self) -> DiscoveryResult<()> {
        let children = self
            .client
            .get_children(self.paths.join_history(), None)
            .await?;
        for name in children {
            match parse_node_child(&name) {
                Ok(child) => {
                    // A reused node id keeps every earlier entry; the newest one wins.
                    let mut entry = self
                        .join_history
                        .entry(child.node_id)
                        .or_insert_with(|| name.clone());
                    let newer = parse_node_child(entry.value())
                        .map_or(true, |cached| cached.sequence < child.sequence);
                    if newer {
                        *entry.value_mut() = name;
                    }
                }
                Err(e) => error!(entry = %name, error = %e, "Ignoring foreign join-history entry"),
            }
        }
        Ok(())
    }

    async fn refresh_events(self: &Arc<Self>) {
        if !self.state().is_active() {
            return;
        }
        let listed = self
            .client
            .get_children(self.paths.events(), Some(self.events_watch.clone()))
            .await;
        let result = match listed {
            Ok(children) => self.apply_events(children).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.handle_refresh_error(RefreshTarget::Events, e).await;
        }
    }

    async fn apply_events(&self, children: Vec<String>) -> DiscoveryResult<()> {
        let next = *self.next_event.lock();
        let mut pending: Vec<(u64, &str)> = children
            .iter()
            .filter_map(|name| match parse_sequence(name) {
                Ok(sequence) if sequence >= next => Some((sequence, name.as_str())),
                Ok(_) => None,
                Err(e) => {
                    error!(event = %name, error = %e, "Ignoring foreign event entry");
                    None
                }
            })
            .collect();
        pending.sort_unstable();

        for (sequence, name) in pending {
            if !self.state().is_active() {
                break;
            }
            let (raw, _) = self.client.get_data(&self.paths.event(name), None).await?;
            *self.next_event.lock() = sequence + 1;
            let mut event: CustomEventRecord = match decode_record(&raw) {
                Ok(event) => event,
                Err(e) => {
                    error!(sequence, error = %e, "Skipping undecodable custom event");
                    continue;
                }
            };
            event.sequence = sequence;
            let topology = self.topology.load();
            let sender = topology.by_id(event.sender).cloned();
            metrics::record_membership_event("custom");
            debug!(sequence, sender = %event.sender, "Delivering custom event");
            self.listener.on_custom_event(event, sender, topology).await;
        }
        Ok(())
    }

    async fn handle_refresh_error(self: &Arc<Self>, target: RefreshTarget, err: DiscoveryError) {
        match err {
            DiscoveryError::Coordination(cause) if cause.is_permanent() => {
                self.segment(Some(cause), "coordination session unusable")
                    .await;
            }
            DiscoveryError::Coordination(cause) if cause.is_timed_out() => {
                warn!(target = target.as_str(), error = %cause, "Refresh timed out, retrying");
                let (watch, path) = match target {
                    RefreshTarget::Alive => (&self.alive_watch, self.paths.alive()),
                    RefreshTarget::Events => (&self.events_watch, self.paths.events()),
                };
                self.client.notify(watch.trigger(WatchedEvent {
                    kind: WatchKind::NodeChildrenChanged,
                    path: path.to_string(),
                }));
            }
            other => {
                error!(target = target.as_str(), error = %other, "Refresh failed");
            }
        }
    }

    async fn deliver_failed(&self, node: Arc<NodeRecord>) {
        let topology = self
            .topology
            .publish(self.topology.load().with_failed(node.order));
        metrics::record_membership_event("failed");
        info!(
            node_id = %node.id,
            order = %node.order,
            local = node.local,
            topology_version = topology.version(),
            "Node failed"
        );
        self.listener.on_node_failed(node, topology).await;
    }

    /// Cut the local node off: report every member failed, the local one last.
    async fn segment(&self, cause: Option<CoordinationError>, reason: &'static str) {
        if !self.transition(MembershipState::Failed) {
            return;
        }
        if let Some(cause) = cause {
            *self.failure.lock() = Some(cause);
        }
        warn!(node_id = %self.config.node_id, reason, "Local node segmented from the cluster");

        for node in self.topology.load().remote_nodes() {
            self.deliver_failed(node).await;
        }
        let local = self.topology.load().local_node().cloned();
        if let Some(local) = local {
            self.deliver_failed(local).await;
        }
        self.client.close().await;
    }

    /// Runs on the notification context once the session is gone for good.
    fn on_connection_lost(self: &Arc<Self>) {
        let cause = match self.client.state() {
            SessionState::Expired => CoordinationError::SessionExpired,
            SessionState::Closed => CoordinationError::Closed,
            _ => CoordinationError::ConnectionFailed("coordination session lost".to_string()),
        };
        let inner = Arc::clone(self);
        self.client.notify(async move {
            inner.segment(Some(cause), "coordination session lost").await;
        });
    }
}
