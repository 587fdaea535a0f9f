//! In-process coordination ensemble for testing.
//!
//! `MemoryEnsemble` models the parts of a ZooKeeper-style ensemble that the
//! coordination client and membership protocol depend on:
//!
//! - A replicated node tree with persistent, ephemeral and sequential nodes
//! - Several servers, each of which can be stopped and restarted
//! - Majority quorum: with fewer than half the servers up, no session is served
//! - Sessions bound to one server at a time, failing over to another server listed
//!   in their connect string
//! - Session expiry once a session stays disconnected past its timeout while the
//!   ensemble has quorum; its ephemeral nodes are removed and watches fire
//! - One-shot child and data watches, held back while the owning session is
//!   disconnected and delivered after it reconnects
//!
//! Sequence suffixes count sequential creates under each parent, starting at 0.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! zkdiscovery = { path = ".", features = ["test-utilities"] }
//! ```
//!
//! A supervisor task runs on the current Tokio runtime, so [`MemoryEnsemble::new`]
//! must be called from within one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info};

use super::ensemble::{
    CreateMode, EnsembleConnector, EnsembleError, EnsembleResult, EnsembleSession, Op, OpResult,
    SessionEvent, SessionEvents, SessionId, Stat, WatchKind, WatchedEvent,
};
use crate::constants::SEQUENCE_DIGITS;

const SUPERVISOR_TICK: Duration = Duration::from_millis(25);
const FIRST_PORT: u16 = 21810;

#[derive(Debug, Clone)]
struct ZNode {
    data: Bytes,
    version: i32,
    ephemeral_owner: Option<SessionId>,
    ctime: i64,
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Bytes, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            ctime: Utc::now().timestamp_millis(),
            next_sequence: 0,
        }
    }
}

type Tree = BTreeMap<String, ZNode>;

#[derive(Debug)]
struct Server {
    name: String,
    up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Live,
    Closed,
    Expired,
}

#[derive(Debug)]
struct SessionSlot {
    timeout: Duration,
    allowed: Vec<usize>,
    server: Option<usize>,
    disconnected_since: Option<Instant>,
    status: SlotStatus,
    child_watches: HashSet<String>,
    data_watches: HashSet<String>,
    pending: Vec<SessionEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionSlot {
    fn deliver(&mut self, event: SessionEvent) {
        if self.status != SlotStatus::Live {
            return;
        }
        if self.server.is_some() {
            let _ = self.events.send(event);
        } else {
            self.pending.push(event);
        }
    }

    fn take_watches(&mut self, trigger: &Trigger) -> Vec<WatchedEvent> {
        let mut fired = Vec::new();
        match trigger {
            Trigger::Created(path) => {
                if self.data_watches.remove(path) {
                    fired.push(watched(WatchKind::NodeCreated, path));
                }
                let parent = parent_of(path);
                if self.child_watches.remove(parent) {
                    fired.push(watched(WatchKind::NodeChildrenChanged, parent));
                }
            }
            Trigger::Deleted(path) => {
                let data = self.data_watches.remove(path);
                let child = self.child_watches.remove(path);
                if data || child {
                    fired.push(watched(WatchKind::NodeDeleted, path));
                }
                let parent = parent_of(path);
                if self.child_watches.remove(parent) {
                    fired.push(watched(WatchKind::NodeChildrenChanged, parent));
                }
            }
            Trigger::DataChanged(path) => {
                if self.data_watches.remove(path) {
                    fired.push(watched(WatchKind::NodeDataChanged, path));
                }
            }
        }
        fired
    }
}

fn watched(kind: WatchKind, path: &str) -> WatchedEvent {
    WatchedEvent {
        kind,
        path: path.to_string(),
    }
}

#[derive(Debug)]
enum Trigger {
    Created(String),
    Deleted(String),
    DataChanged(String),
}

#[derive(Debug)]
struct State {
    servers: Vec<Server>,
    tree: Tree,
    sessions: HashMap<SessionId, SessionSlot>,
    next_session: SessionId,
}

impl State {
    fn has_quorum(&self) -> bool {
        let up = self.servers.iter().filter(|s| s.up).count();
        up * 2 > self.servers.len()
    }

    fn check_available(&self, id: SessionId) -> EnsembleResult<()> {
        let slot = self
            .sessions
            .get(&id)
            .ok_or(EnsembleError::SessionExpired)?;
        match slot.status {
            SlotStatus::Expired => Err(EnsembleError::SessionExpired),
            SlotStatus::Closed => Err(EnsembleError::SessionClosed),
            SlotStatus::Live if slot.server.is_none() => Err(EnsembleError::ConnectionLoss),
            SlotStatus::Live => Ok(()),
        }
    }

    fn fire(&mut self, triggers: Vec<Trigger>) {
        for trigger in &triggers {
            for slot in self.sessions.values_mut() {
                for event in slot.take_watches(trigger) {
                    slot.deliver(SessionEvent::Watch(event));
                }
            }
        }
    }

    fn disconnect(&mut self, id: SessionId, now: Instant) {
        if let Some(slot) = self.sessions.get_mut(&id) {
            if slot.server.take().is_some() {
                slot.disconnected_since = Some(now);
                if slot.status == SlotStatus::Live {
                    let _ = slot.events.send(SessionEvent::Disconnected);
                }
                debug!(session_id = id, "Memory ensemble disconnected session");
            }
        }
    }

    fn reconnect(&mut self, id: SessionId, server: usize) {
        if let Some(slot) = self.sessions.get_mut(&id) {
            slot.server = Some(server);
            slot.disconnected_since = None;
            let _ = slot.events.send(SessionEvent::Connected);
            for event in slot.pending.drain(..) {
                let _ = slot.events.send(event);
            }
            debug!(session_id = id, server, "Memory ensemble reconnected session");
        }
    }

    fn remove_ephemerals(&mut self, id: SessionId) {
        let owned: Vec<String> = self
            .tree
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        let mut triggers = Vec::with_capacity(owned.len());
        for path in owned {
            self.tree.remove(&path);
            triggers.push(Trigger::Deleted(path));
        }
        self.fire(triggers);
    }

    fn expire(&mut self, id: SessionId) {
        let Some(slot) = self.sessions.get_mut(&id) else {
            return;
        };
        let was_live = slot.status == SlotStatus::Live;
        slot.status = SlotStatus::Expired;
        slot.server = None;
        slot.pending.clear();
        slot.child_watches.clear();
        slot.data_watches.clear();
        if was_live {
            let _ = slot.events.send(SessionEvent::Expired);
        }
        info!(session_id = id, "Memory ensemble expired session");
        self.remove_ephemerals(id);
    }

    /// Drop sessions from servers that can no longer serve them.
    fn enforce_availability(&mut self, now: Instant) {
        let quorum = self.has_quorum();
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, slot)| match slot.server {
                Some(server) => !quorum || !self.servers[server].up,
                None => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.disconnect(id, now);
        }
    }

    fn tick(&mut self, now: Instant) {
        self.enforce_availability(now);
        if !self.has_quorum() {
            return;
        }

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            let Some(slot) = self.sessions.get(&id) else {
                continue;
            };
            if slot.status == SlotStatus::Expired || slot.server.is_some() {
                continue;
            }
            let Some(since) = slot.disconnected_since else {
                continue;
            };
            if now.duration_since(since) >= slot.timeout {
                self.expire(id);
                continue;
            }
            if slot.status == SlotStatus::Closed {
                continue;
            }
            let target = slot
                .allowed
                .iter()
                .copied()
                .find(|idx| self.servers[*idx].up);
            if let Some(server) = target {
                self.reconnect(id, server);
            }
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn validate_path(path: &str) -> EnsembleResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(EnsembleError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn children_of(tree: &Tree, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    };
    tree.range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

fn stat_of(tree: &Tree, path: &str, node: &ZNode) -> Stat {
    Stat {
        version: node.version,
        num_children: children_of(tree, path).len(),
        ephemeral_owner: node.ephemeral_owner,
        ctime: node.ctime,
    }
}

fn check_version(path: &str, node: &ZNode, expected: Option<i32>) -> EnsembleResult<()> {
    match expected {
        Some(v) if v != node.version => Err(EnsembleError::BadVersion(path.to_string())),
        _ => Ok(()),
    }
}

fn create_node(
    tree: &mut Tree,
    path: &str,
    data: Bytes,
    mode: CreateMode,
    owner: SessionId,
    triggers: &mut Vec<Trigger>,
) -> EnsembleResult<String> {
    if !path.starts_with('/') || path == "/" {
        return Err(EnsembleError::InvalidPath(path.to_string()));
    }
    let parent = parent_of(path).to_string();
    let parent_node = tree
        .get(&parent)
        .ok_or_else(|| EnsembleError::NoNode(parent.clone()))?;
    if parent_node.ephemeral_owner.is_some() {
        return Err(EnsembleError::NoChildrenForEphemerals(parent));
    }

    let actual = if mode.is_sequential() {
        format!(
            "{}{:0width$}",
            path,
            parent_node.next_sequence,
            width = SEQUENCE_DIGITS
        )
    } else {
        path.to_string()
    };
    validate_path(&actual)?;
    if tree.contains_key(&actual) {
        return Err(EnsembleError::NodeExists(actual));
    }

    if mode.is_sequential() {
        if let Some(parent_node) = tree.get_mut(&parent) {
            parent_node.next_sequence += 1;
        }
    }
    let ephemeral_owner = mode.is_ephemeral().then_some(owner);
    tree.insert(actual.clone(), ZNode::new(data, ephemeral_owner));
    triggers.push(Trigger::Created(actual.clone()));
    Ok(actual)
}

fn delete_node(
    tree: &mut Tree,
    path: &str,
    version: Option<i32>,
    triggers: &mut Vec<Trigger>,
) -> EnsembleResult<()> {
    validate_path(path)?;
    if path == "/" {
        return Err(EnsembleError::InvalidPath(path.to_string()));
    }
    let node = tree
        .get(path)
        .ok_or_else(|| EnsembleError::NoNode(path.to_string()))?;
    check_version(path, node, version)?;
    if !children_of(tree, path).is_empty() {
        return Err(EnsembleError::NotEmpty(path.to_string()));
    }
    tree.remove(path);
    triggers.push(Trigger::Deleted(path.to_string()));
    Ok(())
}

fn set_node_data(
    tree: &mut Tree,
    path: &str,
    data: Bytes,
    version: Option<i32>,
    triggers: &mut Vec<Trigger>,
) -> EnsembleResult<Stat> {
    validate_path(path)?;
    let node = tree
        .get_mut(path)
        .ok_or_else(|| EnsembleError::NoNode(path.to_string()))?;
    check_version(path, node, version)?;
    node.data = data;
    node.version += 1;
    let node = node.clone();
    triggers.push(Trigger::DataChanged(path.to_string()));
    Ok(stat_of(tree, path, &node))
}

fn apply_op(
    tree: &mut Tree,
    op: Op,
    owner: SessionId,
    triggers: &mut Vec<Trigger>,
) -> EnsembleResult<OpResult> {
    match op {
        Op::Create { path, data, mode } => {
            create_node(tree, &path, data, mode, owner, triggers).map(OpResult::Created)
        }
        Op::Delete { path, version } => {
            delete_node(tree, &path, version, triggers).map(|_| OpResult::Deleted)
        }
        Op::SetData {
            path,
            data,
            version,
        } => set_node_data(tree, &path, data, version, triggers)
            .map(|stat| OpResult::DataSet(stat.version)),
        Op::Check { path, version } => {
            let node = tree
                .get(&path)
                .ok_or_else(|| EnsembleError::NoNode(path.clone()))?;
            check_version(&path, node, version)?;
            Ok(OpResult::Checked)
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    wake: Notify,
}

/// In-process multi-server ensemble.
///
/// Cloning yields another handle to the same ensemble.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    shared: Arc<Shared>,
}

impl MemoryEnsemble {
    /// Start an ensemble of `servers` members, all up.
    ///
    /// Server `i` is addressed as `127.0.0.1:<21810 + i>` in connect strings.
    pub fn new(servers: usize) -> Self {
        let servers = (0..servers.max(1))
            .map(|idx| Server {
                name: format!("127.0.0.1:{}", FIRST_PORT as usize + idx),
                up: true,
            })
            .collect();

        let mut tree = Tree::new();
        tree.insert("/".to_string(), ZNode::new(Bytes::new(), None));

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                servers,
                tree,
                sessions: HashMap::new(),
                next_session: 1,
            }),
            wake: Notify::new(),
        });

        tokio::spawn(supervise(Arc::downgrade(&shared)));

        Self { shared }
    }

    /// Connect string listing every server.
    pub fn connect_string(&self) -> String {
        let state = self.shared.state.lock();
        state
            .servers
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Connect string listing only server `idx`.
    pub fn server_connect_string(&self, idx: usize) -> String {
        let state = self.shared.state.lock();
        state
            .servers
            .get(idx)
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    /// Number of servers in the ensemble.
    pub fn server_count(&self) -> usize {
        self.shared.state.lock().servers.len()
    }

    /// Stop server `idx`. Sessions it served lose their connection.
    pub fn stop_server(&self, idx: usize) {
        let mut state = self.shared.state.lock();
        if let Some(server) = state.servers.get_mut(idx) {
            server.up = false;
            info!(server = %server.name, "Memory ensemble server stopped");
        }
        state.enforce_availability(Instant::now());
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Start server `idx` again.
    pub fn start_server(&self, idx: usize) {
        let mut state = self.shared.state.lock();
        if let Some(server) = state.servers.get_mut(idx) {
            server.up = true;
            info!(server = %server.name, "Memory ensemble server started");
        }
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Stop and immediately start server `idx`.
    pub fn restart_server(&self, idx: usize) {
        self.stop_server(idx);
        self.start_server(idx);
    }

    /// Stop every server.
    pub fn stop_all(&self) {
        let count = self.server_count();
        for idx in 0..count {
            self.stop_server(idx);
        }
    }

    /// Start every server.
    pub fn start_all(&self) {
        let count = self.server_count();
        for idx in 0..count {
            self.start_server(idx);
        }
    }

    /// Whether a majority of servers is up.
    pub fn has_quorum(&self) -> bool {
        self.shared.state.lock().has_quorum()
    }

    /// Expire session `id` right away, as if its timeout had elapsed.
    pub fn expire_session(&self, id: SessionId) {
        self.shared.state.lock().expire(id);
    }

    /// Whether a node exists at `path`.
    pub fn node_exists(&self, path: &str) -> bool {
        self.shared.state.lock().tree.contains_key(path)
    }

    /// Sorted child names of `path`.
    pub fn children(&self, path: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        children_of(&state.tree, path)
    }

    /// Data stored at `path`.
    pub fn data(&self, path: &str) -> Option<Bytes> {
        let state = self.shared.state.lock();
        state.tree.get(path).map(|node| node.data.clone())
    }

    /// Shareable connector for this ensemble.
    pub fn connector(&self) -> Arc<dyn EnsembleConnector> {
        Arc::new(self.clone())
    }
}

async fn supervise(shared: Weak<Shared>) {
    loop {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.state.lock().tick(Instant::now());
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(SUPERVISOR_TICK) => {}
        }
    }
}

#[async_trait]
impl EnsembleConnector for MemoryEnsemble {
    async fn connect(
        &self,
        connect_string: &str,
        session_timeout: Duration,
    ) -> EnsembleResult<(Arc<dyn EnsembleSession>, SessionEvents)> {
        let mut state = self.shared.state.lock();
        let allowed: Vec<usize> = connect_string
            .split(',')
            .map(str::trim)
            .filter_map(|name| state.servers.iter().position(|s| s.name == name))
            .collect();
        if !state.has_quorum() {
            return Err(EnsembleError::ConnectionLoss);
        }
        let server = allowed
            .iter()
            .copied()
            .find(|idx| state.servers[*idx].up)
            .ok_or(EnsembleError::ConnectionLoss)?;

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Connected);
        state.sessions.insert(
            id,
            SessionSlot {
                timeout: session_timeout,
                allowed,
                server: Some(server),
                disconnected_since: None,
                status: SlotStatus::Live,
                child_watches: HashSet::new(),
                data_watches: HashSet::new(),
                pending: Vec::new(),
                events: tx,
            },
        );
        debug!(session_id = id, server, "Memory ensemble opened session");

        let session = MemorySession {
            id,
            shared: Arc::clone(&self.shared),
        };
        Ok((Arc::new(session), rx))
    }
}

/// Session handle returned by [`MemoryEnsemble`].
#[derive(Debug)]
struct MemorySession {
    id: SessionId,
    shared: Arc<Shared>,
}

#[async_trait]
impl EnsembleSession for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> EnsembleResult<String> {
        let mut state = self.shared.state.lock();
        state.check_available(self.id)?;
        let mut triggers = Vec::new();
        let created = create_node(&mut state.tree, path, data, mode, self.id, &mut triggers)?;
        state.fire(triggers);
        Ok(created)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> EnsembleResult<()> {
        let mut state = self.shared.state.lock();
        state.check_available(self.id)?;
        let mut triggers = Vec::new();
        delete_node(&mut state.tree, path, version, &mut triggers)?;
        state.fire(triggers);
        Ok(())
    }

    async fn exists(&self, path: &str, watch: bool) -> EnsembleResult<Option<Stat>> {
        let mut state = self.shared.state.lock();
        state.check_available(self.id)?;
        validate_path(path)?;
        let stat = state
            .tree
            .get(path)
            .map(|node| stat_of(&state.tree, path, node));
        if watch {
            if let Some(slot) = state.sessions.get_mut(&self.id) {
                slot.data_watches.insert(path.to_string());
            }
        }
        Ok(stat)
    }

    async fn get_data(&self, path: &str, watch: bool) -> EnsembleResult<(Bytes, Stat)> {
        let mut state = self.shared.state.lock();
        state.check_available(self.id)?;
        validate_path(path)?;
        let node = state
            .tree
            .get(path)
            .ok_or_else(|| EnsembleError::NoNode(path.to_string()))?;
        let result = (node.data.clone(), stat_of(&state.tree, path, node));
        if watch {
            if let Some(slot) = state.sessions.get_mut(&self.id) {
                slot.data_watches.insert(path.to_string());
            }
        }
        Ok(result)
    }

    async fn set_data(
        &self,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> EnsembleResult<Stat> {
        let mut state = self.shared.state.lock();
        state.check_available(self.id)?;
        let mut triggers = Vec::new();
        let stat = set_node_data(&mut state.tree, path, data, version, &mut triggers)?;
        state.fire(triggers);
        Ok(stat)
    }

    async fn get_children(&self, path: &str, watch: bool) -> EnsembleResult<Vec<String>> {
        let mut state = self.shared.state.lock();
        state.check_available(self.id)?;
        validate_path(path)?;
        if !state.tree.contains_key(path) {
            return Err(EnsembleError::NoNode(path.to_string()));
        }
        let children = children_of(&state.tree, path);
        if watch {
            if let Some(slot) = state.sessions.get_mut(&self.id) {
                slot.child_watches.insert(path.to_string());
            }
        }
        Ok(children)
    }

    async fn multi(&self, ops: Vec<Op>) -> EnsembleResult<Vec<OpResult>> {
        let mut state = self.shared.state.lock();
        state.check_available(self.id)?;
        let mut staged = state.tree.clone();
        let mut triggers = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(apply_op(&mut staged, op, self.id, &mut triggers)?);
        }
        state.tree = staged;
        state.fire(triggers);
        Ok(results)
    }

    async fn close(&self) -> EnsembleResult<()> {
        let mut state = self.shared.state.lock();
        let Some(slot) = state.sessions.get_mut(&self.id) else {
            return Ok(());
        };
        match slot.status {
            SlotStatus::Expired => return Err(EnsembleError::SessionExpired),
            SlotStatus::Closed => return Ok(()),
            SlotStatus::Live => {}
        }
        slot.status = SlotStatus::Closed;
        slot.pending.clear();
        slot.child_watches.clear();
        slot.data_watches.clear();
        let connected = slot.server.is_some();
        // Replace the sender so the owner's event stream ends.
        let (closed_tx, _) = mpsc::unbounded_channel();
        slot.events = closed_tx;

        if connected {
            slot.server = None;
            state.remove_ephemerals(self.id);
            debug!(session_id = self.id, "Memory ensemble closed session");
        } else {
            debug!(
                session_id = self.id,
                "Memory ensemble session closed while disconnected, ephemerals expire later"
            );
        }
        Ok(())
    }
}
