//! In-memory view of the live cluster members.
//!
//! A [`TopologySnapshot`] is immutable. The membership protocol is the only writer: it
//! derives a new snapshot per delivered event and publishes it through
//! [`TopologyHolder`], so readers never hold a lock across listener callbacks and
//! never observe a half-applied change.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::node::NodeRecord;
use super::paths::NodeChild;
use crate::metrics;
use crate::types::{NodeId, NodeOrder};

/// Members ordered by join order, plus a version bumped on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    version: u64,
    nodes: BTreeMap<NodeOrder, Arc<NodeRecord>>,
}

impl TopologySnapshot {
    /// Empty topology at version 0.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Members in ascending join order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeRecord>> {
        self.nodes.values()
    }

    /// Join orders in ascending order.
    pub fn orders(&self) -> impl Iterator<Item = NodeOrder> + '_ {
        self.nodes.keys().copied()
    }

    pub fn get(&self, order: NodeOrder) -> Option<&Arc<NodeRecord>> {
        self.nodes.get(&order)
    }

    /// Member by node id.
    pub fn by_id(&self, id: NodeId) -> Option<&Arc<NodeRecord>> {
        self.nodes.values().find(|n| n.id == id)
    }

    pub fn contains_id(&self, id: NodeId) -> bool {
        self.by_id(id).is_some()
    }

    /// The record flagged as local, if the local node is a member.
    pub fn local_node(&self) -> Option<&Arc<NodeRecord>> {
        self.nodes.values().find(|n| n.local)
    }

    /// Every member except the local node, ascending.
    pub fn remote_nodes(&self) -> Vec<Arc<NodeRecord>> {
        self.nodes.values().filter(|n| !n.local).cloned().collect()
    }

    /// New snapshot with `record` added.
    pub fn with_joined(&self, record: Arc<NodeRecord>) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.insert(record.order, record);
        Self {
            version: self.version + 1,
            nodes,
        }
    }

    /// New snapshot without the member at `order`.
    pub fn with_failed(&self, order: NodeOrder) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.remove(&order);
        Self {
            version: self.version + 1,
            nodes,
        }
    }

    /// Compare the snapshot against the markers currently present in the store.
    pub fn diff(&self, live: &BTreeMap<NodeOrder, NodeChild>) -> TopologyDiff {
        let mut diff = TopologyDiff::default();
        for (order, record) in &self.nodes {
            match live.get(order) {
                Some(child) if child.node_id == record.id => {}
                _ if record.local => diff.local_lost = true,
                _ => diff.failed.push(Arc::clone(record)),
            }
        }
        diff.joined = live
            .iter()
            .filter(|(order, child)| {
                self.nodes
                    .get(order)
                    .is_none_or(|record| record.id != child.node_id)
            })
            .map(|(_, child)| *child)
            .collect();
        diff
    }
}

/// Difference between a snapshot and the live markers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyDiff {
    /// Remote members whose marker is gone, ascending.
    pub failed: Vec<Arc<NodeRecord>>,
    /// Markers with no member yet, ascending.
    pub joined: Vec<NodeChild>,
    /// The local node's own marker is gone.
    pub local_lost: bool,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.joined.is_empty() && !self.local_lost
    }
}

/// Publication point for the current snapshot.
#[derive(Debug)]
pub struct TopologyHolder {
    current: ArcSwap<TopologySnapshot>,
}

impl Default for TopologyHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyHolder {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(TopologySnapshot::empty()),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    /// Publish `snapshot` as current.
    pub fn publish(&self, snapshot: TopologySnapshot) -> Arc<TopologySnapshot> {
        metrics::set_topology(snapshot.len(), snapshot.version());
        let snapshot = Arc::new(snapshot);
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProductVersion;
    use uuid::Uuid;

    fn record(order: u64, local: bool) -> Arc<NodeRecord> {
        Arc::new(NodeRecord {
            order: NodeOrder(order),
            id: Uuid::new_v4(),
            attributes: BTreeMap::new(),
            version: ProductVersion::new(1, 0, 0),
            client: false,
            consistent_id: format!("node-{}", order),
            local,
        })
    }

    fn child_of(record: &NodeRecord) -> NodeChild {
        NodeChild {
            node_id: record.id,
            sequence: record.order.value() - 1,
        }
    }

    #[test]
    fn test_snapshot_orders_ascending() {
        let snapshot = TopologySnapshot::empty()
            .with_joined(record(3, false))
            .with_joined(record(1, true))
            .with_joined(record(2, false));
        let orders: Vec<_> = snapshot.orders().collect();
        assert_eq!(orders, vec![NodeOrder(1), NodeOrder(2), NodeOrder(3)]);
        assert_eq!(snapshot.version(), 3);
        assert_eq!(snapshot.remote_nodes().len(), 2);
        assert_eq!(snapshot.local_node().unwrap().order, NodeOrder(1));
    }

    #[test]
    fn test_with_failed_bumps_version() {
        let node = record(1, false);
        let snapshot = TopologySnapshot::empty().with_joined(Arc::clone(&node));
        let after = snapshot.with_failed(NodeOrder(1));
        assert!(after.is_empty());
        assert_eq!(after.version(), 2);
        assert!(snapshot.contains_id(node.id));
        assert!(!after.contains_id(node.id));
    }

    #[test]
    fn test_diff_reports_joins_and_failures_in_order() {
        let local = record(1, true);
        let gone = record(2, false);
        let stays = record(3, false);
        let snapshot = TopologySnapshot::empty()
            .with_joined(Arc::clone(&local))
            .with_joined(Arc::clone(&gone))
            .with_joined(Arc::clone(&stays));

        let newcomer_a = NodeChild {
            node_id: Uuid::new_v4(),
            sequence: 5,
        };
        let newcomer_b = NodeChild {
            node_id: Uuid::new_v4(),
            sequence: 3,
        };
        let live = BTreeMap::from([
            (local.order, child_of(&local)),
            (stays.order, child_of(&stays)),
            (newcomer_a.order(), newcomer_a),
            (newcomer_b.order(), newcomer_b),
        ]);

        let diff = snapshot.diff(&live);
        assert!(!diff.local_lost);
        assert_eq!(diff.failed.len(), 1);
        assert_eq!(diff.failed[0].id, gone.id);
        assert_eq!(diff.joined, vec![newcomer_b, newcomer_a]);
    }

    #[test]
    fn test_diff_detects_local_loss() {
        let local = record(1, true);
        let snapshot = TopologySnapshot::empty().with_joined(local);
        let diff = snapshot.diff(&BTreeMap::new());
        assert!(diff.local_lost);
        assert!(diff.failed.is_empty());
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_diff_empty_when_converged() {
        let node = record(4, false);
        let snapshot = TopologySnapshot::empty().with_joined(Arc::clone(&node));
        let live = BTreeMap::from([(node.order, child_of(&node))]);
        assert!(snapshot.diff(&live).is_empty());
    }

    #[test]
    fn test_holder_publishes_snapshots() {
        let holder = TopologyHolder::new();
        let before = holder.load();
        assert!(before.is_empty());
        holder.publish(before.with_joined(record(1, true)));
        assert_eq!(holder.load().len(), 1);
        assert!(before.is_empty());
    }
}
