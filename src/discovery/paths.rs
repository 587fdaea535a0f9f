//! Coordination-store layout and record encoding.
//!
//! # Layout
//!
//! Everything lives under one configurable root:
//!
//! | Path | Mode | Content |
//! |---|---|---|
//! | `<root>/cluster` | persistent | [`ClusterData`] |
//! | `<root>/join-history/<id>-N` | persistent sequential | [`JoiningNodeData`] |
//! | `<root>/alive/<id>-N` | ephemeral sequential | empty; join order is `N + 1` |
//! | `<root>/events/N` | persistent sequential | [`CustomEventRecord`] |
//!
//! Child names under `alive/` and `join-history/` are `<uuid>-<digits>`: exactly
//! [`NODE_ID_LEN`] characters of hyphenated UUID, a `-`, then the ensemble's
//! zero-padded sequence suffix. Anything else is a protocol violation.
//!
//! Records are JSON. Nothing in this module talks to the network except
//! [`bootstrap_cluster`].
//!
//! [`JoiningNodeData`]: super::node::JoiningNodeData
//! [`CustomEventRecord`]: super::node::CustomEventRecord

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{DiscoveryError, DiscoveryResult};
use super::node::ClusterData;
use crate::constants::{
    ALIVE_NODE, CLUSTER_NODE, EVENTS_NODE, JOIN_HISTORY_NODE, NODE_ID_LEN, SEQUENCE_DIGITS,
};
use crate::coordination::{CoordinationClient, CreateMode};
use crate::metrics;
use crate::types::{NodeId, NodeOrder};

/// Absolute paths of one cluster's subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkPaths {
    root: String,
    cluster: String,
    join_history: String,
    alive: String,
    events: String,
}

impl ZkPaths {
    /// Paths under `root` (absolute, no trailing `/`).
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            cluster: format!("{}/{}", root, CLUSTER_NODE),
            join_history: format!("{}/{}", root, JOIN_HISTORY_NODE),
            alive: format!("{}/{}", root, ALIVE_NODE),
            events: format!("{}/{}", root, EVENTS_NODE),
            root,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn join_history(&self) -> &str {
        &self.join_history
    }

    pub fn alive(&self) -> &str {
        &self.alive
    }

    pub fn events(&self) -> &str {
        &self.events
    }

    /// Path handed to a sequential create of `id`'s liveness marker.
    pub fn alive_marker_prefix(&self, id: NodeId) -> String {
        format!("{}/{}-", self.alive, id)
    }

    /// Path handed to a sequential create of `id`'s join-history entry.
    pub fn join_history_prefix(&self, id: NodeId) -> String {
        format!("{}/{}-", self.join_history, id)
    }

    /// Path handed to a sequential create of a custom event.
    pub fn event_prefix(&self) -> String {
        format!("{}/", self.events)
    }

    /// Full path of the liveness marker named `child`.
    pub fn alive_marker(&self, child: &str) -> String {
        format!("{}/{}", self.alive, child)
    }

    /// Full path of the join-history entry named `child`.
    pub fn join_history_entry(&self, child: &str) -> String {
        format!("{}/{}", self.join_history, child)
    }

    /// Full path of the event named `child`.
    pub fn event(&self, child: &str) -> String {
        format!("{}/{}", self.events, child)
    }
}

/// A parsed `<uuid>-<digits>` child name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeChild {
    pub node_id: NodeId,
    pub sequence: u64,
}

impl NodeChild {
    /// Join order carried by a liveness marker with this name.
    pub fn order(&self) -> NodeOrder {
        NodeOrder::from_sequence(self.sequence)
    }
}

/// Parse a child name under `alive/` or `join-history/`.
pub fn parse_node_child(name: &str) -> DiscoveryResult<NodeChild> {
    let violation = || {
        metrics::record_protocol_violation("child_name");
        DiscoveryError::ProtocolViolation(format!("malformed node child name '{}'", name))
    };

    let id_part = name.get(..NODE_ID_LEN).ok_or_else(violation)?;
    let node_id = Uuid::parse_str(id_part).map_err(|_| violation())?;
    let suffix = name[NODE_ID_LEN..].strip_prefix('-').ok_or_else(violation)?;
    // The last sequence has no join order after it.
    let sequence = parse_digits(suffix)
        .filter(|sequence| sequence.checked_add(1).is_some())
        .ok_or_else(violation)?;
    Ok(NodeChild { node_id, sequence })
}

/// Parse a child name under `events/` (just the sequence suffix).
pub fn parse_sequence(name: &str) -> DiscoveryResult<u64> {
    parse_digits(name).ok_or_else(|| {
        metrics::record_protocol_violation("event_name");
        DiscoveryError::ProtocolViolation(format!("malformed event name '{}'", name))
    })
}

/// Child name the ensemble gives the `sequence`-th marker or entry of `id`.
pub fn node_child_name(id: NodeId, sequence: u64) -> String {
    format!("{}-{:0width$}", id, sequence, width = SEQUENCE_DIGITS)
}

/// Last path component of `path`.
pub fn child_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Serialize a record for storage.
pub fn encode_record<T: Serialize>(record: &T) -> DiscoveryResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(record)?))
}

/// Deserialize a stored record.
pub fn decode_record<T: DeserializeOwned>(data: &[u8]) -> DiscoveryResult<T> {
    serde_json::from_slice(data).map_err(|e| {
        metrics::record_protocol_violation("record");
        DiscoveryError::from(e)
    })
}

/// Create the cluster subtree if it does not exist yet.
///
/// Idempotent and safe to race: every node is created with `create_if_needed`, and an
/// existing `cluster` node keeps its original start time. Returns the cluster
/// metadata actually stored.
pub async fn bootstrap_cluster(
    client: &CoordinationClient,
    paths: &ZkPaths,
) -> DiscoveryResult<ClusterData> {
    let mut prefix = String::new();
    for component in paths.root().split('/').filter(|c| !c.is_empty()) {
        prefix.push('/');
        prefix.push_str(component);
        client
            .create_if_needed(&prefix, Bytes::new(), CreateMode::Persistent)
            .await?;
    }

    let data = encode_record(&ClusterData::now())?;
    client
        .create_if_needed(paths.cluster(), data, CreateMode::Persistent)
        .await?;
    for parent in [paths.join_history(), paths.alive(), paths.events()] {
        client
            .create_if_needed(parent, Bytes::new(), CreateMode::Persistent)
            .await?;
        debug!(path = parent, "Cluster node ready");
    }

    let (raw, _) = client.get_data(paths.cluster(), None).await?;
    let cluster: ClusterData = decode_record(&raw)?;
    info!(root = paths.root(), start_time = cluster.start_time, "Cluster structure ready");
    Ok(cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryEnsemble;
    use crate::discovery::node::CustomEventRecord;
    use std::time::Duration;

    #[test]
    fn test_paths_layout() {
        let paths = ZkPaths::new("/zk");
        assert_eq!(paths.root(), "/zk");
        assert_eq!(paths.cluster(), "/zk/cluster");
        assert_eq!(paths.join_history(), "/zk/join-history");
        assert_eq!(paths.alive(), "/zk/alive");
        assert_eq!(paths.events(), "/zk/events");
        assert_eq!(paths.event_prefix(), "/zk/events/");
        assert_eq!(paths.event("0000000003"), "/zk/events/0000000003");
    }

    #[test]
    fn test_marker_name_parses_back() {
        let paths = ZkPaths::new("/zk");
        for sequence in [0u64, 1, 9, 41, 9_999_999_999] {
            let id = Uuid::new_v4();
            let path = format!("{}{:010}", paths.alive_marker_prefix(id), sequence);
            assert_eq!(paths.alive_marker(&node_child_name(id, sequence)), path);
            let child = parse_node_child(child_name(&path)).unwrap();
            assert_eq!(child.node_id, id);
            assert_eq!(child.sequence, sequence);
            assert_eq!(child.order(), NodeOrder(sequence + 1));
            assert_eq!(paths.alive_marker(child_name(&path)), path);
        }
    }

    #[test]
    fn test_join_history_prefix() {
        let paths = ZkPaths::new("/zk");
        let id = Uuid::new_v4();
        assert_eq!(
            paths.join_history_prefix(id),
            format!("/zk/join-history/{}-", id)
        );
    }

    #[test]
    fn test_malformed_child_names_rejected() {
        let id = Uuid::new_v4();
        let cases = [
            String::new(),
            "short-0001".to_string(),
            format!("{}", id),
            format!("{}-", id),
            format!("{}_0000000001", id),
            format!("{}-00x1", id),
            format!("{}-+1", id),
            "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz-0000000001".to_string(),
            "ééééééééééééééééééééééééé-1".to_string(),
            format!("{}-{}", id, u64::MAX),
            format!("{}-99999999999999999999", id),
        ];
        for name in cases {
            let err = parse_node_child(&name).unwrap_err();
            assert!(err.is_protocol_violation(), "accepted '{}'", name);
        }
    }

    #[test]
    fn test_largest_sequence_with_an_order_accepted() {
        let id = Uuid::new_v4();
        let child = parse_node_child(&format!("{}-{}", id, u64::MAX - 1)).unwrap();
        assert_eq!(child.order(), NodeOrder(u64::MAX));
    }

    #[test]
    fn test_parse_event_sequence() {
        assert_eq!(parse_sequence("0000000000").unwrap(), 0);
        assert_eq!(parse_sequence("0000000042").unwrap(), 42);
        assert!(parse_sequence("").is_err());
        assert!(parse_sequence("4a").is_err());
    }

    #[test]
    fn test_child_name() {
        assert_eq!(child_name("/zk/alive/x-1"), "x-1");
        assert_eq!(child_name("plain"), "plain");
    }

    #[test]
    fn test_record_codec() {
        let record = CustomEventRecord {
            sequence: 0,
            sender: Uuid::new_v4(),
            payload: Bytes::from_static(b"hello"),
        };
        let encoded = encode_record(&record).unwrap();
        let decoded: CustomEventRecord = decode_record(&encoded).unwrap();
        assert_eq!(decoded.sender, record.sender);
        assert_eq!(decoded.payload, record.payload);

        let err = decode_record::<CustomEventRecord>(b"not json").unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let ensemble = MemoryEnsemble::new(1);
        let client = CoordinationClient::new(
            ensemble.connector(),
            ensemble.connect_string(),
            Duration::from_secs(2),
            None,
        );
        let paths = ZkPaths::new("/apps/grid");

        let first = bootstrap_cluster(&client, &paths).await.unwrap();
        let second = bootstrap_cluster(&client, &paths).await.unwrap();
        assert_eq!(first, second);

        for path in ["/apps", "/apps/grid", "/apps/grid/cluster", "/apps/grid/alive"] {
            assert!(ensemble.node_exists(path), "{} missing", path);
        }
        assert!(ensemble.node_exists("/apps/grid/join-history"));
        assert!(ensemble.node_exists("/apps/grid/events"));
    }
}
