//! Records stored in, and derived from, the coordination store.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodeOrder, ProductVersion};

/// A cluster member as seen by every other member.
///
/// Built once per node at join time and never mutated afterwards; liveness is
/// tracked by the node's marker in the store, not by this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub order: NodeOrder,
    pub id: NodeId,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub version: ProductVersion,
    pub client: bool,
    pub consistent_id: String,
    /// Whether this record describes the node holding it.
    #[serde(skip)]
    pub local: bool,
}

impl NodeRecord {
    /// Record for a remote node, from its join data and marker.
    pub fn from_join_data(order: NodeOrder, data: &JoiningNodeData) -> Self {
        Self {
            order,
            id: data.node_id,
            attributes: data.attributes.clone(),
            version: data.version,
            client: data.client,
            consistent_id: data.consistent_id.clone(),
            local: false,
        }
    }

    /// Attribute value by name.
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeRecord[id={}, order={}, client={}, local={}]",
            self.id, self.order, self.client, self.local
        )
    }
}

/// Payload of a join-history entry: everything peers need to build a [`NodeRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoiningNodeData {
    pub node_id: NodeId,
    pub consistent_id: String,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub version: ProductVersion,
    pub client: bool,
    /// Opaque blob from the data-exchange collaborator.
    #[serde(default)]
    pub exchange: Bytes,
}

/// A custom event as stored under the events path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEventRecord {
    /// Ensemble-assigned sequence number; the total order of events.
    #[serde(skip)]
    pub sequence: u64,
    pub sender: NodeId,
    pub payload: Bytes,
}

/// Cluster-wide metadata kept at `<root>/cluster`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterData {
    /// Epoch millis when the cluster structure was first created.
    pub start_time: i64,
}

impl ClusterData {
    /// Metadata stamped with the current time.
    pub fn now() -> Self {
        Self {
            start_time: Utc::now().timestamp_millis(),
        }
    }

    /// Start time as a timestamp.
    pub fn start_time_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.start_time).single()
    }
}
