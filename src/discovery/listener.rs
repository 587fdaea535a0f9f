//! Collaborators the membership protocol calls out to.
//!
//! Both are injected at construction and held for the protocol's whole lifetime.
//! Listener callbacks run on the coordination client's notification context, one at
//! a time; they may read the topology or call non-blocking protocol methods but must
//! not wait for another notification to be delivered.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::node::{CustomEventRecord, NodeRecord};
use super::topology::TopologySnapshot;
use crate::types::NodeId;

/// Receives membership events.
///
/// For every member, events arrive in the same relative order: joins in ascending
/// join order, custom events in ensemble sequence order.
#[async_trait]
pub trait DiscoveryListener: Send + Sync {
    /// The local node's join transaction committed and its order is known.
    async fn on_local_node_initialized(&self, node: Arc<NodeRecord>);

    /// A member entered the topology. `topology` already contains it.
    async fn on_node_joined(&self, node: Arc<NodeRecord>, topology: Arc<TopologySnapshot>);

    /// A member left the topology, for whatever reason. `topology` no longer contains it.
    async fn on_node_failed(&self, node: Arc<NodeRecord>, topology: Arc<TopologySnapshot>);

    /// A custom event was published. `sender` is `None` if the sender already left.
    async fn on_custom_event(
        &self,
        event: CustomEventRecord,
        sender: Option<Arc<NodeRecord>>,
        topology: Arc<TopologySnapshot>,
    );
}

/// Supplies and consumes the opaque blob exchanged at join time.
pub trait DataExchange: Send + Sync {
    /// Blob attached to the local node's join-history entry.
    fn collect(&self, joining: NodeId) -> Bytes;

    /// Blob published by a remote node that is about to be reported as joined.
    fn on_exchange(&self, _from: NodeId, _data: Bytes) {}
}

/// [`DataExchange`] that publishes nothing and ignores what it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDataExchange;

impl DataExchange for NoopDataExchange {
    fn collect(&self, _joining: NodeId) -> Bytes {
        Bytes::new()
    }
}

/// A listener callback, flattened.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    LocalInitialized(Arc<NodeRecord>),
    Joined {
        node: Arc<NodeRecord>,
        topology_version: u64,
    },
    Failed {
        node: Arc<NodeRecord>,
        topology_version: u64,
    },
    Custom {
        sequence: u64,
        sender: NodeId,
        payload: Bytes,
    },
}

impl DiscoveryEvent {
    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryEvent::LocalInitialized(_) => "local_initialized",
            DiscoveryEvent::Joined { .. } => "joined",
            DiscoveryEvent::Failed { .. } => "failed",
            DiscoveryEvent::Custom { .. } => "custom",
        }
    }
}

#[cfg(any(test, feature = "test-utilities"))]
pub use recording::RecordingListener;

#[cfg(any(test, feature = "test-utilities"))]
mod recording {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;

    /// Listener that records every callback, for tests.
    #[derive(Debug, Default)]
    pub struct RecordingListener {
        events: Mutex<Vec<DiscoveryEvent>>,
        changed: Notify,
    }

    impl RecordingListener {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Everything recorded so far, in delivery order.
        pub fn events(&self) -> Vec<DiscoveryEvent> {
            self.events.lock().clone()
        }

        /// Ids of joined nodes, in delivery order.
        pub fn joined(&self) -> Vec<NodeId> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    DiscoveryEvent::Joined { node, .. } => Some(node.id),
                    _ => None,
                })
                .collect()
        }

        /// Ids of failed nodes, in delivery order.
        pub fn failed(&self) -> Vec<NodeId> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    DiscoveryEvent::Failed { node, .. } => Some(node.id),
                    _ => None,
                })
                .collect()
        }

        /// Custom event payloads, in delivery order.
        pub fn custom_payloads(&self) -> Vec<Bytes> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    DiscoveryEvent::Custom { payload, .. } => Some(payload.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Wait until `predicate` holds over the recorded events.
        ///
        /// Returns `false` on timeout.
        pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
        where
            F: Fn(&[DiscoveryEvent]) -> bool,
        {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = self.changed.notified();
                if predicate(&self.events.lock()) {
                    return true;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return predicate(&self.events.lock());
                }
            }
        }

        fn push(&self, event: DiscoveryEvent) {
            self.events.lock().push(event);
            self.changed.notify_waiters();
        }
    }

    #[async_trait]
    impl DiscoveryListener for RecordingListener {
        async fn on_local_node_initialized(&self, node: Arc<NodeRecord>) {
            self.push(DiscoveryEvent::LocalInitialized(node));
        }

        async fn on_node_joined(&self, node: Arc<NodeRecord>, topology: Arc<TopologySnapshot>) {
            self.push(DiscoveryEvent::Joined {
                node,
                topology_version: topology.version(),
            });
        }

        async fn on_node_failed(&self, node: Arc<NodeRecord>, topology: Arc<TopologySnapshot>) {
            self.push(DiscoveryEvent::Failed {
                node,
                topology_version: topology.version(),
            });
        }

        async fn on_custom_event(
            &self,
            event: CustomEventRecord,
            _sender: Option<Arc<NodeRecord>>,
            _topology: Arc<TopologySnapshot>,
        ) {
            self.push(DiscoveryEvent::Custom {
                sequence: event.sequence,
                sender: event.sender,
                payload: event.payload,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_noop_exchange_collects_nothing() {
        let exchange = NoopDataExchange;
        assert!(exchange.collect(Uuid::new_v4()).is_empty());
        exchange.on_exchange(Uuid::new_v4(), Bytes::from_static(b"ignored"));
    }

    #[tokio::test]
    async fn test_recording_listener_wait_for() {
        let listener = RecordingListener::new();
        let recorder = Arc::clone(&listener);
        let sender = Uuid::new_v4();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            recorder
                .on_custom_event(
                    CustomEventRecord {
                        sequence: 7,
                        sender,
                        payload: Bytes::from_static(b"x"),
                    },
                    None,
                    Arc::new(TopologySnapshot::empty()),
                )
                .await;
        });

        assert!(
            listener
                .wait_for(Duration::from_secs(2), |events| !events.is_empty())
                .await
        );
        assert_eq!(listener.custom_payloads(), vec![Bytes::from_static(b"x")]);
        assert_eq!(listener.events()[0].kind(), "custom");
        assert!(
            !listener
                .wait_for(Duration::from_millis(10), |events| events.len() > 1)
                .await
        );
    }
}
