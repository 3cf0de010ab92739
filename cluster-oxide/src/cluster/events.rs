//! Lifecycle events

use cluster_oxide_core::types::NodeAddress;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Something that happened to the cluster client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A node connection was established
    NodeConnected(NodeAddress),
    /// Connecting to a node failed
    NodeError {
        /// The node
        address: NodeAddress,
        /// Error text
        error: String,
    },
    /// A refresh found a node that was not part of the previous topology
    NodeAdded(NodeAddress),
    /// A node left the topology and its connection was closed
    NodeRemoved(NodeAddress),
    /// A new slot table was installed
    TopologyRefreshed {
        /// Monotonic topology version
        epoch: u64,
        /// Number of shards in the new table
        shards: usize,
    },
    /// A pinned pub/sub node left the topology; its subscriptions are gone
    PubSubNodeLost {
        /// The node
        address: NodeAddress,
        /// True for a sharded pin
        sharded: bool,
    },
    /// The client was closed
    Disconnected,
}

/// Fan-out of [`ClusterEvent`]s to any number of receivers
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn emit(&self, event: ClusterEvent) {
        trace!("cluster event: {:?}", event);
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }
}
