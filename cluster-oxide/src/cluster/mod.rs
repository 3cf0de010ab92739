//! Redis Cluster engine
//!
//! This module holds the pieces that turn a set of nodes into one logical
//! keyspace:
//! - Slot calculation using CRC16 and hash tags
//! - The slot table and the node registry
//! - Topology discovery with `CLUSTER SLOTS`
//! - Routing and `MOVED`/`ASK` redirection handling
//! - Pinning of pub/sub connections

mod discovery;
mod events;
mod pubsub;
mod redirect;
mod registry;
mod router;
mod slots;

pub use discovery::parse_cluster_slots;
pub use events::ClusterEvent;
pub use router::RoutedNode;
pub(crate) use redirect::with_deadline;
pub use slots::{Shard, ShardNode, SlotAssignment, SlotTable};

use crate::node::Connector;
use arc_swap::ArcSwap;
use cluster_oxide_core::{config::ClusterConfig, error::RedisResult};
use crc16::{State, XMODEM};
use events::EventBus;
use pubsub::PubSubPins;
use registry::NodeRegistry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Total number of hash slots in Redis Cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// Calculate the hash slot for a given key
///
/// This implements the Redis Cluster key hashing algorithm:
/// - If the key contains a non-empty `{...}`, only the part between the first
///   `{` and the next `}` is hashed
/// - Otherwise, the entire key is hashed
/// - The hash is CRC16 (XMODEM) mod 16384
pub fn calculate_slot(key: &[u8]) -> u16 {
    let hash_key = extract_hash_tag(key);
    State::<XMODEM>::calculate(hash_key) % CLUSTER_SLOTS
}

/// Extract the hash tag from a key
///
/// Hash tags allow you to ensure multiple keys are allocated to the same hash slot.
/// For example: `{user1000}.following` and `{user1000}.followers` will hash to the same slot.
pub fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            let end = start + 1 + end;
            if end > start + 1 {
                return &key[start + 1..end];
            }
        }
    }
    key
}

/// Shared state behind every clone of a cluster client
pub(crate) struct ClusterInner {
    pub(crate) config: ClusterConfig,
    pub(crate) table: ArcSwap<SlotTable>,
    pub(crate) registry: NodeRegistry,
    pub(crate) pubsub: PubSubPins,
    pub(crate) events: EventBus,
    refresh_lock: Mutex<()>,
    epoch: AtomicU64,
    open: AtomicBool,
}

impl ClusterInner {
    /// Validate the configuration, run the first discovery and return the
    /// ready-to-use state
    pub(crate) async fn connect(
        config: ClusterConfig,
        connector: Arc<dyn Connector>,
    ) -> RedisResult<Arc<Self>> {
        config.validate()?;

        let events = EventBus::new();
        let registry = NodeRegistry::new(
            connector,
            config.node_address_map.clone(),
            events.clone(),
        );
        let inner = Arc::new(Self {
            config,
            table: ArcSwap::from_pointee(SlotTable::empty()),
            registry,
            pubsub: PubSubPins::default(),
            events,
            refresh_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            open: AtomicBool::new(true),
        });

        if let Err(e) = inner.rediscover(None, 0).await {
            inner.close().await;
            return Err(e);
        }

        info!(
            "Connected to cluster with {} shards",
            inner.table.load().all_shards().len()
        );
        Ok(inner)
    }

    /// Current topology version; bumped by every installed refresh
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close every connection and refuse further calls
    pub(crate) async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.release_all_pins().await;
        self.registry.close_all().await;
        self.events.emit(ClusterEvent::Disconnected);
        info!("Cluster client closed");
    }

    pub(crate) fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}
