//! Node registry: one lazily created connection per node address

use super::events::{ClusterEvent, EventBus};
use crate::node::{Connector, NodeConnection};
use cluster_oxide_core::{
    config::NodeAddressMap,
    error::{RedisError, RedisResult},
    types::NodeAddress,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Default)]
struct NodeHandle {
    connection: OnceCell<Arc<dyn NodeConnection>>,
}

/// Owns every shared node connection
pub(crate) struct NodeRegistry {
    connector: Arc<dyn Connector>,
    address_map: Option<NodeAddressMap>,
    nodes: Mutex<HashMap<NodeAddress, Arc<NodeHandle>>>,
    events: EventBus,
    closed: AtomicBool,
}

impl NodeRegistry {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        address_map: Option<NodeAddressMap>,
        events: EventBus,
    ) -> Self {
        Self {
            connector,
            address_map,
            nodes: Mutex::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> RedisResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RedisError::Connection("Cluster client is closed".to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    /// Map an address announced by the cluster to the one to connect to.
    ///
    /// The map is consulted with the normalized `host:port` form, the same
    /// key topology discovery uses.
    pub(crate) fn address_for_alias(&self, announced: &str) -> RedisResult<NodeAddress> {
        let address = NodeAddress::parse(announced)?;
        Ok(self
            .address_map
            .as_ref()
            .and_then(|map| map.resolve(&address.to_string()))
            .unwrap_or(address))
    }

    /// The connection for `address`, created on first use.
    ///
    /// Concurrent first calls share a single connection attempt. A failed
    /// attempt is not cached; the next caller tries again. A connection found
    /// closed is replaced. Fails once [`close_all`](Self::close_all) ran.
    pub(crate) async fn connection_for(
        &self,
        address: &NodeAddress,
    ) -> RedisResult<Arc<dyn NodeConnection>> {
        loop {
            self.ensure_open()?;
            let handle = Arc::clone(self.nodes.lock().entry(address.clone()).or_default());

            let connection = handle
                .connection
                .get_or_try_init(|| async {
                    match self.connector.connect(address).await {
                        Ok(connection) => {
                            info!("Connected to cluster node {}", address);
                            self.events
                                .emit(ClusterEvent::NodeConnected(address.clone()));
                            Ok(connection)
                        }
                        Err(e) => {
                            warn!("Failed to connect to cluster node {}: {}", address, e);
                            self.events.emit(ClusterEvent::NodeError {
                                address: address.clone(),
                                error: e.to_string(),
                            });
                            Err(e)
                        }
                    }
                })
                .await?;

            if self.closed.load(Ordering::Acquire) {
                // Finished connecting after close_all drained the map
                connection.close().await;
                return Err(RedisError::Connection("Cluster client is closed".to_string()));
            }
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }

            debug!("Connection to {} is closed, reconnecting", address);
            let mut nodes = self.nodes.lock();
            if nodes.get(address).is_some_and(|h| Arc::ptr_eq(h, &handle)) {
                nodes.remove(address);
            }
        }
    }

    /// Open a connection that the registry does not share or track
    pub(crate) async fn connect_dedicated(
        &self,
        address: &NodeAddress,
    ) -> RedisResult<Arc<dyn NodeConnection>> {
        self.ensure_open()?;
        debug!("Opening dedicated connection to {}", address);
        let connection = self.connector.connect(address).await.map_err(|e| {
            self.events.emit(ClusterEvent::NodeError {
                address: address.clone(),
                error: e.to_string(),
            });
            e
        })?;
        if let Err(e) = self.ensure_open() {
            connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Addresses with a registry entry
    #[cfg(test)]
    pub(crate) fn known_addresses(&self) -> Vec<NodeAddress> {
        self.nodes.lock().keys().cloned().collect()
    }

    /// Close and forget every connection whose address is not in `current`.
    ///
    /// Returns the addresses whose connection was closed.
    pub(crate) async fn drop_stale(&self, current: &HashSet<NodeAddress>) -> Vec<NodeAddress> {
        let stale: Vec<(NodeAddress, Arc<NodeHandle>)> = {
            let mut nodes = self.nodes.lock();
            let addresses: Vec<NodeAddress> = nodes
                .keys()
                .filter(|a| !current.contains(*a))
                .cloned()
                .collect();
            addresses
                .into_iter()
                .filter_map(|a| nodes.remove(&a).map(|h| (a, h)))
                .collect()
        };

        let mut removed = Vec::with_capacity(stale.len());
        for (address, handle) in stale {
            // Never connected (e.g. an unreachable root node): nothing to report
            let Some(connection) = handle.connection.get() else {
                continue;
            };
            connection.close().await;
            info!("Removed cluster node {}", address);
            self.events.emit(ClusterEvent::NodeRemoved(address.clone()));
            removed.push(address);
        }
        removed
    }

    /// Close every connection and refuse new ones
    pub(crate) async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let handles: Vec<Arc<NodeHandle>> = self.nodes.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Some(connection) = handle.connection.get() {
                connection.close().await;
            }
        }
    }
}
