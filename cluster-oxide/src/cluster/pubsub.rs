//! Pub/sub pinning
//!
//! Regular and pattern subscriptions share one dedicated connection to a
//! random node. Sharded subscriptions get one dedicated connection per master,
//! picked by the slot of the first channel. A pin is closed as soon as its
//! connection has no subscription left, or when its node leaves the topology.

use super::events::ClusterEvent;
use super::redirect::with_deadline;
use super::router::{random_node, select_slot_node};
use super::slots::SlotTable;
use super::{calculate_slot, ClusterInner};
use crate::node::NodeConnection;
use crate::pubsub::{PubSubListener, SubscriptionKind};
use cluster_oxide_core::{
    config::CommandOptions,
    error::{RedisError, RedisResult},
    types::{NodeAddress, NodeRole},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct PubSubPin {
    address: NodeAddress,
    connection: Arc<dyn NodeConnection>,
}

#[derive(Default)]
pub(crate) struct PubSubPins {
    regular: Mutex<Option<PubSubPin>>,
    sharded: Mutex<HashMap<NodeAddress, Arc<dyn NodeConnection>>>,
}

impl ClusterInner {
    /// `SUBSCRIBE` / `PSUBSCRIBE` through the regular pin, creating it if needed
    pub(crate) async fn pubsub_subscribe(
        &self,
        kind: SubscriptionKind,
        channels: &[String],
        listener: PubSubListener,
        options: CommandOptions,
    ) -> RedisResult<()> {
        with_deadline(options, async {
            self.ensure_open()?;
            let mut pin = self.pubsub.regular.lock().await;

            let existing = pin
                .as_ref()
                .filter(|current| current.connection.is_open())
                .map(|current| Arc::clone(&current.connection));
            let connection = match existing {
                Some(connection) => connection,
                None => {
                    let created = self.initiate_pubsub_pin().await?;
                    let connection = Arc::clone(&created.connection);
                    *pin = Some(created);
                    connection
                }
            };

            let result = connection.subscribe(kind, channels, listener).await;
            if result.is_err() && !connection.is_pubsub_active() {
                if let Some(released) = pin.take() {
                    released.connection.close().await;
                }
            }
            result
        })
        .await
    }

    /// `UNSUBSCRIBE` / `PUNSUBSCRIBE` on the current regular pin.
    ///
    /// Without a pin there is nothing to unsubscribe from.
    pub(crate) async fn pubsub_unsubscribe(
        &self,
        kind: SubscriptionKind,
        channels: &[String],
        options: CommandOptions,
    ) -> RedisResult<()> {
        with_deadline(options, async {
            let mut pin = self.pubsub.regular.lock().await;
            let Some(current) = pin.as_ref() else {
                return Ok(());
            };

            let connection = Arc::clone(&current.connection);
            let result = connection.unsubscribe(kind, channels).await;
            if !connection.is_pubsub_active() {
                if let Some(released) = pin.take() {
                    debug!("Releasing pub/sub node {}", released.address);
                    released.connection.close().await;
                }
            }
            result
        })
        .await
    }

    async fn initiate_pubsub_pin(&self) -> RedisResult<PubSubPin> {
        let node = random_node(&self.table.load())
            .ok_or_else(|| RedisError::Cluster("No nodes known".to_string()))?;
        let connection = self.registry.connect_dedicated(&node.address).await?;
        info!("Pinned pub/sub node {}", node.address);
        Ok(PubSubPin {
            address: node.address,
            connection,
        })
    }

    /// `SSUBSCRIBE` on the pin of the first channel's master.
    ///
    /// `MOVED` refreshes the topology and retries, bounded like command
    /// redirection. Every other error, `ASK` included, is returned as is.
    pub(crate) async fn pubsub_ssubscribe(
        self: &Arc<Self>,
        channels: &[String],
        listener: PubSubListener,
        options: CommandOptions,
    ) -> RedisResult<()> {
        let first = channels
            .first()
            .ok_or_else(|| RedisError::PubSub("SSUBSCRIBE requires at least one channel".into()))?;

        with_deadline(options, async {
            let max_redirections = self.config.max_command_redirections;
            let mut epoch = self.epoch();
            let mut redirections = 0usize;

            loop {
                let (address, connection) = self.sharded_pin(first).await?;
                let error = match connection
                    .subscribe(SubscriptionKind::Sharded, channels, listener.clone())
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                };
                self.release_sharded_if_idle(&address).await;

                if !matches!(error, RedisError::Moved { .. }) {
                    return Err(error);
                }
                redirections += 1;
                if redirections > max_redirections {
                    return Err(error);
                }

                debug!(
                    "{} while subscribing on {}, refreshing topology (attempt {}/{})",
                    error, address, redirections, max_redirections
                );
                self.rediscover(Some(&address), epoch).await?;
                epoch = self.epoch();
            }
        })
        .await
    }

    /// `SUNSUBSCRIBE` on the pin of the first channel's master.
    ///
    /// An empty channel list unsubscribes every sharded pin.
    pub(crate) async fn pubsub_sunsubscribe(
        &self,
        channels: &[String],
        options: CommandOptions,
    ) -> RedisResult<()> {
        with_deadline(options, async {
            let Some(first) = channels.first() else {
                return self.sunsubscribe_all().await;
            };

            let address =
                select_slot_node(&self.table.load(), calculate_slot(first.as_bytes()), false)?;
            let mut pins = self.pubsub.sharded.lock().await;
            let Some(connection) = pins.get(&address).cloned() else {
                return Ok(());
            };

            let result = connection
                .unsubscribe(SubscriptionKind::Sharded, channels)
                .await;
            if !connection.is_pubsub_active() {
                debug!("Releasing sharded pub/sub node {}", address);
                pins.remove(&address);
                connection.close().await;
            }
            result
        })
        .await
    }

    async fn sunsubscribe_all(&self) -> RedisResult<()> {
        let pins: Vec<(NodeAddress, Arc<dyn NodeConnection>)> =
            self.pubsub.sharded.lock().await.drain().collect();
        let mut result = Ok(());
        for (address, connection) in pins {
            if let Err(e) = connection.unsubscribe(SubscriptionKind::Sharded, &[]).await {
                debug!("SUNSUBSCRIBE on {} failed: {}", address, e);
                result = Err(e);
            }
            connection.close().await;
        }
        result
    }

    async fn sharded_pin(
        &self,
        channel: &str,
    ) -> RedisResult<(NodeAddress, Arc<dyn NodeConnection>)> {
        self.ensure_open()?;
        let address =
            select_slot_node(&self.table.load(), calculate_slot(channel.as_bytes()), false)?;

        let mut pins = self.pubsub.sharded.lock().await;
        if let Some(connection) = pins.get(&address) {
            if connection.is_open() {
                return Ok((address, Arc::clone(connection)));
            }
        }

        let connection = self.registry.connect_dedicated(&address).await?;
        info!("Pinned sharded pub/sub node {}", address);
        pins.insert(address.clone(), Arc::clone(&connection));
        Ok((address, connection))
    }

    async fn release_sharded_if_idle(&self, address: &NodeAddress) {
        let mut pins = self.pubsub.sharded.lock().await;
        let idle = pins
            .get(address)
            .is_some_and(|connection| !connection.is_pubsub_active());
        if idle {
            if let Some(connection) = pins.remove(address) {
                connection.close().await;
            }
        }
    }

    /// Close pins whose node is gone from `table`.
    ///
    /// The regular pin survives while its node is in the table. A sharded pin
    /// needs its node to still be a master.
    pub(crate) async fn release_lost_pins(&self, table: &SlotTable) {
        {
            let mut pin = self.pubsub.regular.lock().await;
            let lost = pin
                .as_ref()
                .is_some_and(|current| !table.contains_address(&current.address));
            if lost {
                if let Some(released) = pin.take() {
                    info!("Pub/sub node {} left the cluster", released.address);
                    released.connection.close().await;
                    self.events.emit(ClusterEvent::PubSubNodeLost {
                        address: released.address,
                        sharded: false,
                    });
                }
            }
        }

        let mut pins = self.pubsub.sharded.lock().await;
        let lost: Vec<NodeAddress> = pins
            .keys()
            .filter(|address| {
                table
                    .node_by_address(address)
                    .map_or(true, |node| node.role != NodeRole::Master)
            })
            .cloned()
            .collect();
        for address in lost {
            if let Some(connection) = pins.remove(&address) {
                info!("Sharded pub/sub node {} is no longer a master", address);
                connection.close().await;
                self.events.emit(ClusterEvent::PubSubNodeLost {
                    address,
                    sharded: true,
                });
            }
        }
    }

    pub(crate) async fn release_all_pins(&self) {
        if let Some(released) = self.pubsub.regular.lock().await.take() {
            released.connection.close().await;
        }
        let pins: Vec<Arc<dyn NodeConnection>> = self
            .pubsub
            .sharded
            .lock()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in pins {
            connection.close().await;
        }
    }

    /// Address of the regular pub/sub pin
    pub(crate) async fn pub_sub_node(&self) -> Option<NodeAddress> {
        self.pubsub
            .regular
            .lock()
            .await
            .as_ref()
            .map(|pin| pin.address.clone())
    }

    /// Addresses of the sharded pub/sub pins
    pub(crate) async fn sharded_pub_sub_nodes(&self) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = self.pubsub.sharded.lock().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }
}
