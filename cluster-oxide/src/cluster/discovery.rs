//! Topology discovery with `CLUSTER SLOTS`

use super::events::ClusterEvent;
use super::slots::{ShardNode, SlotAssignment, SlotTable};
use super::ClusterInner;
use crate::command::Cmd;
use cluster_oxide_core::{
    config::NodeAddressMap,
    error::{RedisError, RedisResult},
    types::{NodeAddress, SlotRange},
    value::RespValue,
};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parse a `CLUSTER SLOTS` reply.
///
/// Each row is `[start, end, master, replica...]` where a node is
/// `[host, port, id, ...]`. An empty host stands for the node that was
/// queried. Announced addresses go through `address_map` when one is given.
/// Malformed rows are skipped.
pub fn parse_cluster_slots(
    reply: &RespValue,
    queried: &NodeAddress,
    address_map: Option<&NodeAddressMap>,
) -> RedisResult<Vec<SlotAssignment>> {
    let rows = reply.as_array().map_err(|_| {
        RedisError::UnexpectedResponse(format!("CLUSTER SLOTS answered with {reply:?}"))
    })?;

    let mut assignments = Vec::with_capacity(rows.len());
    for row in rows {
        let Ok(items) = row.as_array() else {
            continue;
        };
        if items.len() < 3 {
            continue;
        }
        let (Ok(start), Ok(end)) = (items[0].as_int(), items[1].as_int()) else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u16::try_from(start), u16::try_from(end)) else {
            continue;
        };
        if start > end {
            continue;
        }

        let mut nodes = items[2..]
            .iter()
            .filter_map(|node| parse_node(node, queried, address_map));
        let Some((master_address, master_id)) = nodes.next() else {
            continue;
        };

        let mut master = ShardNode::master(master_address);
        master.id = master_id;
        let replicas = nodes
            .map(|(address, id)| {
                let mut replica = ShardNode::replica(address);
                replica.id = id;
                replica
            })
            .collect();

        assignments.push(SlotAssignment {
            range: SlotRange::new(start, end),
            master,
            replicas,
        });
    }

    Ok(assignments)
}

fn parse_node(
    node: &RespValue,
    queried: &NodeAddress,
    address_map: Option<&NodeAddressMap>,
) -> Option<(NodeAddress, Option<String>)> {
    let fields = node.as_array().ok()?;
    if fields.len() < 2 {
        return None;
    }

    let host = match &fields[0] {
        RespValue::Null => String::new(),
        other => other.as_string().ok()?,
    };
    let host = if host.is_empty() {
        queried.host.clone()
    } else {
        host
    };
    let port = u16::try_from(fields[1].as_int().ok()?).ok()?;
    let id = fields.get(2).and_then(|v| v.as_string().ok());

    let announced = NodeAddress::new(host, port);
    let address = address_map
        .and_then(|map| map.resolve(&announced.to_string()))
        .unwrap_or(announced);

    Some((address, id))
}

impl ClusterInner {
    /// Refresh the topology unless another task already did so since
    /// `observed_epoch`.
    ///
    /// `start_with` is queried first, typically the node that reported the
    /// change. The refresh runs on its own task: a caller that gives up (for
    /// example on its deadline) does not interrupt it.
    pub(crate) async fn rediscover(
        self: &Arc<Self>,
        start_with: Option<&NodeAddress>,
        observed_epoch: u64,
    ) -> RedisResult<()> {
        let inner = Arc::clone(self);
        let start_with = start_with.cloned();
        tokio::spawn(async move { inner.refresh(start_with.as_ref(), observed_epoch).await })
            .await
            .map_err(|e| RedisError::Discovery(format!("Topology refresh task failed: {e}")))?
    }

    async fn refresh(
        &self,
        start_with: Option<&NodeAddress>,
        observed_epoch: u64,
    ) -> RedisResult<()> {
        let _guard = self.refresh_lock.lock().await;
        if self.epoch() != observed_epoch {
            debug!(
                "Topology already refreshed (epoch {} -> {}), skipping",
                observed_epoch,
                self.epoch()
            );
            return Ok(());
        }
        self.discover(start_with).await
    }

    /// Query candidates in order until one answers, then install its view.
    ///
    /// Order: `start_with`, the root nodes, then every node of the current
    /// table.
    async fn discover(&self, start_with: Option<&NodeAddress>) -> RedisResult<()> {
        self.ensure_open()?;
        let table = self.table.load_full();
        let mut seen = HashSet::new();
        let candidates: Vec<NodeAddress> = start_with
            .into_iter()
            .chain(self.config.root_nodes.iter())
            .chain(table.masters().map(|n| &n.address))
            .chain(table.replicas().map(|n| &n.address))
            .filter(|a| seen.insert((*a).clone()))
            .cloned()
            .collect();

        let mut last_error = None;
        for address in &candidates {
            self.ensure_open()?;
            match self.fetch_slots(address).await {
                Ok(assignments) => {
                    debug!("Discovered {} slot ranges from {}", assignments.len(), address);
                    self.install(assignments).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Topology query to {} failed: {}", address, e);
                    last_error = Some(e);
                }
            }
        }

        Err(RedisError::Discovery(match last_error {
            Some(e) => format!("No node answered CLUSTER SLOTS, last error: {e}"),
            None => "No node to query for the cluster topology".to_string(),
        }))
    }

    async fn fetch_slots(&self, address: &NodeAddress) -> RedisResult<Vec<SlotAssignment>> {
        let connection = self.registry.connection_for(address).await?;
        let reply = connection
            .send_command(&Cmd::new("CLUSTER").arg("SLOTS"))
            .await?;
        let assignments =
            parse_cluster_slots(&reply, address, self.config.node_address_map.as_ref())?;
        if assignments.is_empty() {
            return Err(RedisError::Discovery(format!(
                "{address} reported no slot assignments"
            )));
        }
        Ok(assignments)
    }

    /// Swap in a table built from `assignments` and reconcile connections
    async fn install(&self, assignments: Vec<SlotAssignment>) {
        if !self.is_open() {
            debug!("Client closed during discovery, dropping the new topology");
            return;
        }
        let epoch = self.epoch() + 1;
        let table = Arc::new(SlotTable::from_assignments(assignments, epoch));
        let previous = self.table.swap(Arc::clone(&table));
        self.epoch.store(epoch, Ordering::Release);

        let current: HashSet<NodeAddress> = table.addresses().cloned().collect();
        for address in &current {
            if !previous.contains_address(address) {
                self.events.emit(ClusterEvent::NodeAdded(address.clone()));
            }
        }

        self.registry.drop_stale(&current).await;
        self.release_lost_pins(&table).await;

        if !self.config.minimize_connections {
            let eager: Vec<&NodeAddress> = table
                .masters()
                .chain(
                    table
                        .replicas()
                        .filter(|_| self.config.use_replicas),
                )
                .map(|n| &n.address)
                .collect();
            // Failures are reported through NodeError events and retried on first use
            join_all(eager.into_iter().map(|a| self.registry.connection_for(a))).await;
        }

        info!(
            "Installed cluster topology epoch {} with {} shards",
            epoch,
            table.all_shards().len()
        );
        self.events.emit(ClusterEvent::TopologyRefreshed {
            epoch,
            shards: table.all_shards().len(),
        });
    }
}
