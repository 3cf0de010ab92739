//! Routing: key and read/write intent to a node

use super::slots::{ShardNode, SlotTable};
use super::{calculate_slot, ClusterInner};
use crate::node::NodeConnection;
use cluster_oxide_core::{
    error::{RedisError, RedisResult},
    types::NodeAddress,
};
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;

/// A connection together with the node it was picked for
#[derive(Clone)]
pub struct RoutedNode {
    /// The node address
    pub address: NodeAddress,
    /// Shared connection to the node
    pub connection: Arc<dyn NodeConnection>,
}

impl fmt::Debug for RoutedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedNode")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Pick the node for a keyed or keyless command.
///
/// Without a key any master will do. With a key the slot's master is used,
/// unless the command is read-only and replicas are enabled, in which case
/// the master and its replicas are equally likely.
pub(crate) fn select_node(
    table: &SlotTable,
    key: Option<&[u8]>,
    read_only: bool,
    use_replicas: bool,
) -> RedisResult<NodeAddress> {
    match key {
        None => random_master(table),
        Some(key) => select_slot_node(table, calculate_slot(key), read_only && use_replicas),
    }
}

/// The slot's master, or any node of the slot's shard when `any_node` is set
pub(crate) fn select_slot_node(
    table: &SlotTable,
    slot: u16,
    any_node: bool,
) -> RedisResult<NodeAddress> {
    let shard = table
        .shard_for_slot(slot)
        .ok_or(RedisError::SlotUnassigned(slot))?;

    if !any_node || shard.replicas.is_empty() {
        return Ok(shard.master.address.clone());
    }

    let nodes: Vec<&ShardNode> = shard.nodes().collect();
    Ok(nodes
        .choose(&mut rand::thread_rng())
        .map_or_else(|| shard.master.address.clone(), |n| n.address.clone()))
}

pub(crate) fn random_master(table: &SlotTable) -> RedisResult<NodeAddress> {
    let masters: Vec<&ShardNode> = table.masters().collect();
    masters
        .choose(&mut rand::thread_rng())
        .map(|n| n.address.clone())
        .ok_or_else(|| RedisError::Cluster("No master nodes known".to_string()))
}

pub(crate) fn random_node(table: &SlotTable) -> Option<ShardNode> {
    let nodes: Vec<&ShardNode> = table.masters().chain(table.replicas()).collect();
    nodes.choose(&mut rand::thread_rng()).map(|n| (*n).clone())
}

impl ClusterInner {
    pub(crate) fn ensure_open(&self) -> RedisResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RedisError::Connection("Cluster client is closed".to_string()))
        }
    }

    /// Connection for `address`, through the registry
    pub(crate) async fn routed(&self, address: NodeAddress) -> RedisResult<RoutedNode> {
        self.ensure_open()?;
        let connection = self.registry.connection_for(&address).await?;
        Ok(RoutedNode {
            address,
            connection,
        })
    }

    /// Route a command by its first key (or lack of one)
    pub(crate) async fn get_client(
        &self,
        key: Option<&[u8]>,
        read_only: bool,
    ) -> RedisResult<RoutedNode> {
        let address = select_node(
            &self.table.load(),
            key,
            read_only,
            self.config.use_replicas,
        )?;
        self.routed(address).await
    }

    /// Connection to the master of `slot`
    pub(crate) async fn get_slot_master(&self, slot: u16) -> RedisResult<RoutedNode> {
        let address = select_slot_node(&self.table.load(), slot, false)?;
        self.routed(address).await
    }

    /// Connection to a node of `slot`'s shard, replicas included when enabled
    pub(crate) async fn get_slot_random_node(&self, slot: u16) -> RedisResult<RoutedNode> {
        let address = select_slot_node(&self.table.load(), slot, self.config.use_replicas)?;
        self.routed(address).await
    }

    /// Connection to any node of the cluster
    pub(crate) async fn get_random_node(&self) -> RedisResult<RoutedNode> {
        let node = random_node(&self.table.load())
            .ok_or_else(|| RedisError::Cluster("No nodes known".to_string()))?;
        self.routed(node.address).await
    }

    /// Connection to a node previously returned by an introspection call
    pub(crate) async fn node_client(&self, node: &ShardNode) -> RedisResult<RoutedNode> {
        self.routed(node.address.clone()).await
    }
}
