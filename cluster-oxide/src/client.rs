//! High-level cluster client
//!
//! [`ClusterClient`] is the entry point. It is cheap to clone; clones share
//! the topology, the node connections and the pub/sub pins.

use crate::cluster::{
    with_deadline, ClusterEvent, ClusterInner, RoutedNode, Shard, ShardNode, SlotTable,
};
use crate::command::{Cmd, CommandTable};
use crate::node::{Connector, NodeConnection, TcpConnector};
use crate::pipeline::ClusterPipeline;
use crate::pubsub::{PubSubListener, SubscriptionKind};
use crate::script::Script;
use crate::transaction::ClusterTransaction;
use bytes::Bytes;
use cluster_oxide_core::{
    config::{ClusterConfig, CommandOptions},
    error::{RedisError, RedisResult},
    types::NodeAddress,
    value::RespValue,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Client for a Redis Cluster
///
/// Automatically handles:
/// - Topology discovery from the root nodes
/// - Routing by hash slot, with optional replica reads
/// - `MOVED` and `ASK` redirects
/// - Dedicated pub/sub connections
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
    commands: Arc<CommandTable>,
    options: CommandOptions,
}

impl ClusterClient {
    /// Discover the cluster and connect to it over TCP
    ///
    /// # Example
    ///
    /// ```no_run
    /// use cluster_oxide::{ClusterClient, ClusterConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = ClusterConfig::new("redis://127.0.0.1:7000,127.0.0.1:7001");
    ///     let client = ClusterClient::connect(config).await?;
    ///     client.set("mykey", "myvalue").await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: ClusterConfig) -> RedisResult<Self> {
        let defaults = config
            .defaults
            .clone()
            .with_read_only(config.use_replicas);
        let connector = Arc::new(TcpConnector::new(defaults));
        Self::connect_with(config, connector).await
    }

    /// Discover the cluster using a custom [`Connector`]
    pub async fn connect_with(
        config: ClusterConfig,
        connector: Arc<dyn Connector>,
    ) -> RedisResult<Self> {
        info!("Connecting to cluster via {} root nodes", config.root_nodes.len());
        let options = config.command_options;
        let inner = ClusterInner::connect(config, connector).await?;
        Ok(Self {
            inner,
            commands: Arc::new(CommandTable::builtin()),
            options,
        })
    }

    /// A new, independent client with the same configuration
    pub async fn duplicate(&self) -> RedisResult<Self> {
        let inner =
            ClusterInner::connect(self.inner.config.clone(), self.inner.registry.connector())
                .await?;
        Ok(Self {
            inner,
            commands: Arc::clone(&self.commands),
            options: self.options,
        })
    }

    /// Close every connection; later calls fail
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// False once [`close`](Self::close) was called
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// A clone that applies `options` to every call
    pub fn with_command_options(&self, options: CommandOptions) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            commands: Arc::clone(&self.commands),
            options,
        }
    }

    /// Options applied to calls made through this handle
    pub fn command_options(&self) -> CommandOptions {
        self.options
    }

    /// A clone that routes commands with `table`
    pub fn with_command_table(&self, table: CommandTable) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            commands: Arc::new(table),
            options: self.options,
        }
    }

    pub(crate) fn command_table(&self) -> &CommandTable {
        &self.commands
    }

    /// Receive lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.subscribe_events()
    }

    // ---- Command execution ----

    /// Send `cmd` to the node owning `first_key`, following redirections.
    ///
    /// Without a key the command goes to a random master.
    pub async fn send_command(
        &self,
        first_key: Option<Bytes>,
        read_only: bool,
        cmd: Cmd,
    ) -> RedisResult<RespValue> {
        let cmd = &cmd;
        self.inner
            .execute(first_key, read_only, self.options, |connection, asking| async move {
                connection.send_redirected(cmd, asking).await
            })
            .await
    }

    /// Send a command routed by the command table
    pub async fn command(&self, cmd: Cmd) -> RedisResult<RespValue> {
        let spec = self.commands.get(cmd.name()).ok_or_else(|| {
            RedisError::Cluster(format!(
                "Unknown command {}; register it or use send_command",
                cmd.name()
            ))
        })?;
        let first_key = spec.extract_first_key(cmd.args())?;
        let read_only = spec.read_only;
        self.send_command(first_key, read_only, cmd).await
    }

    /// Run a Lua script on the node owning its first key
    pub async fn execute_script(
        &self,
        script: &Script,
        keys: &[Bytes],
        args: &[Bytes],
        read_only: bool,
    ) -> RedisResult<RespValue> {
        self.inner
            .execute(
                Script::first_key(keys),
                read_only,
                self.options,
                |connection, asking| async move {
                    connection.execute_script(script, keys, args, asking).await
                },
            )
            .await
    }

    /// Start a pipeline
    pub fn pipeline(&self) -> ClusterPipeline {
        ClusterPipeline::new(self.clone())
    }

    /// Start a transaction
    pub fn transaction(&self) -> ClusterTransaction {
        ClusterTransaction::new(self.clone())
    }

    /// Send `cmds` to one node in a single round trip.
    ///
    /// Routed once by `first_key`; redirections come back as error replies.
    pub async fn execute_pipeline(
        &self,
        first_key: Option<Bytes>,
        read_only: bool,
        cmds: &[Cmd],
    ) -> RedisResult<Vec<RespValue>> {
        with_deadline(self.options, async {
            let target = self.inner.get_client(first_key.as_deref(), read_only).await?;
            target.connection.execute_pipeline(cmds).await
        })
        .await
    }

    /// Run `cmds` in `MULTI`/`EXEC` on the node owning `first_key`.
    ///
    /// Routed like a single command with the same `read_only` flag, once and
    /// without following redirections.
    pub async fn execute_multi(
        &self,
        first_key: Option<Bytes>,
        read_only: bool,
        cmds: &[Cmd],
    ) -> RedisResult<Vec<RespValue>> {
        with_deadline(self.options, async {
            let target = self.inner.get_client(first_key.as_deref(), read_only).await?;
            target.connection.execute_multi(cmds).await
        })
        .await
    }

    // ---- Typed helpers ----

    /// Get the value of a key
    pub async fn get(&self, key: impl Into<Bytes>) -> RedisResult<Option<String>> {
        match self.command(Cmd::new("GET").arg(key)).await? {
            RespValue::Null => Ok(None),
            value => value.as_string().map(Some),
        }
    }

    /// Set the value of a key
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> RedisResult<()> {
        let reply = self.command(Cmd::new("SET").arg(key).arg(value)).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(RedisError::UnexpectedResponse(format!("SET answered with {reply:?}")))
        }
    }

    /// Delete a key, returning the number of keys removed
    pub async fn del(&self, key: impl Into<Bytes>) -> RedisResult<i64> {
        self.command(Cmd::new("DEL").arg(key)).await?.as_int()
    }

    /// Increment a counter
    pub async fn incr(&self, key: impl Into<Bytes>) -> RedisResult<i64> {
        self.command(Cmd::new("INCR").arg(key)).await?.as_int()
    }

    /// Publish to a channel; returns the number of receivers on that node
    pub async fn publish(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> RedisResult<i64> {
        self.command(Cmd::new("PUBLISH").arg(channel).arg(message))
            .await?
            .as_int()
    }

    /// Publish to a shard channel, routed by the channel's slot
    pub async fn spublish(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> RedisResult<i64> {
        self.command(Cmd::new("SPUBLISH").arg(channel).arg(message))
            .await?
            .as_int()
    }

    // ---- Pub/Sub ----

    /// Subscribe to channels on the pinned pub/sub node
    pub async fn subscribe(&self, channels: &[String], listener: PubSubListener) -> RedisResult<()> {
        self.inner
            .pubsub_subscribe(SubscriptionKind::Channel, channels, listener, self.options)
            .await
    }

    /// Unsubscribe channels; an empty list drops every channel subscription
    pub async fn unsubscribe(&self, channels: &[String]) -> RedisResult<()> {
        self.inner
            .pubsub_unsubscribe(SubscriptionKind::Channel, channels, self.options)
            .await
    }

    /// Subscribe to patterns on the pinned pub/sub node
    pub async fn psubscribe(&self, patterns: &[String], listener: PubSubListener) -> RedisResult<()> {
        self.inner
            .pubsub_subscribe(SubscriptionKind::Pattern, patterns, listener, self.options)
            .await
    }

    /// Unsubscribe patterns; an empty list drops every pattern subscription
    pub async fn punsubscribe(&self, patterns: &[String]) -> RedisResult<()> {
        self.inner
            .pubsub_unsubscribe(SubscriptionKind::Pattern, patterns, self.options)
            .await
    }

    /// Subscribe to shard channels on the master owning the first channel
    pub async fn ssubscribe(&self, channels: &[String], listener: PubSubListener) -> RedisResult<()> {
        self.inner
            .pubsub_ssubscribe(channels, listener, self.options)
            .await
    }

    /// Unsubscribe shard channels; an empty list drops every sharded pin
    pub async fn sunsubscribe(&self, channels: &[String]) -> RedisResult<()> {
        self.inner.pubsub_sunsubscribe(channels, self.options).await
    }

    /// Address of the regular pub/sub pin, if one exists
    pub async fn pub_sub_node(&self) -> Option<NodeAddress> {
        self.inner.pub_sub_node().await
    }

    /// Addresses of the sharded pub/sub pins
    pub async fn sharded_pub_sub_nodes(&self) -> Vec<NodeAddress> {
        self.inner.sharded_pub_sub_nodes().await
    }

    // ---- Introspection ----

    /// The current slot table
    pub fn slot_table(&self) -> Arc<SlotTable> {
        self.inner.table.load_full()
    }

    /// Every shard in the current topology
    pub fn slots(&self) -> Vec<Shard> {
        self.slot_table()
            .all_shards()
            .iter()
            .map(|shard| Shard::clone(shard))
            .collect()
    }

    /// Every master
    pub fn masters(&self) -> Vec<ShardNode> {
        self.slot_table().masters().cloned().collect()
    }

    /// Every replica
    pub fn replicas(&self) -> Vec<ShardNode> {
        self.slot_table().replicas().cloned().collect()
    }

    /// The node with this address
    pub fn node_by_address(&self, address: &NodeAddress) -> Option<ShardNode> {
        self.slot_table().node_by_address(address).cloned()
    }

    /// The shard a node belongs to
    pub fn shard_by_address(&self, address: &NodeAddress) -> Option<Shard> {
        self.slot_table()
            .shard_by_address(address)
            .map(|shard| Shard::clone(shard))
    }

    // ---- Direct node access ----

    /// Connection to the master of `slot`
    pub async fn get_slot_master(&self, slot: u16) -> RedisResult<RoutedNode> {
        self.inner.get_slot_master(slot).await
    }

    /// Connection to a node serving `slot`; replicas are included when enabled
    pub async fn get_slot_random_node(&self, slot: u16) -> RedisResult<RoutedNode> {
        self.inner.get_slot_random_node(slot).await
    }

    /// Connection to any node of the cluster
    pub async fn get_random_node(&self) -> RedisResult<RoutedNode> {
        self.inner.get_random_node().await
    }

    /// Connection to a node returned by [`masters`](Self::masters) or
    /// [`replicas`](Self::replicas)
    pub async fn node_client(&self, node: &ShardNode) -> RedisResult<Arc<dyn NodeConnection>> {
        Ok(self.inner.node_client(node).await?.connection)
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("open", &self.is_open())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
