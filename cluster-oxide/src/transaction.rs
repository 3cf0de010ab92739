//! `MULTI`/`EXEC` transactions on a single node
//!
//! A cluster transaction can only touch keys of one slot. The node is picked
//! the same way as for a pipeline: explicit routing key, or the first keyed
//! command. A transaction made only of read-only commands may run on a
//! replica when replica reads are enabled; anything else goes to the master.
//!
//! # Examples
//!
//! ```no_run
//! use cluster_oxide::{ClusterClient, ClusterConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClusterClient::connect(ClusterConfig::new("redis://127.0.0.1:7000")).await?;
//!
//! let mut tx = client.transaction();
//! tx.set("{account:7}:balance", "100");
//! tx.incr("{account:7}:version");
//!
//! let results = tx.exec().await?;
//! println!("Transaction results: {:?}", results);
//! # Ok(())
//! # }
//! ```

use crate::client::ClusterClient;
use crate::command::Cmd;
use crate::pipeline::{batch_routing, PipelineResult};
use bytes::Bytes;
use cluster_oxide_core::error::RedisResult;

/// Commands executed atomically on one node
pub struct ClusterTransaction {
    client: ClusterClient,
    commands: Vec<Cmd>,
    routing_key: Option<Bytes>,
}

impl ClusterTransaction {
    pub(crate) fn new(client: ClusterClient) -> Self {
        Self {
            client,
            commands: Vec::new(),
            routing_key: None,
        }
    }

    /// Route the transaction by this key
    pub fn routing_key(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Queue an arbitrary command
    pub fn add_command(&mut self, cmd: Cmd) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    /// `SET key value`
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.add_command(Cmd::new("SET").arg(key).arg(value))
    }

    /// `GET key`
    pub fn get(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add_command(Cmd::new("GET").arg(key))
    }

    /// `DEL key`
    pub fn del(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add_command(Cmd::new("DEL").arg(key))
    }

    /// `INCR key`
    pub fn incr(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.add_command(Cmd::new("INCR").arg(key))
    }

    /// `INCRBY key increment`
    pub fn incr_by(&mut self, key: impl Into<Bytes>, increment: i64) -> &mut Self {
        self.add_command(Cmd::new("INCRBY").arg(key).arg(increment.to_string()))
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Forget the queued commands
    pub fn discard(&mut self) {
        self.commands.clear();
    }

    /// Run the queued commands inside `MULTI`/`EXEC`
    pub async fn exec(&mut self) -> RedisResult<PipelineResult> {
        let commands = std::mem::take(&mut self.commands);
        if commands.is_empty() {
            return Ok(PipelineResult::new(Vec::new()));
        }

        let routing = batch_routing(self.client.command_table(), &commands);
        let (key, read_only) = match self.routing_key.clone() {
            Some(key) => (Some(key), routing.map_or(false, |(_, read_only)| read_only)),
            None => routing?,
        };

        let results = self
            .client
            .execute_multi(key, read_only, &commands)
            .await?;
        Ok(PipelineResult::new(results))
    }
}
