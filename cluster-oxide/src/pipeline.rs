//! Pipelines routed to a single node
//!
//! All commands of a [`ClusterPipeline`] are written to one node in a single
//! round trip. The node is chosen from the explicit routing key, or from the
//! first command that carries a key; every key in the pipeline should
//! therefore hash to the same slot (use hash tags). The pipeline is routed once
//! and is not retried on redirection; a redirected command shows up as an
//! error reply at its position in the results.
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
//! let mut pipeline = client.pipeline();
//! pipeline.set("{user:1}:name", "alice");
//! pipeline.incr("{user:1}:visits");
//! pipeline.get("{user:1}:name");
//!
//! let mut results = pipeline.execute().await?;
//! let _: String = results.next()?;
//! let visits: i64 = results.next()?;
//! println!("visits = {}", visits);
//! # Ok(())
//! # }
//! ```

use crate::client::ClusterClient;
use crate::command::{Cmd, CommandTable};
use bytes::Bytes;
use cluster_oxide_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::collections::VecDeque;

/// Routing key and read-only flag for a batch of commands.
///
/// The key is the first one any command carries. The batch is read-only only
/// when every command is known to be read-only.
pub(crate) fn batch_routing(
    table: &CommandTable,
    cmds: &[Cmd],
) -> RedisResult<(Option<Bytes>, bool)> {
    let mut key = None;
    let mut read_only = true;

    for cmd in cmds {
        match table.get(cmd.name()) {
            Some(spec) => {
                read_only &= spec.read_only;
                if key.is_none() {
                    key = spec.extract_first_key(cmd.args()).ok().flatten();
                }
            }
            None => read_only = false,
        }
    }

    if key.is_none() && cmds.iter().any(|cmd| {
        table
            .get(cmd.name())
            .map_or(true, |spec| !spec.forward)
    }) {
        return Err(RedisError::Cluster(
            "Cannot determine a routing key for the batch".to_string(),
        ));
    }

    Ok((key, read_only))
}

/// A batch of commands sent to one node in one round trip
pub struct ClusterPipeline {
    client: ClusterClient,
    commands: Vec<Cmd>,
    routing_key: Option<Bytes>,
}

impl ClusterPipeline {
    pub(crate) fn new(client: ClusterClient) -> Self {
        Self {
            client,
            commands: Vec::new(),
            routing_key: None,
        }
    }

    /// Route the pipeline by this key instead of the first command's key
    pub fn routing_key(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Add an arbitrary command
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

    /// `HSET key field value`
    pub fn hset(
        &mut self,
        key: impl Into<Bytes>,
        field: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> &mut Self {
        self.add_command(Cmd::new("HSET").arg(key).arg(field).arg(value))
    }

    /// `HGET key field`
    pub fn hget(&mut self, key: impl Into<Bytes>, field: impl Into<Bytes>) -> &mut Self {
        self.add_command(Cmd::new("HGET").arg(key).arg(field))
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop all queued commands
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Send every queued command and collect the replies.
    ///
    /// The queue is emptied whether or not the call succeeds.
    pub async fn execute(&mut self) -> RedisResult<PipelineResult> {
        let commands = std::mem::take(&mut self.commands);
        if commands.is_empty() {
            return Ok(PipelineResult::new(Vec::new()));
        }

        let routing = batch_routing(self.client.command_table(), &commands);
        let (key, read_only) = match self.routing_key.clone() {
            Some(key) => (Some(key), routing.map_or(false, |(_, read_only)| read_only)),
            None => routing?,
        };

        let replies = self
            .client
            .execute_pipeline(key, read_only, &commands)
            .await?;
        Ok(PipelineResult::new(replies))
    }
}

/// Replies of a pipeline or transaction, in command order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    results: VecDeque<RespValue>,
}

impl PipelineResult {
    /// Wrap raw replies
    pub fn new(results: Vec<RespValue>) -> Self {
        Self {
            results: results.into(),
        }
    }

    /// Take the next reply, converted to `T`.
    ///
    /// An error reply is returned as the classified error.
    pub fn next<T>(&mut self) -> RedisResult<T>
    where
        T: TryFrom<RespValue>,
        T::Error: Into<RedisError>,
    {
        let value = self
            .results
            .pop_front()
            .ok_or_else(|| RedisError::UnexpectedResponse("No more results".to_string()))?;
        T::try_from(value.into_result()?).map_err(Into::into)
    }

    /// Peek at the reply at `index`
    pub fn get(&self, index: usize) -> Option<&RespValue> {
        self.results.get(index)
    }

    /// Number of remaining replies
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True when every reply was consumed
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The remaining raw replies
    pub fn into_results(self) -> Vec<RespValue> {
        self.results.into()
    }
}
