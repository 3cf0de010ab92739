//! Async Redis Cluster client for Rust
//!
//! `cluster-oxide` presents a Redis Cluster as one logical keyspace. It
//! discovers the topology from a set of root nodes, routes every command to
//! the node owning its hash slot and follows `MOVED`/`ASK` redirects
//! transparently.
//!
//! # Features
//!
//! - Slot table built from `CLUSTER SLOTS`, refreshed on demand
//! - One shared connection per node, opened at most once
//! - Optional replica reads for read-only commands
//! - Bounded `MOVED`/`ASK` redirection with coalesced topology refreshes
//! - Pinned connections for regular and sharded pub/sub
//! - Pipelines, transactions and Lua scripts routed by their first key
//! - Per-call deadlines through [`CommandOptions`]
//!
//! # Quick Start
//!
//! ```no_run
//! use cluster_oxide::{ClusterClient, ClusterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::new("redis://127.0.0.1:7000,127.0.0.1:7001")
//!         .with_use_replicas(true);
//!     let client = ClusterClient::connect(config).await?;
//!
//!     client.set("mykey", "myvalue").await?;
//!     let value = client.get("mykey").await?;
//!     println!("Value: {:?}", value);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::manual_let_else)]

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod node;
pub mod pipeline;
pub mod protocol;
pub mod pubsub;
pub mod script;
pub mod transaction;

pub use client::ClusterClient;
pub use cluster::{
    calculate_slot, parse_cluster_slots, ClusterEvent, RoutedNode, Shard, ShardNode,
    SlotAssignment, SlotTable, CLUSTER_SLOTS,
};
pub use command::{Cmd, CommandSpec, CommandTable, KeyPosition};
pub use node::{Connector, NodeClient, NodeConnection, TcpConnector};
pub use pipeline::{ClusterPipeline, PipelineResult};
pub use pubsub::{PubSubListener, PubSubMessage, SubscriptionKind};
pub use script::Script;
pub use transaction::ClusterTransaction;

pub use cluster_oxide_core::{
    config::{
        ClusterConfig, CommandOptions, ConnectionConfig, NodeAddressMap,
        DEFAULT_MAX_COMMAND_REDIRECTIONS,
    },
    error::{RedisError, RedisResult},
    types::{NodeAddress, NodeRole, SlotRange},
    value::RespValue,
};
