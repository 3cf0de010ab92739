//! Core types for the cluster-oxide Redis Cluster client
//!
//! This crate provides the fundamental types, configuration and error definitions
//! shared by the cluster-oxide routing engine and its connections.

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{
    ClusterConfig, CommandOptions, ConnectionConfig, NodeAddressMap,
    DEFAULT_MAX_COMMAND_REDIRECTIONS,
};
pub use error::{RedisError, RedisResult};
pub use types::{NodeAddress, NodeRole, SlotRange, DEFAULT_PORT};
pub use value::RespValue;
