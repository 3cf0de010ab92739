//! Error types for cluster operations

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for cluster operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for cluster operations
///
/// Error replies coming back from a node are classified once, at the protocol
/// decoding boundary, by [`RedisError::from_server_reply`]. Redirection signals
/// become [`RedisError::Moved`] / [`RedisError::Ask`]; everything else stays a
/// [`RedisError::Server`] carrying the untouched reply text.
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error that is not a redirection
    #[error("{0}")]
    Server(String),

    /// MOVED redirect: the slot permanently belongs to another node
    #[error("MOVED {slot} {address}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target address (`host:port`) as reported by the server
        address: String,
    },

    /// ASK redirect: a single key of a migrating slot lives on another node
    #[error("ASK {slot} {address}")]
    Ask {
        /// Slot number being migrated
        slot: u16,
        /// Target address (`host:port`) as reported by the server
        address: String,
    },

    /// Connection could not be established or broke
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection was closed locally (evicted by a topology refresh or shut down)
    #[error("Connection to {0} is closed")]
    ConnectionClosed(String),

    /// Network operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The caller's deadline expired before the call finished
    #[error("Command aborted: deadline of {0:?} exceeded")]
    Aborted(Duration),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic cluster error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// No seed or known node answered the topology query
    #[error("Topology discovery failed: {0}")]
    Discovery(String),

    /// A redirect target could not be resolved even after a refresh
    #[error("Cannot find node {0}")]
    NodeNotFound(String),

    /// No shard currently serves the slot
    #[error("Slot {0} is not served by any node")]
    SlotUnassigned(u16),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Pub/Sub error
    #[error("Pub/Sub error: {0}")]
    PubSub(String),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RedisError {
    /// Classify an error reply received from a node.
    ///
    /// Replies starting with `MOVED` or `ASK` are turned into the tagged redirect
    /// variants. The target address is the token after the last space and the slot
    /// is the token right after the prefix. A redirect reply whose slot cannot be
    /// parsed keeps its redirect meaning with slot `0`, since only the address
    /// drives the retry.
    #[must_use]
    pub fn from_server_reply(msg: impl Into<String>) -> Self {
        let msg = msg.into();

        if msg.starts_with("MOVED") || msg.starts_with("ASK") {
            if let Some((_, address)) = msg.rsplit_once(' ') {
                let slot = msg
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse::<u16>().ok())
                    .unwrap_or(0);
                let address = address.to_string();

                return if msg.starts_with("MOVED") {
                    Self::Moved { slot, address }
                } else {
                    Self::Ask { slot, address }
                };
            }
        }

        Self::Server(msg)
    }

    /// Check if this error is a redirect (MOVED or ASK)
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Ask { .. })
    }

    /// Get the target address from a redirect error
    #[must_use]
    pub fn redirect_address(&self) -> Option<&str> {
        match self {
            Self::Moved { address, .. } | Self::Ask { address, .. } => Some(address),
            _ => None,
        }
    }

    /// Get the slot number from a redirect error
    #[must_use]
    pub const fn redirect_slot(&self) -> Option<u16> {
        match self {
            Self::Moved { slot, .. } | Self::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Server error replies for an unknown script SHA
    #[must_use]
    pub fn is_noscript(&self) -> bool {
        matches!(self, Self::Server(msg) if msg.starts_with("NOSCRIPT"))
    }
}
