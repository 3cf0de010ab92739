//! Pub/Sub message types
//!
//! Messages are delivered to listeners through unbounded tokio channels. A
//! listener is registered per subscription call; every message for a channel
//! (or pattern) subscribed through that call is forwarded to it.
//!
//! # Examples
//!
//! ```no_run
//! use cluster_oxide::{ClusterClient, ClusterConfig};
//! use tokio::sync::mpsc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClusterClient::connect(ClusterConfig::new("redis://127.0.0.1:7000")).await?;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! client.subscribe(&["news".to_string()], tx).await?;
//!
//! while let Some(message) = rx.recv().await {
//!     println!("{} -> {:?}", message.channel, message.payload);
//! }
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// A message received from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Which kind of subscription delivered the message
    pub kind: SubscriptionKind,
    /// The channel the message was published to
    pub channel: String,
    /// The message payload
    pub payload: Bytes,
    /// The pattern that matched (pattern subscriptions only)
    pub pattern: Option<String>,
}

/// Sender half handed to a subscription
pub type PubSubListener = mpsc::UnboundedSender<PubSubMessage>;

/// The three flavours of subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// `SUBSCRIBE` / `UNSUBSCRIBE`
    Channel,
    /// `PSUBSCRIBE` / `PUNSUBSCRIBE`
    Pattern,
    /// `SSUBSCRIBE` / `SUNSUBSCRIBE`
    Sharded,
}

impl SubscriptionKind {
    /// Command used to subscribe
    pub const fn subscribe_command(self) -> &'static str {
        match self {
            Self::Channel => "SUBSCRIBE",
            Self::Pattern => "PSUBSCRIBE",
            Self::Sharded => "SSUBSCRIBE",
        }
    }

    /// Command used to unsubscribe
    pub const fn unsubscribe_command(self) -> &'static str {
        match self {
            Self::Channel => "UNSUBSCRIBE",
            Self::Pattern => "PUNSUBSCRIBE",
            Self::Sharded => "SUNSUBSCRIBE",
        }
    }

    /// Classify a push frame's first element
    pub(crate) fn from_push(kind: &str) -> Option<(Self, PushKind)> {
        let parsed = match kind {
            "message" => (Self::Channel, PushKind::Message),
            "pmessage" => (Self::Pattern, PushKind::Message),
            "smessage" => (Self::Sharded, PushKind::Message),
            "subscribe" => (Self::Channel, PushKind::Subscribed),
            "psubscribe" => (Self::Pattern, PushKind::Subscribed),
            "ssubscribe" => (Self::Sharded, PushKind::Subscribed),
            "unsubscribe" => (Self::Channel, PushKind::Unsubscribed),
            "punsubscribe" => (Self::Pattern, PushKind::Unsubscribed),
            "sunsubscribe" => (Self::Sharded, PushKind::Unsubscribed),
            _ => return None,
        };
        Some(parsed)
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subscribe_command())
    }
}

/// What a pub/sub push frame announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushKind {
    Message,
    Subscribed,
    Unsubscribed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_classification() {
        assert_eq!(
            SubscriptionKind::from_push("smessage"),
            Some((SubscriptionKind::Sharded, PushKind::Message))
        );
        assert_eq!(
            SubscriptionKind::from_push("punsubscribe"),
            Some((SubscriptionKind::Pattern, PushKind::Unsubscribed))
        );
        assert_eq!(SubscriptionKind::from_push("pong"), None);
    }

    #[test]
    fn test_commands() {
        assert_eq!(SubscriptionKind::Sharded.subscribe_command(), "SSUBSCRIBE");
        assert_eq!(SubscriptionKind::Pattern.unsubscribe_command(), "PUNSUBSCRIBE");
    }
}
