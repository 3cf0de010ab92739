//! Sharded pub/sub: subscriptions are pinned to the master of each channel's slot
//!
//! Expects a Redis Cluster (7.0+) on 127.0.0.1:7000-7002, or the nodes listed
//! in REDIS_CLUSTER_URL.

use cluster_oxide::{calculate_slot, ClusterClient, ClusterConfig, ClusterEvent};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let url = std::env::var("REDIS_CLUSTER_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002".to_string());
    let client = ClusterClient::connect(ClusterConfig::new(url)).await?;

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ClusterEvent::PubSubNodeLost { address, sharded } = event {
                println!("Lost pub/sub node {address} (sharded: {sharded}); resubscribe needed");
            }
        }
    });

    let channels = ["orders", "payments", "shipping"];
    let (tx, mut rx) = mpsc::unbounded_channel();
    for channel in channels {
        client.ssubscribe(&[channel.to_string()], tx.clone()).await?;
        println!("{channel} -> slot {}", calculate_slot(channel.as_bytes()));
    }
    println!("Pinned sharded nodes: {:?}", client.sharded_pub_sub_nodes().await);

    // Regular pub/sub uses a single pinned node
    client.subscribe(&["announcements".to_string()], tx).await?;
    println!("Pinned pub/sub node: {:?}", client.pub_sub_node().await);

    for channel in channels {
        client.spublish(channel, format!("hello from {channel}")).await?;
    }
    client.publish("announcements", "maintenance at noon").await?;

    for _ in 0..channels.len() + 1 {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(message)) => println!(
                "[{}] {}: {}",
                message.kind,
                message.channel,
                String::from_utf8_lossy(&message.payload)
            ),
            _ => break,
        }
    }

    client.sunsubscribe(&[]).await?;
    client.unsubscribe(&[]).await?;
    client.close().await;
    Ok(())
}
