//! Basic usage of the cluster client
//!
//! Expects a Redis Cluster on 127.0.0.1:7000-7002, or the nodes listed in
//! REDIS_CLUSTER_URL.

use bytes::Bytes;
use cluster_oxide::{ClusterClient, ClusterConfig, ClusterEvent, CommandOptions, Script};
use std::time::Duration;

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
    let config = ClusterConfig::new(url)
        .with_use_replicas(true)
        .with_command_options(CommandOptions::default().with_timeout(Duration::from_secs(2)));

    println!("Connecting to cluster...");
    let client = ClusterClient::connect(config).await?;

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ClusterEvent::TopologyRefreshed { epoch, shards } = event {
                println!("Topology refreshed: epoch {epoch}, {shards} shards");
            }
        }
    });

    for shard in client.slots() {
        let ranges: Vec<String> = shard.ranges.iter().map(ToString::to_string).collect();
        println!(
            "Shard {} ({} replicas) serves {}",
            shard.master.address,
            shard.replicas.len(),
            ranges.join(", ")
        );
    }

    // Plain commands are routed by key
    client.set("user:1000", "Ada").await?;
    println!("user:1000 = {:?}", client.get("user:1000").await?);
    println!("visits = {}", client.incr("user:1000:visits").await?);

    // Hash tags keep related keys on one node, so they can share a pipeline
    let mut pipeline = client.pipeline();
    pipeline
        .hset("{user:1000}.profile", "name", "Ada")
        .hset("{user:1000}.profile", "lang", "en")
        .hget("{user:1000}.profile", "name");
    let mut results = pipeline.execute().await?;
    results.next::<i64>()?;
    results.next::<i64>()?;
    println!("profile name = {}", results.next::<String>()?);

    let mut tx = client.transaction();
    tx.incr("{user:1000}.balance").incr_by("{user:1000}.balance", 10);
    let mut results = tx.exec().await?;
    results.next::<i64>()?;
    println!("balance = {}", results.next::<i64>()?);

    let script = Script::new("return redis.call('GET', KEYS[1])");
    let reply = client
        .execute_script(&script, &[Bytes::from("user:1000")], &[], true)
        .await?;
    println!("script returned {:?}", reply);

    client.del("user:1000").await?;
    client.close().await;
    Ok(())
}
