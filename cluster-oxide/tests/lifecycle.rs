//! Connecting, closing and address remapping against a simulated cluster

mod common;

use common::{addr, connect, connect_with, init_tracing, SimCluster, SimShard};
use cluster_oxide::{ClusterClient, ClusterConfig, ClusterEvent, NodeAddressMap, RedisError};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_discovery_skips_unreachable_root_nodes() {
    let sim = SimCluster::three_shards();
    sim.take_down(&addr("10.0.0.9", 7000));
    let config =
        ClusterConfig::with_root_nodes([addr("10.0.0.9", 7000), addr("10.0.0.2", 7000)]);

    let client = connect_with(&sim, config).await;
    assert_eq!(client.slots().len(), 3);
    assert_eq!(sim.connects(&addr("10.0.0.9", 7000)), 1);
    assert_eq!(sim.receivers_of("CLUSTER SLOTS"), vec![addr("10.0.0.2", 7000)]);
}

#[tokio::test]
async fn test_connect_fails_when_no_root_answers() {
    init_tracing();
    let sim = SimCluster::three_shards();
    sim.take_down(&addr("10.0.0.1", 7000));

    let result = ClusterClient::connect_with(sim.config(), Arc::new(sim.clone())).await;
    assert!(matches!(result, Err(RedisError::Discovery(_))));
}

#[tokio::test]
async fn test_connect_rejects_empty_root_list() {
    let sim = SimCluster::three_shards();
    let result = ClusterClient::connect_with(ClusterConfig::default(), Arc::new(sim.clone())).await;
    assert!(matches!(result, Err(RedisError::Config(_))));
    assert_eq!(sim.total_connects(), 0);
}

#[tokio::test]
async fn test_empty_topology_is_a_discovery_error() {
    let sim = SimCluster::new(Vec::new());
    let result = ClusterClient::connect_with(sim.config(), Arc::new(sim.clone())).await;
    assert!(matches!(result, Err(RedisError::Discovery(_))));
}

#[tokio::test]
async fn test_close_releases_everything() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;
    let other_handle = client.clone();
    let mut events = client.events();

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    client.subscribe(&["news".to_string()], tx.clone()).await.unwrap();
    client.ssubscribe(&["foo".to_string()], tx).await.unwrap();
    assert!(sim.open_connections() > 0);

    client.close().await;

    assert!(!client.is_open());
    assert!(!other_handle.is_open());
    assert_eq!(sim.open_connections(), 0);
    assert!(client.pub_sub_node().await.is_none());
    assert!(client.sharded_pub_sub_nodes().await.is_empty());
    assert!(matches!(
        other_handle.get("foo").await,
        Err(RedisError::Connection(_))
    ));

    let mut disconnected = false;
    while let Ok(event) = events.try_recv() {
        disconnected |= event == ClusterEvent::Disconnected;
    }
    assert!(disconnected);

    // Closing twice is harmless
    client.close().await;
}

#[tokio::test]
async fn test_close_during_refresh_leaves_nothing_open() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;

    sim.fail_over_second_shard();
    sim.set_delay(Some(Duration::from_millis(100)));
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.set("k", "v").await }
    });

    // MOVED arrives after 100ms; the refresh it starts is still waiting at 150ms
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.close().await;
    assert_eq!(sim.open_connections(), 0);

    assert!(pending.await.unwrap().is_err());
    assert!(!client.is_open());
    assert_eq!(sim.open_connections(), 0);
}

#[tokio::test]
async fn test_duplicate_is_independent() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;
    let duplicate = client.duplicate().await.unwrap();
    assert_eq!(sim.count("CLUSTER SLOTS"), 2);

    client.close().await;
    duplicate.set("foo", "bar").await.unwrap();
    assert_eq!(duplicate.get("foo").await.unwrap().as_deref(), Some("bar"));
}

#[tokio::test]
async fn test_announced_addresses_are_remapped() {
    let internal = |i: u8| addr(&format!("172.17.0.{i}"), 6379);
    let public = |i: u8| addr("gateway", 17000 + u16::from(i));

    let sim = SimCluster::new(vec![
        SimShard::new(0, 8191, internal(1)),
        SimShard::new(8192, 16383, internal(2)),
    ]);
    for i in 1..=2 {
        sim.expose(public(i), internal(i));
    }

    let map = NodeAddressMap::from_pairs([
        (internal(1).to_string(), public(1)),
        (internal(2).to_string(), public(2)),
    ]);
    let config = ClusterConfig::with_root_nodes([public(1)]).with_node_address_map(map);
    let client = connect_with(&sim, config).await;

    let masters: Vec<_> = client.masters().into_iter().map(|n| n.address).collect();
    assert_eq!(masters, vec![public(1), public(2)]);

    // ASK names the internal address; it is mapped before connecting
    // "k" hashes to slot 7629
    sim.migrate(7629, internal(2));
    client.set("k", "v").await.unwrap();
    assert_eq!(
        sim.commands_to(&internal(2)),
        vec!["ASKING", "SET k v"]
    );
    assert_eq!(sim.connects(&internal(2)), 0);
}
