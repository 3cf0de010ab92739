//! MOVED / ASK handling against a simulated cluster

mod common;

use common::{addr, connect, connect_with, SimCluster, SimShard};
use cluster_oxide::{ClusterEvent, CommandOptions, RedisError};
use futures_util::future::join_all;
use std::time::Duration;

// "k" hashes to slot 7629, served by 10.0.0.2:7000 and its replica 10.0.0.5:7000

#[tokio::test]
async fn test_moved_after_failover_refreshes_once() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;
    let mut events = client.events();

    sim.fail_over_second_shard();
    client.set("k", "v").await.unwrap();

    assert_eq!(sim.value("k").as_deref(), Some(&b"v"[..]));
    assert_eq!(sim.count("CLUSTER SLOTS"), 2);
    assert_eq!(
        sim.receivers_of("SET k v"),
        vec![addr("10.0.0.2", 7000), addr("10.0.0.5", 7000)]
    );
    assert_eq!(sim.count("ASKING"), 0);

    // The refresh starts at the node that answered MOVED
    let old_master = sim.commands_to(&addr("10.0.0.2", 7000));
    assert_eq!(old_master, vec!["SET k v", "CLUSTER SLOTS"]);

    let master = client.get_slot_master(7629).await.unwrap();
    assert_eq!(master.address, addr("10.0.0.5", 7000));

    let mut refreshed = None;
    while let Ok(event) = events.try_recv() {
        if let ClusterEvent::TopologyRefreshed { epoch, shards } = event {
            refreshed = Some((epoch, shards));
        }
    }
    assert_eq!(refreshed, Some((2, 3)));
}

#[tokio::test]
async fn test_ask_sends_asking_without_refresh() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;
    sim.clear_log();

    sim.migrate(7629, addr("10.0.0.1", 7000));
    client.set("k", "v").await.unwrap();
    client.set("k", "w").await.unwrap();

    assert_eq!(sim.count("CLUSTER SLOTS"), 0);
    assert_eq!(
        sim.commands_to(&addr("10.0.0.1", 7000)),
        vec!["ASKING", "SET k v", "ASKING", "SET k w"]
    );
    assert_eq!(sim.value("k").as_deref(), Some(&b"w"[..]));

    // The table still names the migrating owner
    let master = client.get_slot_master(7629).await.unwrap();
    assert_eq!(master.address, addr("10.0.0.2", 7000));
}

#[tokio::test]
async fn test_concurrent_ask_keeps_asking_next_to_its_command() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;
    sim.clear_log();

    sim.migrate(7629, addr("10.0.0.1", 7000));
    sim.set_delay(Some(Duration::from_millis(20)));
    let (a, b) = tokio::join!(client.set("k", "a"), client.set("k", "b"));
    a.unwrap();
    b.unwrap();

    assert_eq!(sim.count("CLUSTER SLOTS"), 0);
    let log = sim.commands_to(&addr("10.0.0.1", 7000));
    assert_eq!(log.len(), 4);
    for pair in log.chunks(2) {
        assert_eq!(pair[0], "ASKING");
        assert!(pair[1].starts_with("SET k "), "unexpected {pair:?}");
    }
}

#[tokio::test]
async fn test_ask_to_unknown_node_fails_after_one_refresh() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;

    sim.migrate(7629, addr("10.9.9.9", 7000));
    let result = client.get("k").await;

    match result {
        Err(RedisError::NodeNotFound(address)) => assert_eq!(address, "10.9.9.9:7000"),
        other => panic!("expected NodeNotFound, got {other:?}"),
    }
    assert_eq!(sim.count("CLUSTER SLOTS"), 2);
    assert_eq!(sim.count("ASKING"), 0);
}

#[tokio::test]
async fn test_concurrent_moved_replies_share_one_refresh() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;

    sim.fail_over_second_shard();
    sim.set_delay(Some(Duration::from_millis(10)));
    let results = join_all((0..8).map(|_| client.get("k"))).await;

    assert!(results.iter().all(|r| matches!(r, Ok(None))));
    assert_eq!(sim.count("CLUSTER SLOTS"), 2);
    let receivers = sim.receivers_of("GET k");
    let old = receivers.iter().filter(|a| **a == addr("10.0.0.2", 7000)).count();
    let new = receivers.iter().filter(|a| **a == addr("10.0.0.5", 7000)).count();
    assert_eq!((old, new), (8, 8));
}

#[tokio::test]
async fn test_redirections_are_bounded() {
    let sim = SimCluster::three_shards();
    let owner = addr("10.0.0.2", 7000);
    let client = connect_with(&sim, sim.config().with_max_command_redirections(3)).await;

    for _ in 0..10 {
        sim.force_reply(&owner, "MOVED 7629 10.0.0.2:7000");
    }
    let result = client.get("k").await;

    assert!(matches!(result, Err(RedisError::Moved { slot: 7629, .. })));
    assert_eq!(sim.receivers_of("GET k").len(), 4);
    assert_eq!(sim.count("CLUSTER SLOTS"), 4);
}

#[tokio::test]
async fn test_zero_redirections_returns_first_redirect() {
    let sim = SimCluster::three_shards();
    let owner = addr("10.0.0.2", 7000);
    let client = connect_with(&sim, sim.config().with_max_command_redirections(0)).await;

    sim.force_reply(&owner, "ASK 7629 10.0.0.1:7000");
    let result = client.get("k").await;

    assert!(matches!(result, Err(RedisError::Ask { slot: 7629, .. })));
    assert_eq!(sim.receivers_of("GET k"), vec![owner]);
    assert_eq!(sim.count("ASKING"), 0);
}

#[tokio::test]
async fn test_other_errors_are_not_retried() {
    let sim = SimCluster::three_shards();
    let owner = addr("10.0.0.2", 7000);
    let client = connect(&sim).await;

    sim.force_reply(&owner, "WRONGTYPE Operation against a key holding the wrong kind of value");
    let result = client.get("k").await;

    assert!(result.is_err());
    assert!(!matches!(result, Err(RedisError::Moved { .. } | RedisError::Ask { .. })));
    assert_eq!(sim.receivers_of("GET k").len(), 1);
    assert_eq!(sim.count("CLUSTER SLOTS"), 1);
}

#[tokio::test]
async fn test_closed_connection_is_retried_after_refresh() {
    let sim = SimCluster::three_shards();
    let owner = addr("10.0.0.2", 7000);
    let client = connect(&sim).await;

    sim.force_close(&owner);
    assert_eq!(client.get("k").await.unwrap(), None);

    assert_eq!(sim.receivers_of("GET k").len(), 2);
    assert_eq!(sim.count("CLUSTER SLOTS"), 2);
    assert_eq!(sim.connects(&owner), 2);
}

#[tokio::test]
async fn test_topology_change_adds_and_removes_nodes() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;
    let mut events = client.events();

    // 10.0.0.1 leaves; its slots move to the new node 10.0.0.7
    sim.set_shards(vec![
        SimShard::new(0, 5460, addr("10.0.0.7", 7000)).with_replica(addr("10.0.0.4", 7000)),
        SimShard::new(5461, 10922, addr("10.0.0.2", 7000)).with_replica(addr("10.0.0.5", 7000)),
        SimShard::new(10923, 16383, addr("10.0.0.3", 7000)).with_replica(addr("10.0.0.6", 7000)),
    ]);

    // "bar" hashes to slot 5061
    client.set("bar", "1").await.unwrap();
    assert_eq!(
        sim.receivers_of("SET bar 1"),
        vec![addr("10.0.0.1", 7000), addr("10.0.0.7", 7000)]
    );

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&ClusterEvent::NodeAdded(addr("10.0.0.7", 7000))));
    assert!(seen.contains(&ClusterEvent::NodeRemoved(addr("10.0.0.1", 7000))));
    assert!(seen.contains(&ClusterEvent::NodeConnected(addr("10.0.0.7", 7000))));
    assert_eq!(sim.open_connections_to(&addr("10.0.0.1", 7000)), 0);
    assert!(client.node_by_address(&addr("10.0.0.1", 7000)).is_none());
}

#[tokio::test]
async fn test_deadline_aborts_slow_calls() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;

    sim.set_delay(Some(Duration::from_millis(200)));
    let deadline = Duration::from_millis(20);
    let hurried = client.with_command_options(CommandOptions::default().with_timeout(deadline));

    match hurried.get("k").await {
        Err(RedisError::Aborted(d)) => assert_eq!(d, deadline),
        other => panic!("expected Aborted, got {other:?}"),
    }

    sim.set_delay(None);
    assert_eq!(hurried.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_refresh_outlives_an_aborted_caller() {
    let sim = SimCluster::three_shards();
    let client = connect(&sim).await;
    let mut events = client.events();

    // 10.0.0.1 leaves; its slots move to 10.0.0.7
    sim.set_shards(vec![
        SimShard::new(0, 5460, addr("10.0.0.7", 7000)),
        SimShard::new(5461, 10922, addr("10.0.0.2", 7000)),
        SimShard::new(10923, 16383, addr("10.0.0.3", 7000)),
    ]);
    sim.set_delay(Some(Duration::from_millis(30)));

    // MOVED arrives after 30ms, the refresh answers after 60ms
    let deadline = Duration::from_millis(45);
    let hurried = client.with_command_options(CommandOptions::default().with_timeout(deadline));
    assert!(matches!(hurried.set("bar", "1").await, Err(RedisError::Aborted(_))));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let master = client.get_slot_master(5061).await.unwrap();
    assert_eq!(master.address, addr("10.0.0.7", 7000));
    assert_eq!(sim.open_connections_to(&addr("10.0.0.1", 7000)), 0);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&ClusterEvent::NodeRemoved(addr("10.0.0.1", 7000))));
    assert!(seen.contains(&ClusterEvent::TopologyRefreshed { epoch: 2, shards: 3 }));
}
