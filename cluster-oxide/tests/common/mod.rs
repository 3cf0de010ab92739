//! In-memory Redis Cluster used by the integration tests
//!
//! `SimCluster` is both the cluster and the [`Connector`] handed to the
//! client. It keeps an authoritative slot layout, answers `CLUSTER SLOTS`
//! from it and replies `MOVED`/`ASK` the way a real node would when asked
//! about a slot it does not serve. Every command is logged per node.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cluster_oxide::{
    calculate_slot, ClusterClient, ClusterConfig, Cmd, Connector, NodeAddress, NodeConnection,
    PubSubListener, PubSubMessage, RedisError, RedisResult, RespValue, Script, SubscriptionKind,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub fn addr(host: &str, port: u16) -> NodeAddress {
    NodeAddress::new(host, port)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Connect a client to `sim` with the default test settings
pub async fn connect(sim: &SimCluster) -> ClusterClient {
    connect_with(sim, sim.config()).await
}

pub async fn connect_with(sim: &SimCluster, config: ClusterConfig) -> ClusterClient {
    init_tracing();
    ClusterClient::connect_with(config, Arc::new(sim.clone()))
        .await
        .expect("connect to simulated cluster")
}

/// One slot range and the nodes serving it
#[derive(Debug, Clone)]
pub struct SimShard {
    pub start: u16,
    pub end: u16,
    pub master: NodeAddress,
    pub replicas: Vec<NodeAddress>,
}

impl SimShard {
    pub fn new(start: u16, end: u16, master: NodeAddress) -> Self {
        Self {
            start,
            end,
            master,
            replicas: Vec::new(),
        }
    }

    pub fn with_replica(mut self, replica: NodeAddress) -> Self {
        self.replicas.push(replica);
        self
    }
}

enum Forced {
    Reply(String),
    Closed,
}

#[derive(Default)]
struct State {
    shards: Vec<SimShard>,
    ask: HashMap<u16, NodeAddress>,
    aliases: HashMap<NodeAddress, NodeAddress>,
    replica_reads: bool,
    data: HashMap<Bytes, Bytes>,
    scripts: HashMap<NodeAddress, HashSet<String>>,
    forced: HashMap<NodeAddress, VecDeque<Forced>>,
    down: HashSet<NodeAddress>,
    delay: Option<Duration>,
    log: Vec<(NodeAddress, String)>,
    connects: HashMap<NodeAddress, usize>,
    connections: Vec<Weak<SimConnection>>,
}

impl State {
    fn shard_for(&self, slot: u16) -> Option<&SimShard> {
        self.shards
            .iter()
            .find(|shard| shard.start <= slot && slot <= shard.end)
    }

    /// Error reply a node gives for a slot it does not serve
    fn check_owner(
        &self,
        node: &NodeAddress,
        slot: u16,
        asking: bool,
        write: bool,
    ) -> Result<(), String> {
        let Some(shard) = self.shard_for(slot) else {
            return Err("CLUSTERDOWN Hash slot not served".to_string());
        };

        if let Some(target) = self.ask.get(&slot) {
            if node == target && asking {
                return Ok(());
            }
            if node == &shard.master {
                return Err(format!("ASK {slot} {target}"));
            }
        }

        let replica_read = !write && self.replica_reads && shard.replicas.contains(node);
        if node == &shard.master || replica_read {
            Ok(())
        } else {
            Err(format!("MOVED {slot} {}", shard.master))
        }
    }

    fn cluster_slots(&self) -> RespValue {
        let node = |address: &NodeAddress| {
            RespValue::Array(vec![
                RespValue::from(address.host.as_str()),
                RespValue::Integer(i64::from(address.port)),
                RespValue::from(format!("node-{}-{}", address.host, address.port)),
            ])
        };
        RespValue::Array(
            self.shards
                .iter()
                .map(|shard| {
                    let mut row = vec![
                        RespValue::Integer(i64::from(shard.start)),
                        RespValue::Integer(i64::from(shard.end)),
                        node(&shard.master),
                    ];
                    row.extend(shard.replicas.iter().map(&node));
                    RespValue::Array(row)
                })
                .collect(),
        )
    }

    fn live_connections(&self) -> Vec<Arc<SimConnection>> {
        self.connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_open())
            .collect()
    }
}

/// A simulated cluster and the connector that reaches it
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<State>>,
}

impl SimCluster {
    pub fn new(shards: Vec<SimShard>) -> Self {
        let sim = Self::default();
        sim.set_shards(shards);
        sim
    }

    /// Masters 10.0.0.1-3:7000 with replicas 10.0.0.4-6:7000
    pub fn three_shards() -> Self {
        Self::new(three_shard_layout())
    }

    pub fn config(&self) -> ClusterConfig {
        ClusterConfig::with_root_nodes([addr("10.0.0.1", 7000)])
    }

    pub fn set_shards(&self, shards: Vec<SimShard>) {
        self.state.lock().shards = shards;
    }

    /// Promote the replica of the 5461-10922 shard
    pub fn fail_over_second_shard(&self) {
        let mut shards = three_shard_layout();
        shards[1] = SimShard::new(5461, 10922, addr("10.0.0.5", 7000))
            .with_replica(addr("10.0.0.2", 7000));
        self.set_shards(shards);
    }

    /// Let replicas answer read commands
    pub fn allow_replica_reads(&self) {
        self.state.lock().replica_reads = true;
    }

    /// Answer `ASK` for `slot`, pointing at `target`
    pub fn migrate(&self, slot: u16, target: NodeAddress) {
        self.state.lock().ask.insert(slot, target);
    }

    /// Reach the node announced as `announced` through `address`
    pub fn expose(&self, address: NodeAddress, announced: NodeAddress) {
        self.state.lock().aliases.insert(address, announced);
    }

    /// Queue an error reply for the next data command sent to `node`
    pub fn force_reply(&self, node: &NodeAddress, reply: &str) {
        self.state
            .lock()
            .forced
            .entry(node.clone())
            .or_default()
            .push_back(Forced::Reply(reply.to_string()));
    }

    /// Drop the connection that carries the next data command sent to `node`
    pub fn force_close(&self, node: &NodeAddress) {
        self.state
            .lock()
            .forced
            .entry(node.clone())
            .or_default()
            .push_back(Forced::Closed);
    }

    /// Refuse connections to `node`
    pub fn take_down(&self, node: &NodeAddress) {
        self.state.lock().down.insert(node.clone());
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.state.lock().data.get(key.as_bytes()).cloned()
    }

    /// Commands received by `node`, in order
    pub fn commands_to(&self, node: &NodeAddress) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(address, _)| address == node)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Nodes that received exactly `cmd`
    pub fn receivers_of(&self, cmd: &str) -> Vec<NodeAddress> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(_, logged)| logged == cmd)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Number of logged commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(_, cmd)| cmd.starts_with(prefix))
            .count()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Connection attempts made to `address`
    pub fn connects(&self, address: &NodeAddress) -> usize {
        self.state.lock().connects.get(address).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.state.lock().connects.values().sum()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().live_connections().len()
    }

    pub fn open_connections_to(&self, node: &NodeAddress) -> usize {
        self.state
            .lock()
            .live_connections()
            .iter()
            .filter(|c| &c.node == node)
            .count()
    }
}

fn three_shard_layout() -> Vec<SimShard> {
    vec![
        SimShard::new(0, 5460, addr("10.0.0.1", 7000)).with_replica(addr("10.0.0.4", 7000)),
        SimShard::new(5461, 10922, addr("10.0.0.2", 7000)).with_replica(addr("10.0.0.5", 7000)),
        SimShard::new(10923, 16383, addr("10.0.0.3", 7000)).with_replica(addr("10.0.0.6", 7000)),
    ]
}

#[async_trait]
impl Connector for SimCluster {
    async fn connect(&self, address: &NodeAddress) -> RedisResult<Arc<dyn NodeConnection>> {
        let mut state = self.state.lock();
        *state.connects.entry(address.clone()).or_default() += 1;
        if state.down.contains(address) {
            return Err(RedisError::Connection(format!(
                "Failed to connect to {address}: connection refused"
            )));
        }

        let node = state
            .aliases
            .get(address)
            .cloned()
            .unwrap_or_else(|| address.clone());
        let connection = Arc::new(SimConnection {
            address: address.clone(),
            node,
            cluster: self.clone(),
            open: AtomicBool::new(true),
            asking: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
        });
        state.connections.push(Arc::downgrade(&connection));
        Ok(connection)
    }
}

/// One client connection to a simulated node
pub struct SimConnection {
    address: NodeAddress,
    node: NodeAddress,
    cluster: SimCluster,
    open: AtomicBool,
    asking: AtomicBool,
    subscriptions: Mutex<HashMap<(SubscriptionKind, String), PubSubListener>>,
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}

fn routing_key(name: &str, args: &[Bytes]) -> Option<Bytes> {
    match name {
        "EVAL" | "EVALSHA" => {
            let numkeys: usize = std::str::from_utf8(args.get(1)?).ok()?.parse().ok()?;
            (numkeys > 0).then(|| args.get(2).cloned()).flatten()
        }
        _ => args.first().cloned(),
    }
}

fn is_write(name: &str) -> bool {
    !matches!(name, "GET" | "EXISTS" | "TTL")
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

impl SimConnection {
    fn closed(&self) -> RedisError {
        RedisError::ConnectionClosed(self.address.to_string())
    }

    async fn pause(&self) {
        let delay = self.cluster.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Raw reply to `cmd`; `Err` only for a broken connection
    fn reply(&self, cmd: &Cmd) -> RedisResult<RespValue> {
        if !self.is_open() {
            return Err(self.closed());
        }

        let mut state = self.cluster.state.lock();
        state.log.push((self.node.clone(), cmd.to_string()));
        let name = cmd.name().to_ascii_uppercase();
        let args = cmd.args();

        match name.as_str() {
            "CLUSTER" => return Ok(state.cluster_slots()),
            "ASKING" => {
                self.asking.store(true, Ordering::SeqCst);
                return Ok(ok());
            }
            "READONLY" => return Ok(ok()),
            _ => {}
        }

        match state.forced.get_mut(&self.node).and_then(VecDeque::pop_front) {
            Some(Forced::Reply(reply)) => return Ok(RespValue::Error(reply)),
            Some(Forced::Closed) => {
                self.open.store(false, Ordering::SeqCst);
                return Err(self.closed());
            }
            None => {}
        }

        match name.as_str() {
            "PING" => return Ok(RespValue::SimpleString("PONG".to_string())),
            "PUBLISH" => {
                let channel = String::from_utf8_lossy(&args[0]).into_owned();
                let receivers = deliver(&state, &channel, &args[1], |_, kind, subscribed| {
                    match kind {
                        SubscriptionKind::Channel => subscribed == channel,
                        SubscriptionKind::Pattern => pattern_matches(subscribed, &channel),
                        SubscriptionKind::Sharded => false,
                    }
                });
                return Ok(RespValue::Integer(receivers));
            }
            _ => {}
        }

        let asking = self.asking.swap(false, Ordering::SeqCst);
        if let Some(key) = routing_key(&name, args) {
            let slot = calculate_slot(&key);
            if let Err(reply) = state.check_owner(&self.node, slot, asking, is_write(&name)) {
                return Ok(RespValue::Error(reply));
            }
        }

        let reply = match name.as_str() {
            "GET" => state
                .data
                .get(&args[0])
                .cloned()
                .map_or(RespValue::Null, RespValue::BulkString),
            "SET" => {
                state.data.insert(args[0].clone(), args[1].clone());
                ok()
            }
            "DEL" => RespValue::Integer(i64::from(state.data.remove(&args[0]).is_some())),
            "INCR" | "INCRBY" => {
                let by = match args.get(1) {
                    Some(by) => String::from_utf8_lossy(by).parse::<i64>().unwrap_or(0),
                    None => 1,
                };
                let current = state
                    .data
                    .get(&args[0])
                    .map(|v| String::from_utf8_lossy(v).parse::<i64>().unwrap_or(0))
                    .unwrap_or(0);
                let next = current + by;
                state
                    .data
                    .insert(args[0].clone(), Bytes::from(next.to_string()));
                RespValue::Integer(next)
            }
            "SPUBLISH" => {
                let channel = String::from_utf8_lossy(&args[0]).into_owned();
                let node = self.node.clone();
                let receivers = deliver(&state, &channel, &args[1], |c, kind, subscribed| {
                    c.node == node && kind == SubscriptionKind::Sharded && subscribed == channel
                });
                RespValue::Integer(receivers)
            }
            "EVALSHA" => {
                let sha = String::from_utf8_lossy(&args[0]).into_owned();
                let known = state
                    .scripts
                    .get(&self.node)
                    .is_some_and(|scripts| scripts.contains(&sha));
                if known {
                    RespValue::Integer(1)
                } else {
                    RespValue::Error("NOSCRIPT No matching script. Please use EVAL.".to_string())
                }
            }
            "EVAL" => {
                let script = Script::new(String::from_utf8_lossy(&args[0]).into_owned());
                state
                    .scripts
                    .entry(self.node.clone())
                    .or_default()
                    .insert(script.sha().to_string());
                RespValue::Integer(1)
            }
            other => RespValue::Error(format!("ERR unknown command '{other}'")),
        };
        Ok(reply)
    }
}

/// Send `payload` to every subscription accepted by `accepts`; returns the
/// number of receivers
fn deliver<F>(state: &State, channel: &str, payload: &Bytes, accepts: F) -> i64
where
    F: Fn(&SimConnection, SubscriptionKind, &str) -> bool,
{
    let mut receivers = 0;
    for connection in state.live_connections() {
        let subscriptions = connection.subscriptions.lock();
        for ((kind, subscribed), listener) in subscriptions.iter() {
            if !accepts(&connection, *kind, subscribed) {
                continue;
            }
            let message = PubSubMessage {
                kind: *kind,
                channel: channel.to_string(),
                payload: payload.clone(),
                pattern: (*kind == SubscriptionKind::Pattern).then(|| subscribed.clone()),
            };
            if listener.send(message).is_ok() {
                receivers += 1;
            }
        }
    }
    receivers
}

#[async_trait]
impl NodeConnection for SimConnection {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn send_command(&self, cmd: &Cmd) -> RedisResult<RespValue> {
        self.pause().await;
        self.reply(cmd)?.into_result()
    }

    async fn execute_pipeline(&self, cmds: &[Cmd]) -> RedisResult<Vec<RespValue>> {
        self.pause().await;
        cmds.iter().map(|cmd| self.reply(cmd)).collect()
    }

    async fn execute_multi(&self, cmds: &[Cmd]) -> RedisResult<Vec<RespValue>> {
        self.pause().await;
        let replies = cmds
            .iter()
            .map(|cmd| self.reply(cmd))
            .collect::<RedisResult<Vec<_>>>()?;
        if let Some(RespValue::Error(reply)) = replies.iter().find(|r| r.is_error()) {
            return Err(RedisError::from_server_reply(reply.clone()));
        }
        Ok(replies)
    }

    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        channels: &[String],
        listener: PubSubListener,
    ) -> RedisResult<()> {
        if !self.is_open() {
            return Err(self.closed());
        }
        {
            let state = self.cluster.state.lock();
            if kind == SubscriptionKind::Sharded {
                for channel in channels {
                    let slot = calculate_slot(channel.as_bytes());
                    state
                        .check_owner(&self.node, slot, false, true)
                        .map_err(RedisError::from_server_reply)?;
                }
            }
        }
        {
            let mut state = self.cluster.state.lock();
            state.log.push((
                self.node.clone(),
                format!("{} {}", kind.subscribe_command(), channels.join(" ")),
            ));
        }

        let mut subscriptions = self.subscriptions.lock();
        for channel in channels {
            subscriptions.insert((kind, channel.clone()), listener.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, kind: SubscriptionKind, channels: &[String]) -> RedisResult<()> {
        if !self.is_open() {
            return Err(self.closed());
        }
        self.cluster.state.lock().log.push((
            self.node.clone(),
            format!("{} {}", kind.unsubscribe_command(), channels.join(" "))
                .trim_end()
                .to_string(),
        ));

        let mut subscriptions = self.subscriptions.lock();
        if channels.is_empty() {
            subscriptions.retain(|(k, _), _| *k != kind);
        } else {
            for channel in channels {
                subscriptions.remove(&(kind, channel.clone()));
            }
        }
        Ok(())
    }

    fn is_pubsub_active(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.subscriptions.lock().clear();
    }
}
