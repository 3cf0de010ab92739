//! Per-node connections
//!
//! [`NodeConnection`] is the capability the cluster layer needs from a single
//! node: run commands, scripts, pipelines and transactions, send `ASKING`, and
//! manage pub/sub subscriptions. [`Connector`] creates connections for an
//! address.
//!
//! The production implementation, [`NodeClient`], multiplexes every caller
//! over one TCP connection owned by a background task. Requests travel over an
//! mpsc channel and are answered through oneshot channels. While the
//! connection has active subscriptions the task also reads push frames and
//! forwards messages to the registered listeners.

use crate::command::Cmd;
use crate::connection::RedisConnection;
use crate::pubsub::{PubSubListener, PubSubMessage, PushKind, SubscriptionKind};
use crate::script::Script;
use async_trait::async_trait;
use bytes::Bytes;
use cluster_oxide_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    types::NodeAddress,
    value::RespValue,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Operations the cluster layer performs against one node
#[async_trait]
pub trait NodeConnection: Send + Sync {
    /// Address the connection was opened to
    fn address(&self) -> &NodeAddress;

    /// Run one command; error replies come back as classified errors
    async fn send_command(&self, cmd: &Cmd) -> RedisResult<RespValue>;

    /// Run several commands back to back and return the raw replies in order
    async fn execute_pipeline(&self, cmds: &[Cmd]) -> RedisResult<Vec<RespValue>>;

    /// Run commands inside `MULTI`/`EXEC` and return the `EXEC` results
    async fn execute_multi(&self, cmds: &[Cmd]) -> RedisResult<Vec<RespValue>>;

    /// Subscribe `channels` and forward their messages to `listener`
    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        channels: &[String],
        listener: PubSubListener,
    ) -> RedisResult<()>;

    /// Unsubscribe `channels`; an empty list drops every subscription of `kind`
    async fn unsubscribe(&self, kind: SubscriptionKind, channels: &[String]) -> RedisResult<()>;

    /// True while at least one subscription is active
    fn is_pubsub_active(&self) -> bool;

    /// False once closed or broken
    fn is_open(&self) -> bool;

    /// Close the connection; in-flight and later calls fail with
    /// [`RedisError::ConnectionClosed`]
    async fn close(&self);

    /// Run a script, loading it with `EVAL` when the node does not know it.
    ///
    /// With `asking` set every attempt is preceded by `ASKING`.
    async fn execute_script(
        &self,
        script: &Script,
        keys: &[Bytes],
        args: &[Bytes],
        asking: bool,
    ) -> RedisResult<RespValue> {
        match self.send_redirected(&script.evalsha_cmd(keys, args), asking).await {
            Err(e) if e.is_noscript() => {
                debug!("Script {} not cached on {}, sending source", script.sha(), self.address());
                self.send_redirected(&script.eval_cmd(keys, args), asking).await
            }
            other => other,
        }
    }

    /// Run one command, preceded by `ASKING` when `asking` is set.
    ///
    /// `ASKING` only covers the next command on the connection, so both go
    /// out as one pipeline that no other caller can split.
    async fn send_redirected(&self, cmd: &Cmd, asking: bool) -> RedisResult<RespValue> {
        if !asking {
            return self.send_command(cmd).await;
        }

        let mut replies = self
            .execute_pipeline(&[Cmd::new("ASKING"), cmd.clone()])
            .await?
            .into_iter();
        match (replies.next(), replies.next()) {
            (Some(ack), Some(reply)) if ack.is_ok() => reply.into_result(),
            (Some(ack), Some(_)) => Err(RedisError::UnexpectedResponse(format!(
                "ASKING answered with {ack:?}"
            ))),
            _ => Err(RedisError::Protocol("Missing reply to ASKING".to_string())),
        }
    }
}

/// Creates node connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `address`
    async fn connect(&self, address: &NodeAddress) -> RedisResult<Arc<dyn NodeConnection>>;
}

/// Connects over TCP using the cluster's default connection options
#[derive(Debug, Clone)]
pub struct TcpConnector {
    defaults: ConnectionConfig,
}

impl TcpConnector {
    /// Create a connector that applies `defaults` to every node
    pub fn new(defaults: ConnectionConfig) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &NodeAddress) -> RedisResult<Arc<dyn NodeConnection>> {
        let client = NodeClient::connect(address, self.defaults.clone()).await?;
        Ok(Arc::new(client))
    }
}

enum Request {
    Batch {
        cmds: Vec<Cmd>,
        tx: oneshot::Sender<RedisResult<Vec<RespValue>>>,
    },
    Subscribe {
        kind: SubscriptionKind,
        channels: Vec<String>,
        listener: PubSubListener,
        tx: oneshot::Sender<RedisResult<()>>,
    },
    Unsubscribe {
        kind: SubscriptionKind,
        channels: Vec<String>,
        tx: oneshot::Sender<RedisResult<()>>,
    },
}

struct Shared {
    open: AtomicBool,
    subscriptions: AtomicUsize,
    shutdown: Notify,
}

/// Multiplexed connection to one node
pub struct NodeClient {
    address: NodeAddress,
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
}

impl NodeClient {
    /// Connect and start the background task.
    ///
    /// Connection and handshake errors are returned to the caller.
    pub async fn connect(address: &NodeAddress, config: ConnectionConfig) -> RedisResult<Self> {
        let conn = RedisConnection::connect(address, config).await?;
        let (requests, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            subscriptions: AtomicUsize::new(0),
            shutdown: Notify::new(),
        });

        tokio::spawn(run(conn, rx, Arc::clone(&shared)));

        Ok(Self {
            address: address.clone(),
            requests,
            shared,
        })
    }

    fn closed(&self) -> RedisError {
        RedisError::ConnectionClosed(self.address.to_string())
    }

    async fn batch(&self, cmds: Vec<Cmd>) -> RedisResult<Vec<RespValue>> {
        if !self.is_open() {
            return Err(self.closed());
        }
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Batch { cmds, tx })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    async fn ack(&self, request: Request, rx: oneshot::Receiver<RedisResult<()>>) -> RedisResult<()> {
        if !self.is_open() {
            return Err(self.closed());
        }
        self.requests.send(request).map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl NodeConnection for NodeClient {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn send_command(&self, cmd: &Cmd) -> RedisResult<RespValue> {
        self.batch(vec![cmd.clone()])
            .await?
            .pop()
            .ok_or_else(|| RedisError::Protocol("Missing reply".to_string()))?
            .into_result()
    }

    async fn execute_pipeline(&self, cmds: &[Cmd]) -> RedisResult<Vec<RespValue>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        self.batch(cmds.to_vec()).await
    }

    async fn execute_multi(&self, cmds: &[Cmd]) -> RedisResult<Vec<RespValue>> {
        let mut batch = Vec::with_capacity(cmds.len() + 2);
        batch.push(Cmd::new("MULTI"));
        batch.extend_from_slice(cmds);
        batch.push(Cmd::new("EXEC"));

        let mut replies = self.batch(batch).await?;
        let exec = replies
            .pop()
            .ok_or_else(|| RedisError::Protocol("Missing EXEC reply".to_string()))?;

        if let Some(first) = replies.first() {
            if !first.is_ok() {
                return Err(first.clone().into_result().err().unwrap_or_else(|| {
                    RedisError::UnexpectedResponse(format!("MULTI answered with {first:?}"))
                }));
            }
        }

        match exec.into_result()? {
            RespValue::Array(items) => Ok(items),
            RespValue::Null => Err(RedisError::Server(
                "EXECABORT Transaction discarded because a watched key changed".to_string(),
            )),
            other => Err(RedisError::UnexpectedResponse(format!(
                "EXEC answered with {other:?}"
            ))),
        }
    }

    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        channels: &[String],
        listener: PubSubListener,
    ) -> RedisResult<()> {
        if channels.is_empty() {
            return Err(RedisError::PubSub(format!(
                "{} requires at least one channel",
                kind.subscribe_command()
            )));
        }
        let (tx, rx) = oneshot::channel();
        let request = Request::Subscribe {
            kind,
            channels: channels.to_vec(),
            listener,
            tx,
        };
        self.ack(request, rx).await
    }

    async fn unsubscribe(&self, kind: SubscriptionKind, channels: &[String]) -> RedisResult<()> {
        let (tx, rx) = oneshot::channel();
        let request = Request::Unsubscribe {
            kind,
            channels: channels.to_vec(),
            tx,
        };
        self.ack(request, rx).await
    }

    fn is_pubsub_active(&self) -> bool {
        self.shared.subscriptions.load(Ordering::Acquire) > 0
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            debug!("Closing connection to {}", self.address);
            self.shared.shutdown.notify_one();
        }
    }
}

/// Acknowledgements still expected for one subscribe/unsubscribe call
struct PendingAck {
    kind: SubscriptionKind,
    push: PushKind,
    channels: Vec<String>,
    remaining: usize,
    tx: oneshot::Sender<RedisResult<()>>,
}

#[derive(Default)]
struct Subscriptions {
    listeners: HashMap<(SubscriptionKind, String), PubSubListener>,
    pending: VecDeque<PendingAck>,
}

impl Subscriptions {
    fn in_pubsub_mode(&self) -> bool {
        !self.listeners.is_empty() || !self.pending.is_empty()
    }

    fn count(&self, kind: SubscriptionKind) -> usize {
        self.listeners.keys().filter(|(k, _)| *k == kind).count()
    }

    fn handle_push(&mut self, frame: RespValue) {
        let items = match frame {
            RespValue::Array(items) => items,
            RespValue::Error(msg) => return self.fail_pending(RedisError::from_server_reply(&msg)),
            other => {
                warn!("Unexpected frame while subscribed: {:?}", other);
                return;
            }
        };

        let Some(Ok(name)) = items.first().map(RespValue::as_string) else {
            warn!("Push frame without a type");
            return;
        };
        let Some((kind, push)) = SubscriptionKind::from_push(&name.to_ascii_lowercase()) else {
            debug!("Ignoring push frame {}", name);
            return;
        };

        match push {
            PushKind::Message => self.deliver(kind, &items),
            PushKind::Subscribed | PushKind::Unsubscribed => {
                let channel = items.get(1).and_then(|v| v.as_string().ok());
                self.acknowledge(kind, push, channel);
            }
        }
    }

    fn deliver(&mut self, kind: SubscriptionKind, items: &[RespValue]) {
        let (pattern, channel, payload) = match (kind, items) {
            (SubscriptionKind::Pattern, [_, pattern, channel, payload]) => {
                (pattern.as_string().ok(), channel, payload)
            }
            (SubscriptionKind::Pattern, _) => return,
            (_, [_, channel, payload]) => (None, channel, payload),
            _ => return,
        };
        let Ok(channel) = channel.as_string() else {
            return;
        };
        let lookup = pattern.clone().unwrap_or_else(|| channel.clone());
        let Some(listener) = self.listeners.get(&(kind, lookup)) else {
            debug!("Message on {} without a listener", channel);
            return;
        };
        let payload = payload.as_bytes().unwrap_or_default();
        let _ = listener.send(PubSubMessage {
            kind,
            channel,
            payload,
            pattern,
        });
    }

    fn acknowledge(&mut self, kind: SubscriptionKind, push: PushKind, channel: Option<String>) {
        if push == PushKind::Unsubscribed {
            if let Some(channel) = &channel {
                self.listeners.remove(&(kind, channel.clone()));
            }
        }

        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.kind == kind && p.push == push)
        else {
            if push == PushKind::Unsubscribed {
                debug!("Server dropped {} subscription {:?}", kind, channel);
            }
            return;
        };

        let done = {
            let pending = &mut self.pending[index];
            pending.remaining = pending.remaining.saturating_sub(1);
            pending.remaining == 0
        };
        if done {
            if let Some(pending) = self.pending.remove(index) {
                let _ = pending.tx.send(Ok(()));
            }
        }
    }

    fn fail_pending(&mut self, error: RedisError) {
        let Some(pending) = self.pending.pop_front() else {
            warn!("Error reply while subscribed: {}", error);
            return;
        };
        if pending.push == PushKind::Subscribed {
            for channel in &pending.channels {
                self.listeners.remove(&(pending.kind, channel.clone()));
            }
        }
        let _ = pending.tx.send(Err(error));
    }
}

fn is_fatal(error: &RedisError) -> bool {
    matches!(
        error,
        RedisError::Io(_)
            | RedisError::Connection(_)
            | RedisError::ConnectionClosed(_)
            | RedisError::Protocol(_)
            | RedisError::Timeout
    )
}

async fn run(mut conn: RedisConnection, mut rx: mpsc::UnboundedReceiver<Request>, shared: Arc<Shared>) {
    let address = conn.address().clone();
    let mut subs = Subscriptions::default();

    loop {
        let in_pubsub = subs.in_pubsub_mode();
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            request = rx.recv() => {
                let Some(request) = request else { break };
                let keep_going = match request {
                    Request::Batch { cmds, tx } => {
                        if in_pubsub {
                            let _ = tx.send(Err(RedisError::PubSub(
                                "Connection is in subscriber mode".to_string(),
                            )));
                            continue;
                        }
                        let result = tokio::select! {
                            _ = shared.shutdown.notified() => {
                                Err(RedisError::ConnectionClosed(address.to_string()))
                            }
                            result = conn.execute_batch(&cmds) => result,
                        };
                        let fatal = matches!(&result, Err(e) if is_fatal(e));
                        let _ = tx.send(result);
                        !fatal
                    }
                    Request::Subscribe { kind, channels, listener, tx } => {
                        let cmd = Cmd::with_args(kind.subscribe_command(), channels.iter().cloned());
                        for channel in &channels {
                            subs.listeners.insert((kind, channel.clone()), listener.clone());
                        }
                        match conn.send(std::slice::from_ref(&cmd)).await {
                            Ok(()) => {
                                subs.pending.push_back(PendingAck {
                                    kind,
                                    push: PushKind::Subscribed,
                                    remaining: channels.len(),
                                    channels,
                                    tx,
                                });
                                true
                            }
                            Err(e) => {
                                for channel in &channels {
                                    subs.listeners.remove(&(kind, channel.clone()));
                                }
                                let fatal = is_fatal(&e);
                                let _ = tx.send(Err(e));
                                !fatal
                            }
                        }
                    }
                    Request::Unsubscribe { kind, channels, tx } => {
                        let expected = if channels.is_empty() {
                            subs.count(kind)
                        } else {
                            channels.len()
                        };
                        if expected == 0 {
                            let _ = tx.send(Ok(()));
                            continue;
                        }
                        let cmd = Cmd::with_args(kind.unsubscribe_command(), channels.iter().cloned());
                        match conn.send(std::slice::from_ref(&cmd)).await {
                            Ok(()) => {
                                subs.pending.push_back(PendingAck {
                                    kind,
                                    push: PushKind::Unsubscribed,
                                    remaining: expected,
                                    channels,
                                    tx,
                                });
                                true
                            }
                            Err(e) => {
                                let fatal = is_fatal(&e);
                                let _ = tx.send(Err(e));
                                !fatal
                            }
                        }
                    }
                };
                shared.subscriptions.store(subs.listeners.len(), Ordering::Release);
                if !keep_going {
                    break;
                }
            }
            frame = conn.read_response(), if in_pubsub => {
                match frame {
                    Ok(frame) => {
                        subs.handle_push(frame);
                        shared.subscriptions.store(subs.listeners.len(), Ordering::Release);
                    }
                    Err(e) => {
                        warn!("Subscriber connection to {} failed: {}", address, e);
                        break;
                    }
                }
            }
        }
    }

    shared.open.store(false, Ordering::Release);
    shared.subscriptions.store(0, Ordering::Release);
    for pending in subs.pending.drain(..) {
        let _ = pending
            .tx
            .send(Err(RedisError::ConnectionClosed(address.to_string())));
    }
    debug!("Connection handler for {} stopped", address);
}
