//! Low-level TCP connection to a single cluster node
//!
//! Handles the socket, the connection handshake (AUTH, CLIENT SETNAME,
//! READONLY) and request/response framing. Multiplexing and the node-level
//! capability live in [`crate::node`].

use crate::command::Cmd;
use crate::protocol::{RespDecoder, RespEncoder};
use bytes::{Buf, Bytes, BytesMut};
use cluster_oxide_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    types::NodeAddress,
    value::RespValue,
};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A connection to one Redis node
pub struct RedisConnection {
    stream: TcpStream,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    address: NodeAddress,
    config: ConnectionConfig,
}

impl RedisConnection {
    /// Connect to a node and run the handshake
    pub async fn connect(address: &NodeAddress, config: ConnectionConfig) -> RedisResult<Self> {
        debug!("Connecting to cluster node {}", address);

        let target = (address.host.as_str(), address.port);
        let stream = timeout(config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| {
                RedisError::Connection(format!("Failed to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true)?;

        if let Some(keepalive_duration) = config.tcp_keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
            socket2::SockRef::from(&stream)
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| {
                    RedisError::Connection(format!("Failed to set TCP keepalive: {}", e))
                })?;
        }

        let mut conn = Self {
            stream,
            read_buffer: BytesMut::with_capacity(8192),
            write_buffer: BytesMut::with_capacity(1024),
            address: address.clone(),
            config,
        };
        conn.handshake().await?;

        Ok(conn)
    }

    /// Address this connection talks to
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn handshake(&mut self) -> RedisResult<()> {
        if let Some(password) = self.config.password.clone() {
            debug!("Authenticating with {}", self.address);
            let auth = match self.config.username.clone() {
                Some(username) => Cmd::new("AUTH").arg(username).arg(password),
                None => Cmd::new("AUTH").arg(password),
            };
            match self.execute_command(&auth).await {
                Ok(reply) if reply.is_ok() => {}
                Ok(other) => {
                    return Err(RedisError::Auth(format!(
                        "Unexpected authentication response: {other:?}"
                    )))
                }
                Err(RedisError::Server(msg)) => return Err(RedisError::Auth(msg)),
                Err(e) => return Err(e),
            }
        }

        if let Some(name) = self.config.client_name.clone() {
            self.execute_command(&Cmd::new("CLIENT").arg("SETNAME").arg(name))
                .await?;
        }

        if self.config.read_only {
            self.execute_command(&Cmd::new("READONLY")).await?;
        }

        Ok(())
    }

    /// Execute a command and return its reply.
    ///
    /// Error replies are classified into [`RedisError`] variants, so a redirect
    /// surfaces as [`RedisError::Moved`] or [`RedisError::Ask`].
    pub async fn execute_command(&mut self, cmd: &Cmd) -> RedisResult<RespValue> {
        let mut replies = self.execute_batch(std::slice::from_ref(cmd)).await?;
        replies
            .pop()
            .ok_or_else(|| RedisError::Protocol("Missing reply".to_string()))?
            .into_result()
    }

    /// Write all commands at once and read one raw reply per command.
    ///
    /// Error replies are returned as [`RespValue::Error`] values in place.
    pub async fn execute_batch(&mut self, cmds: &[Cmd]) -> RedisResult<Vec<RespValue>> {
        self.send(cmds).await?;

        let mut replies = Vec::with_capacity(cmds.len());
        for _ in 0..cmds.len() {
            let reply = timeout(self.config.operation_timeout, self.read_response())
                .await
                .map_err(|_| RedisError::Timeout)??;
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Write commands without waiting for replies
    pub async fn send(&mut self, cmds: &[Cmd]) -> RedisResult<()> {
        self.write_buffer.clear();
        for cmd in cmds {
            RespEncoder::encode_command(cmd.name(), cmd.args(), &mut self.write_buffer);
        }
        let frame: Bytes = self.write_buffer.split().freeze();

        timeout(self.config.operation_timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(RedisError::Io)
    }

    /// Read one complete reply.
    ///
    /// Cancel-safe: partially received data stays in the read buffer.
    pub async fn read_response(&mut self) -> RedisResult<RespValue> {
        loop {
            let mut cursor = Cursor::new(&self.read_buffer[..]);
            if let Some(value) = RespDecoder::decode(&mut cursor)? {
                let pos = cursor.position() as usize;
                self.read_buffer.advance(pos);
                return Ok(value);
            }

            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(RedisError::Connection(format!(
                    "Connection to {} closed by server",
                    self.address
                )));
            }
        }
    }
}
