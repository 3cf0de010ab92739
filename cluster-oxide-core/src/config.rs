//! Configuration types for cluster connections

use crate::error::{RedisError, RedisResult};
use crate::types::{NodeAddress, DEFAULT_PORT};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on MOVED/ASK redirections followed by a single call
pub const DEFAULT_MAX_COMMAND_REDIRECTIONS: usize = 16;

/// Per-node connection settings, applied to every node of the cluster
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Optional ACL username
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Optional name announced with `CLIENT SETNAME`
    pub client_name: Option<String>,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Read/write operation timeout
    pub operation_timeout: Duration,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,

    /// Send `READONLY` after connecting so a replica serves reads
    pub read_only: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            client_name: None,
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            tcp_keepalive: Some(Duration::from_secs(60)),
            read_only: false,
        }
    }
}

impl ConnectionConfig {
    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set username and password for ACL authentication
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the client name
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the operation timeout
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set or disable TCP keepalive
    #[must_use]
    pub const fn with_tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = keepalive;
        self
    }

    /// Send `READONLY` on every new connection
    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Maps node addresses reported by the cluster to the addresses the client
/// should actually connect to.
///
/// Useful when the cluster runs on another network (NAT, containers) and the
/// addresses it announces are not reachable from the client.
#[derive(Clone)]
pub enum NodeAddressMap {
    /// Fixed table keyed by the announced `host:port`
    Static(HashMap<String, NodeAddress>),
    /// Arbitrary lookup; `None` keeps the announced address
    Dynamic(Arc<dyn Fn(&str) -> Option<NodeAddress> + Send + Sync>),
}

impl NodeAddressMap {
    /// Build a static map from `(announced, reachable)` pairs.
    ///
    /// Announced addresses are normalized (`::1:7000` and `[::1]:7000` are the
    /// same key); keys that do not parse are kept verbatim.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, NodeAddress)>,
        K: Into<String>,
    {
        Self::Static(
            pairs
                .into_iter()
                .map(|(k, v)| {
                    let k = k.into();
                    let key = NodeAddress::parse(&k).map_or(k, |address| address.to_string());
                    (key, v)
                })
                .collect(),
        )
    }

    /// Build a dynamic map from a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> Option<NodeAddress> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// Resolve an announced address, if it is remapped
    #[must_use]
    pub fn resolve(&self, announced: &str) -> Option<NodeAddress> {
        match self {
            Self::Static(map) => map.get(announced).cloned(),
            Self::Dynamic(f) => f(announced),
        }
    }
}

impl fmt::Debug for NodeAddressMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(map) => f.debug_tuple("Static").field(map).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Options applied to a single logical call
///
/// Immutable; use the `with_*` methods to derive a copy with one field changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Overall deadline for the call, redirections included
    pub timeout: Option<Duration>,
}

impl CommandOptions {
    /// Set the overall deadline of the call
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Remove the deadline
    #[must_use]
    pub const fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }
}

/// Configuration for a cluster client
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Seed nodes used to discover the cluster topology
    pub root_nodes: Vec<NodeAddress>,

    /// Connection settings applied to every node
    pub defaults: ConnectionConfig,

    /// Only discover the topology on connect, create node connections on first use
    pub minimize_connections: bool,

    /// Spread read-only commands over replicas as well as masters
    pub use_replicas: bool,

    /// Maximum number of MOVED/ASK redirections followed by a single call
    pub max_command_redirections: usize,

    /// Remapping of announced node addresses
    pub node_address_map: Option<NodeAddressMap>,

    /// Default per-call options
    pub command_options: CommandOptions,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            root_nodes: Vec::new(),
            defaults: ConnectionConfig::default(),
            minimize_connections: false,
            use_replicas: false,
            max_command_redirections: DEFAULT_MAX_COMMAND_REDIRECTIONS,
            node_address_map: None,
            command_options: CommandOptions::default(),
        }
    }
}

impl ClusterConfig {
    /// Create a configuration from a connection string
    /// (e.g. `redis://host1:7000,host2:7001`)
    pub fn new(connection_string: impl AsRef<str>) -> Self {
        Self {
            root_nodes: parse_endpoints(connection_string.as_ref()),
            ..Default::default()
        }
    }

    /// Create a configuration from explicit seed nodes
    pub fn with_root_nodes(root_nodes: impl IntoIterator<Item = NodeAddress>) -> Self {
        Self {
            root_nodes: root_nodes.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Set the per-node connection settings
    #[must_use]
    pub fn with_defaults(mut self, defaults: ConnectionConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Defer node connections to first use
    #[must_use]
    pub const fn with_minimize_connections(mut self, minimize: bool) -> Self {
        self.minimize_connections = minimize;
        self
    }

    /// Allow read-only commands on replicas
    #[must_use]
    pub const fn with_use_replicas(mut self, use_replicas: bool) -> Self {
        self.use_replicas = use_replicas;
        self
    }

    /// Set the maximum number of redirections
    #[must_use]
    pub const fn with_max_command_redirections(mut self, max: usize) -> Self {
        self.max_command_redirections = max;
        self
    }

    /// Set the node address map
    #[must_use]
    pub fn with_node_address_map(mut self, map: NodeAddressMap) -> Self {
        self.node_address_map = Some(map);
        self
    }

    /// Set the default per-call options
    #[must_use]
    pub const fn with_command_options(mut self, options: CommandOptions) -> Self {
        self.command_options = options;
        self
    }

    /// Check the configuration before connecting
    pub fn validate(&self) -> RedisResult<()> {
        if self.root_nodes.is_empty() {
            return Err(RedisError::Config("No root nodes specified".to_string()));
        }
        Ok(())
    }
}

/// Parse connection endpoints from a connection string
fn parse_endpoints(connection_string: &str) -> Vec<NodeAddress> {
    let conn_str = connection_string.trim();

    let addr_part = conn_str
        .strip_prefix("redis://")
        .or_else(|| conn_str.strip_prefix("rediss://"))
        .unwrap_or(conn_str);

    addr_part
        .split(',')
        .filter_map(|endpoint| {
            let endpoint = endpoint.trim().trim_end_matches('/');
            if endpoint.is_empty() {
                return None;
            }

            if let Ok(address) = NodeAddress::parse(endpoint) {
                return Some(address);
            }

            // Default port if not specified
            Some(NodeAddress::new(endpoint, DEFAULT_PORT))
        })
        .collect()
}
