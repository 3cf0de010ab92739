//! Commands and their routing metadata
//!
//! A [`Cmd`] is a command name plus already-serialized arguments. Routing only
//! needs three facts about a command: where its first key is, whether it is
//! read-only and whether it may be sent to any master when it has no key.
//! Those facts live in a [`CommandSpec`]; the [`CommandTable`] maps command
//! names to specs and is built once when a client is created.

use bytes::Bytes;
use cluster_oxide_core::error::{RedisError, RedisResult};
use std::collections::HashMap;
use std::fmt;

/// A command ready to be written to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    name: String,
    args: Vec<Bytes>,
}

impl Cmd {
    /// Create a command without arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Create a command with arguments
    pub fn with_args<I, A>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Command name as given
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments, excluding the command name
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// Where a command's routing key is found
#[derive(Clone, Copy)]
pub enum KeyPosition {
    /// The command carries no key
    None,
    /// Fixed index into the arguments (the command name is not counted)
    Index(usize),
    /// Computed from the arguments
    Dynamic(fn(&[Bytes]) -> Option<Bytes>),
}

impl fmt::Debug for KeyPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Index(i) => f.debug_tuple("Index").field(i).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Routing metadata of a command
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Upper-case command name
    pub name: &'static str,
    /// First key position
    pub first_key: KeyPosition,
    /// The command never writes
    pub read_only: bool,
    /// Without a key, the command may run on any master
    pub forward: bool,
}

impl CommandSpec {
    /// Keyed command with the key at `index`
    #[must_use]
    pub const fn keyed(name: &'static str, index: usize, read_only: bool) -> Self {
        Self {
            name,
            first_key: KeyPosition::Index(index),
            read_only,
            forward: false,
        }
    }

    /// Keyless command routable to any master
    #[must_use]
    pub const fn forward(name: &'static str, read_only: bool) -> Self {
        Self {
            name,
            first_key: KeyPosition::None,
            read_only,
            forward: true,
        }
    }

    /// Command whose key position depends on its arguments
    #[must_use]
    pub const fn dynamic(
        name: &'static str,
        locate: fn(&[Bytes]) -> Option<Bytes>,
        read_only: bool,
        forward: bool,
    ) -> Self {
        Self {
            name,
            first_key: KeyPosition::Dynamic(locate),
            read_only,
            forward,
        }
    }

    /// Extract the routing key from the arguments.
    ///
    /// A command without a key is only valid when it is a forward command.
    pub fn extract_first_key(&self, args: &[Bytes]) -> RedisResult<Option<Bytes>> {
        let key = match self.first_key {
            KeyPosition::None => None,
            KeyPosition::Index(i) => args.get(i).cloned(),
            KeyPosition::Dynamic(locate) => locate(args),
        };

        if key.is_none() && !self.forward {
            return Err(RedisError::Cluster(format!(
                "Cannot determine routing key for {}",
                self.name
            )));
        }

        Ok(key)
    }
}

/// `EVAL script numkeys key ...`, `FCALL fn numkeys key ...`
fn key_after_numkeys(args: &[Bytes]) -> Option<Bytes> {
    let numkeys = std::str::from_utf8(args.get(1)?).ok()?.parse::<usize>().ok()?;
    if numkeys == 0 {
        return None;
    }
    args.get(2).cloned()
}

/// `XREAD [COUNT n] [BLOCK ms] STREAMS key ...`
fn key_after_streams(args: &[Bytes]) -> Option<Bytes> {
    let pos = args
        .iter()
        .position(|a| a.eq_ignore_ascii_case(b"STREAMS"))?;
    args.get(pos + 1).cloned()
}

/// Registry of command routing metadata
#[derive(Debug, Clone)]
pub struct CommandTable {
    specs: HashMap<String, CommandSpec>,
}

impl CommandTable {
    /// An empty table
    pub fn empty() -> Self {
        Self {
            specs: HashMap::new(),
        }
    }

    /// Table pre-filled with the commonly used commands
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for spec in BUILTIN_COMMANDS {
            table.register(*spec);
        }
        table
    }

    /// Add or replace a spec
    pub fn register(&mut self, spec: CommandSpec) -> &mut Self {
        self.specs.insert(spec.name.to_ascii_uppercase(), spec);
        self
    }

    /// Look up a spec by (case-insensitive) name
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.specs.get(&name.to_ascii_uppercase())
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::builtin()
    }
}

const BUILTIN_COMMANDS: &[CommandSpec] = &[
    // Strings and keyspace
    CommandSpec::keyed("GET", 0, true),
    CommandSpec::keyed("MGET", 0, true),
    CommandSpec::keyed("STRLEN", 0, true),
    CommandSpec::keyed("GETRANGE", 0, true),
    CommandSpec::keyed("EXISTS", 0, true),
    CommandSpec::keyed("TTL", 0, true),
    CommandSpec::keyed("PTTL", 0, true),
    CommandSpec::keyed("TYPE", 0, true),
    CommandSpec::keyed("SET", 0, false),
    CommandSpec::keyed("SETNX", 0, false),
    CommandSpec::keyed("SETEX", 0, false),
    CommandSpec::keyed("GETSET", 0, false),
    CommandSpec::keyed("GETDEL", 0, false),
    CommandSpec::keyed("MSET", 0, false),
    CommandSpec::keyed("APPEND", 0, false),
    CommandSpec::keyed("DEL", 0, false),
    CommandSpec::keyed("UNLINK", 0, false),
    CommandSpec::keyed("EXPIRE", 0, false),
    CommandSpec::keyed("PEXPIRE", 0, false),
    CommandSpec::keyed("PERSIST", 0, false),
    CommandSpec::keyed("INCR", 0, false),
    CommandSpec::keyed("INCRBY", 0, false),
    CommandSpec::keyed("DECR", 0, false),
    CommandSpec::keyed("DECRBY", 0, false),
    CommandSpec::keyed("WATCH", 0, true),
    // Hashes
    CommandSpec::keyed("HGET", 0, true),
    CommandSpec::keyed("HMGET", 0, true),
    CommandSpec::keyed("HGETALL", 0, true),
    CommandSpec::keyed("HEXISTS", 0, true),
    CommandSpec::keyed("HLEN", 0, true),
    CommandSpec::keyed("HKEYS", 0, true),
    CommandSpec::keyed("HVALS", 0, true),
    CommandSpec::keyed("HSET", 0, false),
    CommandSpec::keyed("HDEL", 0, false),
    CommandSpec::keyed("HINCRBY", 0, false),
    // Lists
    CommandSpec::keyed("LRANGE", 0, true),
    CommandSpec::keyed("LLEN", 0, true),
    CommandSpec::keyed("LINDEX", 0, true),
    CommandSpec::keyed("LPUSH", 0, false),
    CommandSpec::keyed("RPUSH", 0, false),
    CommandSpec::keyed("LPOP", 0, false),
    CommandSpec::keyed("RPOP", 0, false),
    CommandSpec::keyed("LSET", 0, false),
    // Sets
    CommandSpec::keyed("SMEMBERS", 0, true),
    CommandSpec::keyed("SISMEMBER", 0, true),
    CommandSpec::keyed("SCARD", 0, true),
    CommandSpec::keyed("SADD", 0, false),
    CommandSpec::keyed("SREM", 0, false),
    CommandSpec::keyed("SPOP", 0, false),
    // Sorted sets
    CommandSpec::keyed("ZRANGE", 0, true),
    CommandSpec::keyed("ZSCORE", 0, true),
    CommandSpec::keyed("ZCARD", 0, true),
    CommandSpec::keyed("ZRANK", 0, true),
    CommandSpec::keyed("ZADD", 0, false),
    CommandSpec::keyed("ZREM", 0, false),
    CommandSpec::keyed("ZINCRBY", 0, false),
    // Streams
    CommandSpec::keyed("XADD", 0, false),
    CommandSpec::keyed("XLEN", 0, true),
    CommandSpec::keyed("XRANGE", 0, true),
    CommandSpec::dynamic("XREAD", key_after_streams, true, false),
    // Scripting and functions
    CommandSpec::dynamic("EVAL", key_after_numkeys, false, true),
    CommandSpec::dynamic("EVALSHA", key_after_numkeys, false, true),
    CommandSpec::dynamic("EVAL_RO", key_after_numkeys, true, true),
    CommandSpec::dynamic("EVALSHA_RO", key_after_numkeys, true, true),
    CommandSpec::dynamic("FCALL", key_after_numkeys, false, true),
    CommandSpec::dynamic("FCALL_RO", key_after_numkeys, true, true),
    // Pub/Sub
    CommandSpec::forward("PUBLISH", false),
    CommandSpec::keyed("SPUBLISH", 0, false),
    // Server
    CommandSpec::forward("PING", true),
    CommandSpec::forward("ECHO", true),
    CommandSpec::forward("TIME", true),
    CommandSpec::forward("INFO", true),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&'static str]) -> Vec<Bytes> {
        items.iter().copied().map(Bytes::from).collect()
    }

    #[test]
    fn test_fixed_index_key() {
        let table = CommandTable::builtin();
        let spec = table.get("get").unwrap();
        assert!(spec.read_only);
        let key = spec.extract_first_key(&args(&["user:1"])).unwrap();
        assert_eq!(key.as_deref(), Some(&b"user:1"[..]));
    }

    #[test]
    fn test_missing_key_on_keyed_command_fails() {
        let table = CommandTable::builtin();
        let spec = table.get("SET").unwrap();
        assert!(spec.extract_first_key(&[]).is_err());
    }

    #[test]
    fn test_forward_command_has_no_key() {
        let table = CommandTable::builtin();
        let spec = table.get("PUBLISH").unwrap();
        assert_eq!(spec.extract_first_key(&args(&["news", "hello"])).unwrap(), None);
    }

    #[test]
    fn test_dynamic_keys() {
        let table = CommandTable::builtin();

        let eval = table.get("EVAL").unwrap();
        let key = eval
            .extract_first_key(&args(&["return 1", "2", "{a}x", "{a}y", "argv"]))
            .unwrap();
        assert_eq!(key.as_deref(), Some(&b"{a}x"[..]));
        assert_eq!(eval.extract_first_key(&args(&["return 1", "0"])).unwrap(), None);

        let xread = table.get("XREAD").unwrap();
        let key = xread
            .extract_first_key(&args(&["COUNT", "2", "streams", "s1", "0"]))
            .unwrap();
        assert_eq!(key.as_deref(), Some(&b"s1"[..]));
    }

    #[test]
    fn test_register_overrides() {
        let mut table = CommandTable::empty();
        assert!(table.is_empty());
        table.register(CommandSpec::keyed("my.cmd", 1, true));
        let spec = table.get("MY.CMD").unwrap();
        let key = spec.extract_first_key(&args(&["opt", "k"])).unwrap();
        assert_eq!(key.as_deref(), Some(&b"k"[..]));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cmd_display() {
        let cmd = Cmd::new("SET").arg("k").arg("v");
        assert_eq!(cmd.to_string(), "SET k v");
        assert_eq!(cmd.args().len(), 2);
    }
}
