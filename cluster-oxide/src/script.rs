//! Lua scripts addressed by their SHA1 digest
//!
//! A [`Script`] is sent as `EVALSHA` first; when the node answers `NOSCRIPT`
//! the full source is sent with `EVAL`, which also loads it for next time.
//! Routing uses the first key the script touches.
//!
//! # Examples
//!
//! ```no_run
//! use bytes::Bytes;
//! use cluster_oxide::{ClusterClient, ClusterConfig, Script};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ClusterClient::connect(ClusterConfig::new("redis://127.0.0.1:7000")).await?;
//!
//! let script = Script::new("return redis.call('INCRBY', KEYS[1], ARGV[1])");
//! let reply = client
//!     .execute_script(&script, &[Bytes::from("counter")], &[Bytes::from("5")], false)
//!     .await?;
//! println!("counter = {:?}", reply);
//! # Ok(())
//! # }
//! ```

use crate::command::Cmd;
use bytes::Bytes;
use sha1::{Digest, Sha1};

/// A Lua script that can be executed on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    source: String,
    sha: String,
}

impl Script {
    /// Create a script from Lua source; the digest is computed eagerly
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let sha = calculate_sha1(&source);
        Self { source, sha }
    }

    /// The Lua source
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hex SHA1 digest used by `EVALSHA`
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// Routing key: the first key, if any
    pub fn first_key(keys: &[Bytes]) -> Option<Bytes> {
        keys.first().cloned()
    }

    /// `EVALSHA sha numkeys keys... args...`
    pub fn evalsha_cmd(&self, keys: &[Bytes], args: &[Bytes]) -> Cmd {
        Self::build("EVALSHA", Bytes::from(self.sha.clone()), keys, args)
    }

    /// `EVAL source numkeys keys... args...`
    pub fn eval_cmd(&self, keys: &[Bytes], args: &[Bytes]) -> Cmd {
        Self::build("EVAL", Bytes::from(self.source.clone()), keys, args)
    }

    fn build(name: &str, body: Bytes, keys: &[Bytes], args: &[Bytes]) -> Cmd {
        let mut cmd = Cmd::new(name)
            .arg(body)
            .arg(Bytes::from(keys.len().to_string()));
        for item in keys.iter().chain(args) {
            cmd = cmd.arg(item.clone());
        }
        cmd
    }
}

fn calculate_sha1(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}
