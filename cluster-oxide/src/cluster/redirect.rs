//! Redirection handling: bounded retries on `MOVED` and `ASK`

use super::router::RoutedNode;
use super::ClusterInner;
use crate::node::NodeConnection;
use bytes::Bytes;
use cluster_oxide_core::{
    config::CommandOptions,
    error::{RedisError, RedisResult},
    types::NodeAddress,
};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Run `fut` under the call's deadline, if one is set
pub(crate) async fn with_deadline<T, F>(options: CommandOptions, fut: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match options.timeout {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| RedisError::Aborted(deadline))?,
        None => fut.await,
    }
}

impl ClusterInner {
    /// Run `work` against the node owning `key`, following redirections.
    ///
    /// Up to `max_command_redirections` redirections are followed; the next
    /// one is returned as the call's error. `MOVED` refreshes the topology
    /// starting at the node that answered and re-routes the key. `ASK` retries
    /// on the named node without a refresh; `work` is then called with
    /// `asking` set and must send `ASKING` together with its command. A
    /// connection closed by a concurrent refresh is treated like `MOVED`.
    /// Any other error is returned as is.
    pub(crate) async fn execute<T, W, Fut>(
        self: &Arc<Self>,
        key: Option<Bytes>,
        read_only: bool,
        options: CommandOptions,
        work: W,
    ) -> RedisResult<T>
    where
        W: Fn(Arc<dyn NodeConnection>, bool) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        with_deadline(options, self.redirect_loop(key.as_deref(), read_only, work)).await
    }

    async fn redirect_loop<T, W, Fut>(
        self: &Arc<Self>,
        key: Option<&[u8]>,
        read_only: bool,
        work: W,
    ) -> RedisResult<T>
    where
        W: Fn(Arc<dyn NodeConnection>, bool) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let max_redirections = self.config.max_command_redirections;
        let mut epoch = self.epoch();
        let mut target = self.get_client(key, read_only).await?;
        let mut asking = false;
        let mut redirections = 0usize;

        loop {
            let error = match work(Arc::clone(&target.connection), asking).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retryable =
                error.is_redirect() || matches!(error, RedisError::ConnectionClosed(_));
            if !retryable {
                return Err(error);
            }
            redirections += 1;
            if redirections > max_redirections {
                debug!(
                    "Giving up after {} redirections: {}",
                    max_redirections, error
                );
                return Err(error);
            }

            match &error {
                RedisError::Ask { address, .. } => {
                    debug!(
                        "ASK redirect to {} (attempt {}/{})",
                        address, redirections, max_redirections
                    );
                    target = self.ask_target(address, &target.address, &mut epoch).await?;
                    asking = true;
                }
                _ => {
                    debug!(
                        "{} from {}, refreshing topology (attempt {}/{})",
                        error, target.address, redirections, max_redirections
                    );
                    let start_with = error.is_redirect().then_some(&target.address);
                    self.rediscover(start_with, epoch).await?;
                    epoch = self.epoch();
                    target = self.get_client(key, read_only).await?;
                    asking = false;
                }
            }
        }
    }

    /// Resolve the node named by an `ASK` reply.
    ///
    /// The current table is consulted first; an unknown address triggers one
    /// refresh before giving up with [`RedisError::NodeNotFound`].
    async fn ask_target(
        self: &Arc<Self>,
        announced: &str,
        answered_by: &NodeAddress,
        epoch: &mut u64,
    ) -> RedisResult<RoutedNode> {
        let address = self
            .registry
            .address_for_alias(announced)
            .map_err(|_| RedisError::NodeNotFound(announced.to_string()))?;

        if !self.table.load().contains_address(&address) {
            debug!("ASK target {} unknown, refreshing topology", address);
            self.rediscover(Some(answered_by), *epoch).await?;
            *epoch = self.epoch();
            if !self.table.load().contains_address(&address) {
                return Err(RedisError::NodeNotFound(announced.to_string()));
            }
        }

        self.routed(address).await
    }
}
