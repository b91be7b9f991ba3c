//! etcd connection wrapper with bounded operation timeouts.
//!
//! Wraps `etcd-client` so the registrar and resolver state machines stay
//! free of transport plumbing. Unary operations are wrapped in short
//! timeouts so a stalled store connection cannot block a renewal or watch
//! loop; the long-lived keep-alive and watch streams are intentionally
//! unbounded and supervised by their owners' periodic timers.

use std::future::Future;
use std::time::Duration;

use etcd_client::{
    Client, ConnectOptions, GetOptions, GetResponse, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, WatchOptions, WatchStream, Watcher,
};
use tokio::time::timeout;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};

/// Handle to the coordination store, owned exclusively by one registrar or
/// resolver. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct EtcdClient {
    inner: Client,
    op_timeout: Duration,
}

impl EtcdClient {
    /// Connect to the configured endpoints with a bounded dial timeout.
    pub async fn connect(config: &DiscoveryConfig) -> DiscoveryResult<Self> {
        config.validate()?;

        let options = ConnectOptions::new().with_connect_timeout(config.connect_timeout);
        let inner = timeout(
            config.connect_timeout,
            Client::connect(&config.endpoints, Some(options)),
        )
        .await
        .map_err(|_| {
            DiscoveryError::Timeout(format!(
                "etcd connect timed out after {:?}",
                config.connect_timeout
            ))
        })?
        .map_err(|e| DiscoveryError::Transport(format!("etcd connect failed: {e}")))?;

        debug!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self {
            inner,
            op_timeout: config.op_timeout,
        })
    }

    /// Run a store operation under the configured operation timeout.
    async fn bounded<T>(
        &self,
        what: &str,
        op: impl Future<Output = Result<T, etcd_client::Error>>,
    ) -> DiscoveryResult<T> {
        timeout(self.op_timeout, op)
            .await
            .map_err(|_| {
                DiscoveryError::Timeout(format!("{what} timed out after {:?}", self.op_timeout))
            })?
            .map_err(|e| DiscoveryError::Transport(format!("{what} failed: {e}")))
    }

    /// Request a lease with the given time-to-live, returning its id.
    pub async fn lease_grant(&self, ttl: i64) -> DiscoveryResult<i64> {
        let mut client = self.inner.clone();
        let response = self
            .bounded("lease grant", client.lease_grant(ttl, None))
            .await?;
        Ok(response.id())
    }

    /// Open the renewal stream for a lease. The keeper sends renewal
    /// requests; the stream delivers liveness confirmations and closes when
    /// the lease is lost.
    pub async fn lease_keep_alive(
        &self,
        lease_id: i64,
    ) -> DiscoveryResult<(LeaseKeeper, LeaseKeepAliveStream)> {
        let mut client = self.inner.clone();
        self.bounded("lease keep-alive open", client.lease_keep_alive(lease_id))
            .await
    }

    /// Write a key scoped to a lease, overwriting any stale value.
    pub async fn put_with_lease(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_id: i64,
    ) -> DiscoveryResult<()> {
        let mut client = self.inner.clone();
        self.bounded(
            "key write",
            client.put(key, value, Some(PutOptions::new().with_lease(lease_id))),
        )
        .await?;
        Ok(())
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> DiscoveryResult<()> {
        let mut client = self.inner.clone();
        self.bounded("key delete", client.delete(key, None)).await?;
        Ok(())
    }

    /// Explicitly revoke a lease, releasing all keys attached to it.
    pub async fn lease_revoke(&self, lease_id: i64) -> DiscoveryResult<()> {
        let mut client = self.inner.clone();
        self.bounded("lease revoke", client.lease_revoke(lease_id))
            .await?;
        Ok(())
    }

    /// One consistent snapshot read of all keys under a prefix.
    pub async fn get_prefix(&self, prefix: &str) -> DiscoveryResult<GetResponse> {
        let mut client = self.inner.clone();
        self.bounded(
            "snapshot read",
            client.get(prefix, Some(GetOptions::new().with_prefix())),
        )
        .await
    }

    /// Subscribe to change events under a prefix.
    ///
    /// Subscribes with previous-KV delivery so delete events still carry a
    /// decodable record. Opening the subscription is bounded; the stream
    /// itself lives for the subscriber's lifetime.
    pub async fn watch_prefix(&self, prefix: &str) -> DiscoveryResult<(Watcher, WatchStream)> {
        let mut client = self.inner.clone();
        self.bounded(
            "watch subscribe",
            client.watch(
                prefix,
                Some(WatchOptions::new().with_prefix().with_prev_key()),
            ),
        )
        .await
    }
}

impl std::fmt::Debug for EtcdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdClient")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}
