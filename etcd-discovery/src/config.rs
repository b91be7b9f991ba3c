//! Discovery configuration and key namespace layout.
//!
//! The namespace is passed explicitly to every component at construction and
//! doubles as the RPC target scheme. There is no process-wide naming state.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::record::InstanceRecord;

/// Default lease time-to-live in seconds.
const DEFAULT_LEASE_TTL: i64 = 10;

/// Default timeout for establishing the etcd connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single store operation.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(3);

/// Default interval between full reconciliation syncs.
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

fn default_lease_ttl() -> i64 {
    DEFAULT_LEASE_TTL
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_op_timeout() -> Duration {
    DEFAULT_OP_TIMEOUT
}

fn default_sync_interval() -> Duration {
    DEFAULT_SYNC_INTERVAL
}

/// Configuration shared by registrars and resolvers.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// etcd endpoint URLs.
    pub endpoints: Vec<String>,
    /// Root path segment under which all services publish. Also the scheme
    /// identifier in `<namespace>:///<service>` RPC targets.
    pub namespace: String,
    /// Lease time-to-live in seconds. The renewal tick is derived from it.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: i64,
    /// Timeout for establishing the etcd connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Timeout for a single store operation (grant, put, delete, snapshot).
    #[serde(default = "default_op_timeout")]
    pub op_timeout: Duration,
    /// Interval between full reconciliation syncs. Bounds the staleness
    /// window after a silent watch failure.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: Duration,
}

impl DiscoveryConfig {
    /// Create a configuration with default timeouts and TTL.
    pub fn new(endpoints: Vec<String>, namespace: impl Into<String>) -> Self {
        Self {
            endpoints,
            namespace: namespace.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            op_timeout: DEFAULT_OP_TIMEOUT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Validate field requirements before connecting.
    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.endpoints.is_empty() {
            return Err(DiscoveryError::Config(
                "at least one etcd endpoint is required".into(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(DiscoveryError::Config("namespace must not be empty".into()));
        }
        if self.namespace.contains('/') {
            return Err(DiscoveryError::Config(format!(
                "namespace '{}' must not contain '/'",
                self.namespace
            )));
        }
        if self.lease_ttl < 1 {
            return Err(DiscoveryError::Config(format!(
                "lease_ttl must be at least 1 second, got {}",
                self.lease_ttl
            )));
        }
        if self.op_timeout.is_zero() || self.sync_interval.is_zero() {
            return Err(DiscoveryError::Config(
                "op_timeout and sync_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Prefix under which all instances of `service` publish their keys.
    pub fn collection_path(&self, service: &str) -> String {
        format!("/{}/{}", self.namespace, service)
    }

    /// Key under which one instance record is stored.
    pub fn instance_key(&self, record: &InstanceRecord) -> String {
        format!("{}/{}", self.collection_path(&record.name), record.id)
    }

    /// RPC client target selecting this deployment's resolver.
    pub fn target(&self, service: &str) -> String {
        format!("{}:///{}", self.namespace, service)
    }
}
