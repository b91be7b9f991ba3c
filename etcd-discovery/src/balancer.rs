//! Balancer feed: adapts full address-set notifications to the incremental
//! change events a tonic balance channel consumes.
//!
//! The resolver always notifies with the complete address list; the tonic
//! side wants inserts and removals. [`BalanceSink`] bridges the two by
//! diffing consecutive lists.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tonic::transport::Endpoint;
use tower::discover::Change;
use tracing::{debug, warn};

use crate::record::ServiceAddress;

/// Default connect timeout applied to endpoints handed to the channel.
const DEFAULT_ENDPOINT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives the resolver's full address list whenever it changes.
///
/// Implementations must tolerate redundant updates: the resolver re-sends
/// the complete list after every snapshot sync.
#[async_trait]
pub trait AddressSink: Send + Sync + 'static {
    async fn update(&self, addresses: &[ServiceAddress]);
}

/// Feeds a tonic balance channel from full address lists.
///
/// Keeps the previously delivered set and emits only the difference as
/// insert/remove changes, keyed by the host:port string. Create the channel
/// with `Channel::balance_channel` and hand its sender here.
pub struct BalanceSink {
    changes: Sender<Change<String, Endpoint>>,
    connect_timeout: Duration,
    delivered: Mutex<BTreeSet<ServiceAddress>>,
}

impl BalanceSink {
    pub fn new(changes: Sender<Change<String, Endpoint>>) -> Self {
        Self {
            changes,
            connect_timeout: DEFAULT_ENDPOINT_CONNECT_TIMEOUT,
            delivered: Mutex::new(BTreeSet::new()),
        }
    }

    /// Override the connect timeout applied to each endpoint.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn endpoint(&self, address: &ServiceAddress) -> Option<Endpoint> {
        match Endpoint::from_shared(format!("http://{address}")) {
            Ok(endpoint) => Some(endpoint.connect_timeout(self.connect_timeout)),
            Err(err) => {
                warn!(%address, %err, "skipping address with invalid endpoint uri");
                None
            }
        }
    }
}

/// Split a new full set against the previously delivered one into added and
/// removed addresses.
fn diff(
    previous: &BTreeSet<ServiceAddress>,
    current: &BTreeSet<ServiceAddress>,
) -> (Vec<ServiceAddress>, Vec<ServiceAddress>) {
    let added = current.difference(previous).cloned().collect();
    let removed = previous.difference(current).cloned().collect();
    (added, removed)
}

#[async_trait]
impl AddressSink for BalanceSink {
    async fn update(&self, addresses: &[ServiceAddress]) {
        let current: BTreeSet<ServiceAddress> = addresses.iter().cloned().collect();
        let mut delivered = self.delivered.lock().await;
        let (added, removed) = diff(&delivered, &current);

        for address in removed {
            if self
                .changes
                .send(Change::Remove(address.to_string()))
                .await
                .is_err()
            {
                warn!("balance channel closed, dropping address updates");
                return;
            }
        }
        for address in added {
            let Some(endpoint) = self.endpoint(&address) else {
                continue;
            };
            if self
                .changes
                .send(Change::Insert(address.to_string(), endpoint))
                .await
                .is_err()
            {
                warn!("balance channel closed, dropping address updates");
                return;
            }
        }

        debug!(count = current.len(), "balance channel updated");
        *delivered = current;
    }
}
