//! Service resolution: snapshot bootstrap, incremental watch-event
//! application, and periodic reconciliation.
//!
//! The dual-path design trades event-stream complexity for robustness: watch
//! events give low-latency updates, while the periodic snapshot sync
//! guarantees the view cannot diverge from the store for longer than one
//! reconciliation interval, whatever happens to the watch stream.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Event, EventType, WatchResponse, WatchStream, Watcher};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::balancer::AddressSink;
use crate::client::EtcdClient;
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryResult;
use crate::record::{self, InstanceRecord, ServiceAddress};

/// Consumer-side view of one service's live addresses.
///
/// Owned exclusively by the watch loop once the resolver is open; every
/// mutation goes through exactly one of [`AddressSet::replace`],
/// [`AddressSet::apply_put`], or [`AddressSet::apply_delete`].
#[derive(Debug, Default)]
struct AddressSet {
    addresses: BTreeSet<ServiceAddress>,
}

impl AddressSet {
    /// Replace the whole set from snapshot records. Last snapshot wins.
    fn replace(&mut self, records: impl IntoIterator<Item = InstanceRecord>) {
        self.addresses = records.into_iter().map(|r| r.address()).collect();
    }

    /// Apply a put event; returns true if the set changed.
    ///
    /// Presence is keyed by host:port, not instance id: a second instance
    /// publishing an already-known address leaves the set unchanged.
    fn apply_put(&mut self, record: &InstanceRecord) -> bool {
        self.addresses.insert(record.address())
    }

    /// Apply a delete event; returns true if the set changed. Deleting an
    /// address that was never observed is a no-op.
    fn apply_delete(&mut self, record: &InstanceRecord) -> bool {
        self.addresses.remove(&record.address())
    }

    fn to_vec(&self) -> Vec<ServiceAddress> {
        self.addresses.iter().cloned().collect()
    }
}

enum LoopEvent {
    Tick,
    Watch(Result<Option<WatchResponse>, etcd_client::Error>),
}

/// Client-side resolver for one logical service name.
///
/// Maintains an address set converging toward the true set of live
/// instances and pushes every change to the sink as a full list.
#[derive(Debug)]
pub struct Resolver {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Resolver {
    /// Connect to the store, load the initial snapshot, notify the sink,
    /// and start the watch-and-reconcile loop.
    ///
    /// Fails if the initial snapshot cannot complete within the configured
    /// timeouts.
    pub async fn open(
        config: DiscoveryConfig,
        service: &str,
        sink: Arc<dyn AddressSink>,
    ) -> DiscoveryResult<Self> {
        let client = EtcdClient::connect(&config).await?;
        let prefix = config.collection_path(service);

        // the loop task takes exclusive ownership of the set after this
        let mut set = AddressSet::default();
        sync(&client, &prefix, &mut set, sink.as_ref()).await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_loop(
            client,
            prefix,
            set,
            sink,
            config.sync_interval,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Re-resolution hook of the RPC resolver contract: accepted and
    /// ignored, since the periodic sync already keeps the set current.
    pub fn resolve_now(&self) {}

    /// Stop the watch loop and release the subscription. Idempotent.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(%err, "watch loop did not shut down cleanly");
            }
        }
    }
}

/// Rebuild the address set from a full prefix snapshot and push the result
/// to the sink. Any address the event stream missed is corrected here.
async fn sync(
    client: &EtcdClient,
    prefix: &str,
    set: &mut AddressSet,
    sink: &dyn AddressSink,
) -> DiscoveryResult<()> {
    let response = client.get_prefix(prefix).await?;
    let mut records = Vec::with_capacity(response.kvs().len());
    for kv in response.kvs() {
        match record::decode::<InstanceRecord>(kv.value()) {
            Ok(record) => records.push(record),
            Err(err) => warn!(key = ?kv.key_str(), %err, "skipping undecodable instance record"),
        }
    }
    set.replace(records);

    let addresses = set.to_vec();
    debug!(prefix = %prefix, count = addresses.len(), "synchronized address set from snapshot");
    sink.update(&addresses).await;
    Ok(())
}

/// Next message from the watch stream, or pending forever once the
/// subscription is gone (the periodic sync carries on regardless).
async fn next_watch_message(
    subscription: &mut Option<(Watcher, WatchStream)>,
) -> Result<Option<WatchResponse>, etcd_client::Error> {
    match subscription.as_mut() {
        Some((_, stream)) => stream.message().await,
        None => std::future::pending().await,
    }
}

/// Runs for the resolver's lifetime; exits only on cancellation.
async fn watch_loop(
    client: EtcdClient,
    prefix: String,
    mut set: AddressSet,
    sink: Arc<dyn AddressSink>,
    sync_interval: Duration,
    cancel: CancellationToken,
) {
    // delete events only carry the old record when the subscription asks
    // for previous KVs; without them a withdrawal could never be decoded
    let mut subscription = match client.watch_prefix(&prefix).await {
        Ok(subscription) => Some(subscription),
        Err(err) => {
            warn!(prefix = %prefix, %err, "watch subscription failed, relying on periodic sync");
            None
        }
    };

    let mut tick = interval(sync_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // the caller just synced

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => LoopEvent::Tick,
            message = next_watch_message(&mut subscription) => LoopEvent::Watch(message),
        };

        match event {
            // unconditional: runs whether or not the watch is healthy, and
            // bounds the staleness window after a silent watch failure
            LoopEvent::Tick => {
                if let Err(err) = sync(&client, &prefix, &mut set, sink.as_ref()).await {
                    warn!(prefix = %prefix, %err, "periodic sync failed");
                }
            }
            LoopEvent::Watch(Ok(Some(response))) => {
                apply_events(response.events(), &mut set, sink.as_ref()).await;
            }
            LoopEvent::Watch(Ok(None)) => {
                warn!(prefix = %prefix, "watch stream closed, relying on periodic sync");
                subscription = None;
            }
            LoopEvent::Watch(Err(err)) => {
                warn!(prefix = %prefix, %err, "watch stream failed, relying on periodic sync");
                subscription = None;
            }
        }
    }

    if let Some((mut watcher, _stream)) = subscription {
        if let Err(err) = watcher.cancel().await {
            debug!(prefix = %prefix, %err, "watch cancel failed");
        }
    }
}

/// Apply put/delete events in stream order. Undecodable payloads are
/// skipped without touching the set; the sink hears only about changes.
async fn apply_events(events: &[Event], set: &mut AddressSet, sink: &dyn AddressSink) {
    for event in events {
        let changed = match event.event_type() {
            EventType::Put => event
                .kv()
                .and_then(|kv| decode_event_record(kv.value()))
                .map(|record| set.apply_put(&record))
                .unwrap_or(false),
            // the record travels in the previous KV on delete
            EventType::Delete => event
                .prev_kv()
                .and_then(|kv| decode_event_record(kv.value()))
                .map(|record| set.apply_delete(&record))
                .unwrap_or(false),
        };
        if changed {
            sink.update(&set.to_vec()).await;
        }
    }
}

/// Decode a watch payload, logging and discarding malformed values.
fn decode_event_record(value: &[u8]) -> Option<InstanceRecord> {
    match record::decode::<InstanceRecord>(value) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(%err, "skipping undecodable watch event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn record(id: &str, host: &str, port: u16) -> InstanceRecord {
        InstanceRecord {
            id: id.into(),
            name: "billing".into(),
            host: host.into(),
            port,
        }
    }

    fn addr(host: &str, port: u16) -> ServiceAddress {
        ServiceAddress {
            host: host.into(),
            port,
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<Vec<ServiceAddress>>>,
    }

    #[async_trait::async_trait]
    impl AddressSink for RecordingSink {
        async fn update(&self, addresses: &[ServiceAddress]) {
            self.updates.lock().unwrap().push(addresses.to_vec());
        }
    }

    #[test]
    fn test_put_dedups_by_host_port() {
        let mut set = AddressSet::default();
        assert!(set.apply_put(&record("a", "10.0.0.1", 9000)));
        // different instance id, same address: no change
        assert!(!set.apply_put(&record("b", "10.0.0.1", 9000)));
        assert_eq!(set.to_vec(), vec![addr("10.0.0.1", 9000)]);
    }

    #[test]
    fn test_delete_before_any_put_is_a_noop() {
        let mut set = AddressSet::default();
        assert!(!set.apply_delete(&record("a", "10.0.0.1", 9000)));
        assert!(set.to_vec().is_empty());
        // repeated deletes stay a no-op, no negative count
        assert!(!set.apply_delete(&record("a", "10.0.0.1", 9000)));
        assert!(set.to_vec().is_empty());
    }

    #[test]
    fn test_replace_is_wholesale() {
        let mut set = AddressSet::default();
        set.apply_put(&record("a", "10.0.0.1", 9000));
        set.apply_put(&record("b", "10.0.0.2", 9000));

        set.replace(vec![record("c", "10.0.0.3", 9000)]);
        assert_eq!(set.to_vec(), vec![addr("10.0.0.3", 9000)]);

        set.replace(Vec::<InstanceRecord>::new());
        assert!(set.to_vec().is_empty());
    }

    /// Two instances sharing one host:port are one address by contract. The
    /// first withdrawal therefore removes the address even though the other
    /// instance is still live; only the next snapshot sync restores it.
    #[test]
    fn test_shared_address_withdrawal_undercounts_until_sync() {
        let mut set = AddressSet::default();
        set.apply_put(&record("a", "10.0.0.1", 9000));
        set.apply_put(&record("b", "10.0.0.1", 9000));
        assert_eq!(set.to_vec().len(), 1);

        // instance a withdraws; b still publishes the same address
        assert!(set.apply_delete(&record("a", "10.0.0.1", 9000)));
        assert!(set.to_vec().is_empty());

        // reconciliation against the store heals the view
        set.replace(vec![record("b", "10.0.0.1", 9000)]);
        assert_eq!(set.to_vec(), vec![addr("10.0.0.1", 9000)]);
    }

    #[test]
    #[traced_test]
    fn test_malformed_value_is_skipped() {
        assert!(decode_event_record(b"{not json").is_none());
        assert!(logs_contain("skipping undecodable watch event"));

        let decoded = decode_event_record(
            br#"{"id":"a","name":"billing","host":"10.0.0.1","port":9000}"#,
        );
        assert_eq!(decoded.unwrap().address(), addr("10.0.0.1", 9000));
    }

    #[tokio::test]
    async fn test_open_fails_fast_when_store_unreachable() {
        let mut config = DiscoveryConfig::new(vec!["http://127.0.0.1:1".into()], "services");
        config.connect_timeout = Duration::from_secs(1);
        config.op_timeout = Duration::from_secs(1);

        let sink = Arc::new(RecordingSink::default());
        let result = Resolver::open(config, "billing", sink.clone()).await;
        assert!(result.unwrap_err().is_retryable());
        // the sink must never hear about a failed bootstrap
        assert!(sink.updates.lock().unwrap().is_empty());
    }
}
