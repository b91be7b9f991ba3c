//! Instance registration: publish one liveness record under a lease and keep
//! it alive for the process lifetime.
//!
//! The renewal loop treats lease loss as a normal transition, not an error:
//! any keep-alive failure triggers a fresh publish cycle, retried on the
//! next tick until it succeeds or the registrar is stopped.

use std::sync::Arc;
use std::time::Duration;

use etcd_client::{LeaseKeepAliveResponse, LeaseKeepAliveStream, LeaseKeeper};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::EtcdClient;
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryResult;
use crate::record::{self, InstanceRecord};

/// Registration lifecycle states observable from outside the renewal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// A publish cycle is in progress or pending retry.
    Publishing,
    /// The record is stored under a live lease.
    Active,
    /// The registrar was stopped and the record withdrawn.
    Withdrawn,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Publishing => write!(f, "publishing"),
            RegistrationState::Active => write!(f, "active"),
            RegistrationState::Withdrawn => write!(f, "withdrawn"),
        }
    }
}

/// A live lease session: the keeper sends renewals, the stream confirms
/// them. Replaced wholesale on every republish.
struct LeaseSession {
    lease_id: i64,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

enum RenewalSignal {
    Tick,
    Confirmation(Result<Option<LeaseKeepAliveResponse>, etcd_client::Error>),
}

/// Keeps exactly one instance record alive in the store, self-healing after
/// any lease disruption.
///
/// Dropping a registrar without calling [`Registrar::stop`] leaves the
/// record to expire with its lease.
#[derive(Debug)]
pub struct Registrar {
    client: EtcdClient,
    key: String,
    state: Arc<RwLock<RegistrationState>>,
    cancel: CancellationToken,
    handle: JoinHandle<Option<i64>>,
}

impl Registrar {
    /// Connect to the store, run the initial publish cycle synchronously,
    /// then start the renewal loop.
    ///
    /// Fails if the store is unreachable within the configured timeouts; the
    /// caller decides whether to abort startup.
    pub async fn start(config: DiscoveryConfig, record: InstanceRecord) -> DiscoveryResult<Self> {
        let client = EtcdClient::connect(&config).await?;
        let key = config.instance_key(&record);
        let payload = record::encode(&record)?;

        let session = publish(&client, &key, &payload, config.lease_ttl).await?;
        info!(key = %key, lease_id = session.lease_id, "instance registered");

        let state = Arc::new(RwLock::new(RegistrationState::Active));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(renewal_loop(
            client.clone(),
            key.clone(),
            payload,
            config.lease_ttl,
            session,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Ok(Self {
            client,
            key,
            state,
            cancel,
            handle,
        })
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RegistrationState {
        *self.state.read().await
    }

    /// Withdraw the record: stop the renewal loop, delete the instance key,
    /// and revoke the lease.
    ///
    /// Deletion and revocation are best-effort; failures are logged rather
    /// than propagated, since the lease TTL reclaims the key regardless.
    pub async fn stop(self) {
        self.cancel.cancel();
        let lease_id = match self.handle.await {
            Ok(lease_id) => lease_id,
            Err(err) => {
                warn!(%err, "renewal loop did not shut down cleanly");
                None
            }
        };

        if let Err(err) = self.client.delete(&self.key).await {
            warn!(key = %self.key, %err, "failed to delete instance key");
        }
        if let Some(lease_id) = lease_id {
            if let Err(err) = self.client.lease_revoke(lease_id).await {
                warn!(lease_id, %err, "failed to revoke lease");
            }
        }

        *self.state.write().await = RegistrationState::Withdrawn;
        info!(key = %self.key, "instance withdrawn");
    }
}

/// One publish cycle: lease first, renewal stream second, record write last,
/// scoped to the lease. A key is never visible without a backing lease.
async fn publish(
    client: &EtcdClient,
    key: &str,
    payload: &[u8],
    ttl: i64,
) -> DiscoveryResult<LeaseSession> {
    let lease_id = client.lease_grant(ttl).await?;
    let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
    client.put_with_lease(key, payload.to_vec(), lease_id).await?;
    Ok(LeaseSession {
        lease_id,
        keeper,
        stream,
    })
}

/// Renewal cadence derived from the lease TTL. The keeper only renews when
/// driven, so the tick must land well inside the TTL window.
fn renewal_period(ttl: i64) -> Duration {
    Duration::from_secs((ttl / 3).max(1) as u64)
}

/// Next confirmation from the renewal stream, or pending forever while no
/// session is live (the tick arm re-establishes one).
async fn next_confirmation(
    session: &mut Option<LeaseSession>,
) -> Result<Option<LeaseKeepAliveResponse>, etcd_client::Error> {
    match session.as_mut() {
        Some(live) => live.stream.message().await,
        None => std::future::pending().await,
    }
}

/// Runs for the registrar's lifetime; exits only on cancellation. Returns
/// the current lease id, if any, for the caller to revoke.
async fn renewal_loop(
    client: EtcdClient,
    key: String,
    payload: Vec<u8>,
    ttl: i64,
    session: LeaseSession,
    state: Arc<RwLock<RegistrationState>>,
    cancel: CancellationToken,
) -> Option<i64> {
    let mut session = Some(session);
    let mut tick = interval(renewal_period(ttl));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // first tick completes immediately

    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => RenewalSignal::Tick,
            confirmation = next_confirmation(&mut session) => {
                RenewalSignal::Confirmation(confirmation)
            }
        };

        match signal {
            RenewalSignal::Tick => {
                let renewed = match session.as_mut() {
                    Some(live) => match live.keeper.keep_alive().await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(key = %key, %err, "keep-alive send failed");
                            false
                        }
                    },
                    None => false,
                };
                if !renewed {
                    session = republish(&client, &key, &payload, ttl, &state).await;
                }
            }
            RenewalSignal::Confirmation(Ok(Some(response))) => {
                debug!(key = %key, ttl = response.ttl(), "lease renewal confirmed");
            }
            RenewalSignal::Confirmation(Ok(None)) => {
                warn!(key = %key, "keep-alive stream closed, republishing");
                session = republish(&client, &key, &payload, ttl, &state).await;
            }
            RenewalSignal::Confirmation(Err(err)) => {
                warn!(key = %key, %err, "keep-alive stream failed, republishing");
                session = republish(&client, &key, &payload, ttl, &state).await;
            }
        }
    }

    session.map(|live| live.lease_id)
}

/// Run a fresh publish cycle after lease loss. Failures are logged and
/// absorbed; the next tick retries.
async fn republish(
    client: &EtcdClient,
    key: &str,
    payload: &[u8],
    ttl: i64,
    state: &Arc<RwLock<RegistrationState>>,
) -> Option<LeaseSession> {
    *state.write().await = RegistrationState::Publishing;
    match publish(client, key, payload, ttl).await {
        Ok(session) => {
            info!(key = %key, lease_id = session.lease_id, "instance re-registered");
            *state.write().await = RegistrationState::Active;
            Some(session)
        }
        Err(err) => {
            warn!(key = %key, %err, "publish cycle failed, retrying on next tick");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::error::DiscoveryError;

    #[test]
    fn test_renewal_period_inside_ttl() {
        assert_eq!(renewal_period(10), Duration::from_secs(3));
        assert_eq!(renewal_period(30), Duration::from_secs(10));
        // never zero, even for the shortest grantable lease
        assert_eq!(renewal_period(1), Duration::from_secs(1));
        assert_eq!(renewal_period(2), Duration::from_secs(1));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RegistrationState::Publishing.to_string(), "publishing");
        assert_eq!(RegistrationState::Active.to_string(), "active");
        assert_eq!(RegistrationState::Withdrawn.to_string(), "withdrawn");
    }

    #[tokio::test]
    async fn test_start_fails_fast_when_store_unreachable() {
        let mut config = DiscoveryConfig::new(vec!["http://127.0.0.1:1".into()], "services");
        config.connect_timeout = Duration::from_secs(1);
        config.op_timeout = Duration::from_secs(1);

        let record = InstanceRecord::new("billing", "10.0.0.1", 9000);
        let result = Registrar::start(config, record).await;
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = DiscoveryConfig::new(vec![], "services");
        let record = InstanceRecord::new("billing", "10.0.0.1", 9000);
        let result = Registrar::start(config, record).await;
        assert!(matches!(
            result.unwrap_err(),
            DiscoveryError::Config(_)
        ));
    }
}
