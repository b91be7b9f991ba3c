//! # etcd-discovery
//!
//! Client-side service discovery backed by etcd.
//!
//! Service instances publish a JSON instance record under an etcd lease and
//! keep it alive for the process lifetime; consumers resolve a logical
//! service name to the set of live host:port addresses and feed updates into
//! a tonic balance channel.
//!
//! This library provides:
//! - **Typed record model** with JSON codecs and a configuration-derived
//!   key namespace.
//! - **Registrar** with lease grant/keep-alive, transparent re-registration
//!   on lease loss, and explicit withdrawal.
//! - **Resolver** that bootstraps from a prefix snapshot, applies watch
//!   events incrementally, and periodically re-syncs to heal drift.
//! - **Balancer feed** adapting full address sets to change events for a
//!   tonic balance channel.
//!
//! ## Design Principles
//!
//! - The store is the sole rendezvous point: registrars and resolvers never
//!   talk to each other.
//! - Background loops are cancellable tasks bound to their owning component.
//! - Event-stream gaps are tolerated, not prevented: the periodic snapshot
//!   sync is the convergence mechanism.

pub mod balancer;
pub mod client;
pub mod config;
pub mod error;
pub mod record;
pub mod registrar;
pub mod resolver;

// Re-export key types for convenient access
pub use balancer::{AddressSink, BalanceSink};
pub use client::EtcdClient;
pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult};
pub use record::{InstanceRecord, ServiceAddress};
pub use registrar::{Registrar, RegistrationState};
pub use resolver::Resolver;
