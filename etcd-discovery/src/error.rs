//! Error types for discovery operations.
//!
//! Typed variants let callers distinguish transport failures, timeouts, and
//! codec issues without leaking etcd internals.

use thiserror::Error;

/// Top-level error type for the etcd-discovery crate.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// etcd connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Codec error during record serialization or deserialization.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. empty endpoint list).
    #[error("configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport or timeout).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Transport(_) | DiscoveryError::Timeout(_)
        )
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DiscoveryError::Timeout(_))
    }
}

/// Shorthand result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
