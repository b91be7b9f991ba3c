//! Instance record model and JSON codecs.
//!
//! One record describes one live service instance. Records are stored as
//! self-describing JSON blobs so that any consumer can decode them without
//! out-of-band schema knowledge; field order is not significant.

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, DiscoveryResult};

/// Liveness record published by one service instance.
///
/// The identifier is generated once per process instance and is immutable
/// for the record's lifetime; an instance publishes under exactly one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique instance identifier.
    pub id: String,
    /// Logical service name.
    pub name: String,
    /// Network host.
    pub host: String,
    /// Network port.
    pub port: u16,
}

impl InstanceRecord {
    /// Create a record with a fresh v4 identifier.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// The host:port address this record resolves to.
    pub fn address(&self) -> ServiceAddress {
        ServiceAddress {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Resolved network address.
///
/// Addresses are compared by host:port identity, not instance id: two
/// instances publishing the same host:port resolve to one address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Encode a value to JSON bytes for storage.
pub fn encode<T: Serialize>(value: &T) -> DiscoveryResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| DiscoveryError::Codec(e.to_string()))
}

/// Decode JSON bytes from storage into a typed value.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> DiscoveryResult<T> {
    serde_json::from_slice(data).map_err(|e| DiscoveryError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> InstanceRecord {
        InstanceRecord {
            id: "instance-001".into(),
            name: "billing".into(),
            host: "10.0.0.1".into(),
            port: 9000,
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample_record();
        let bytes = encode(&record).unwrap();
        let decoded: InstanceRecord = decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_field_order_insignificant() {
        let json = br#"{"port":9000,"host":"10.0.0.1","id":"instance-001","name":"billing"}"#;
        let decoded: InstanceRecord = decode(json).unwrap();
        assert_eq!(decoded, sample_record());
    }

    #[test]
    fn test_new_generates_unique_ids() {
        let a = InstanceRecord::new("billing", "10.0.0.1", 9000);
        let b = InstanceRecord::new("billing", "10.0.0.1", 9000);
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, b.name);
    }

    #[test]
    fn test_address_identity_ignores_id() {
        let a = InstanceRecord::new("billing", "10.0.0.1", 9000);
        let b = InstanceRecord::new("billing", "10.0.0.1", 9000);
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(sample_record().address().to_string(), "10.0.0.1:9000");
    }

    #[test]
    fn test_decode_invalid_json() {
        let result: DiscoveryResult<InstanceRecord> = decode(b"not json at all");
        assert!(matches!(result.unwrap_err(), DiscoveryError::Codec(_)));
    }

    #[test]
    fn test_decode_wrong_shape() {
        let result: DiscoveryResult<InstanceRecord> = decode(br#"{"id":"x"}"#);
        assert!(matches!(result.unwrap_err(), DiscoveryError::Codec(_)));
    }
}
