//! At-most-once webhook processing within a TTL window
//!
//! The manager derives a key from the raw payload bytes and delegates to an
//! [`IdempotencyStore`]. Keys are the lowercase hex SHA-256 digest of the
//! payload, so identical deliveries map to the same record regardless of
//! which endpoint received them.

use crate::config::IdempotencyConfig;
use crate::errors::{ConfigError, StoreError};
use crate::storage::{IdempotencyStore, MemoryStore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::invalid("ttl", "must be greater than zero"));
        }
        Ok(Self { store, ttl })
    }

    /// Manager over a fresh [`MemoryStore`]
    pub fn in_memory(ttl: Duration) -> Result<Self, ConfigError> {
        Self::new(Arc::new(MemoryStore::new()), ttl)
    }

    pub fn from_config(
        store: Arc<dyn IdempotencyStore>,
        config: &IdempotencyConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::new(store, config.ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Deterministic key for a payload: 64 lowercase hex characters
    pub fn generate_key_from_payload(payload: &[u8]) -> String {
        hex::encode(Sha256::digest(payload))
    }

    pub fn is_already_processed(&self, payload: &[u8]) -> Result<bool, StoreError> {
        let key = Self::generate_key_from_payload(payload);
        let processed = self.store.is_processed(&key)?;
        if processed {
            tracing::debug!(key = %key, "duplicate webhook payload");
        }
        Ok(processed)
    }

    pub fn mark_as_processed(&self, payload: &[u8]) -> Result<(), StoreError> {
        let key = Self::generate_key_from_payload(payload);
        self.store.mark_processed(&key, self.ttl)?;
        tracing::debug!(key = %key, ttl_secs = self.ttl.as_secs(), "recorded webhook payload");
        Ok(())
    }

    /// Check and mark in one step. Returns `true` only for the first delivery
    /// of this payload within the TTL; concurrent duplicates get `false`.
    pub fn claim(&self, payload: &[u8]) -> Result<bool, StoreError> {
        let key = Self::generate_key_from_payload(payload);
        let claimed = self.store.try_claim(&key, self.ttl)?;
        if claimed {
            tracing::debug!(key = %key, ttl_secs = self.ttl.as_secs(), "claimed webhook payload");
        } else {
            tracing::debug!(key = %key, "duplicate webhook payload");
        }
        Ok(claimed)
    }

    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD_1: &[u8] = br#"{"test":"payload1"}"#;
    const PAYLOAD_2: &[u8] = br#"{"test":"payload2"}"#;

    fn manager() -> IdempotencyManager {
        IdempotencyManager::in_memory(Duration::from_secs(24 * 60 * 60)).unwrap()
    }

    #[test]
    fn test_mark_then_check() {
        let manager = manager();

        assert!(!manager.is_already_processed(PAYLOAD_1).unwrap());
        manager.mark_as_processed(PAYLOAD_1).unwrap();
        assert!(manager.is_already_processed(PAYLOAD_1).unwrap());

        assert!(!manager.is_already_processed(PAYLOAD_2).unwrap());

        manager.mark_as_processed(PAYLOAD_1).unwrap();
        assert!(manager.is_already_processed(PAYLOAD_1).unwrap());
        assert!(!manager.is_already_processed(PAYLOAD_2).unwrap());
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = IdempotencyManager::generate_key_from_payload(PAYLOAD_1);
        let b = IdempotencyManager::generate_key_from_payload(PAYLOAD_1.to_vec().as_slice());
        let c = IdempotencyManager::generate_key_from_payload(PAYLOAD_2);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn test_key_of_empty_payload() {
        assert_eq!(
            IdempotencyManager::generate_key_from_payload(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_processed_payload_expires() {
        let manager = IdempotencyManager::in_memory(Duration::from_millis(10)).unwrap();
        manager.mark_as_processed(PAYLOAD_1).unwrap();
        assert!(manager.is_already_processed(PAYLOAD_1).unwrap());

        std::thread::sleep(Duration::from_millis(20));

        assert!(!manager.is_already_processed(PAYLOAD_1).unwrap());
        assert_eq!(manager.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_claim_admits_first_delivery_only() {
        let manager = manager();

        assert!(manager.claim(PAYLOAD_1).unwrap());
        assert!(!manager.claim(PAYLOAD_1).unwrap());
        assert!(manager.is_already_processed(PAYLOAD_1).unwrap());
        assert!(manager.claim(PAYLOAD_2).unwrap());
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let err = IdempotencyManager::in_memory(Duration::ZERO).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "ttl", .. }));
    }

    #[derive(Debug)]
    struct DownStore;

    impl IdempotencyStore for DownStore {
        fn is_processed(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("redis unreachable".into()))
        }
        fn mark_processed(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Backend("write refused".into()))
        }
        fn try_claim(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("redis unreachable".into()))
        }
        fn purge_expired(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[test]
    fn test_store_failures_are_surfaced() {
        let manager =
            IdempotencyManager::new(Arc::new(DownStore), Duration::from_secs(60)).unwrap();

        assert!(matches!(
            manager.is_already_processed(PAYLOAD_1),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            manager.mark_as_processed(PAYLOAD_1),
            Err(StoreError::Backend(_))
        ));
        assert!(manager.claim(PAYLOAD_1).is_err());
    }
}
