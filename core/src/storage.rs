//! Storage backends for idempotency records
//!
//! This module provides different store implementations:
//! - `MemoryStore`: Thread-safe in-memory map with lazy expiry and an explicit purge
//! - `NullStore`: Never remembers anything, for disabling deduplication in tests
//!
//! The [`IdempotencyStore`] trait is the seam for an external backend; every
//! operation is fallible so a backend outage is reported instead of being
//! mistaken for "not processed".

use crate::errors::StoreError;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Abstract store of processed keys with per-key expiry
pub trait IdempotencyStore: Send + Sync + std::fmt::Debug {
    /// Whether `key` has been marked and has not yet expired
    fn is_processed(&self, key: &str) -> Result<bool, StoreError>;

    /// Record `key` as processed for `ttl`.
    ///
    /// Marking a key that is already live leaves its original expiry in place.
    fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically mark `key` unless it is already live.
    ///
    /// Returns `true` for the single caller that claimed the key.
    fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop expired records, returning how many were removed
    fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// In-memory store keyed by digest, holding each record's expiry instant
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Instant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records currently held, including expired ones not yet purged
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Instant>>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Instant>>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Insert unless a live record exists; returns whether it inserted
    fn insert_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut records = self.write()?;

        if records.get(key).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }
        let expiry = now
            .checked_add(ttl)
            .ok_or_else(|| StoreError::Unavailable(format!("ttl {ttl:?} exceeds clock range")))?;
        records.insert(key.to_string(), expiry);
        Ok(true)
    }
}

impl IdempotencyStore for MemoryStore {
    fn is_processed(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self.read()?.get(key).is_some_and(|expiry| *expiry > now))
    }

    fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.insert_if_absent(key, ttl).map(|_| ())
    }

    fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.insert_if_absent(key, ttl)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, expiry| *expiry > now);
        Ok(before - records.len())
    }
}

/// Store that forgets every key immediately
///
/// Every payload is treated as new. Useful for:
/// - Exercising handlers without deduplication in tests
/// - Deployments where an upstream queue already guarantees single delivery
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl IdempotencyStore for NullStore {
    fn is_processed(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn mark_processed(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        Ok(())
    }

    fn try_claim(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Ok(true)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
