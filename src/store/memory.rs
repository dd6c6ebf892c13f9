//! In-process key-value store
//!
//! A lightweight alternative to Redis for tests and embedded use. Stores all
//! values in memory with no persistence.
//!
//! Failure injection ([`MemoryStore::fail_key`], [`MemoryStore::fail_scans`])
//! makes individual keys or scans error, so aggregate failure paths can be
//! exercised without a real server.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::TagStore;
use crate::error::StoreError;

/// In-memory [`TagStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    failing_keys: RwLock<HashSet<String>>,
    fail_scans: AtomicBool,
    closed: AtomicBool,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every get/set/delete of `key` fail
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.write().insert(key.into());
    }

    /// Stop failing `key`
    pub fn heal_key(&self, key: &str) {
        self.failing_keys.write().remove(key);
    }

    /// Make prefix scans fail
    pub fn fail_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    /// Write raw bytes, bypassing failure injection
    pub fn insert_raw(&self, key: impl Into<String>, value: Vec<u8>) {
        self.data.write().insert(key.into(), value);
    }

    /// Read raw bytes, bypassing failure injection
    pub fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    /// All keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    /// Number of successful `set` calls
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of successful `delete` calls
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if self.failing_keys.read().contains(key) {
            return Err(StoreError::Command(format!("injected failure for {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl TagStore for MemoryStore {
    fn store_id(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check(key)?;
        self.data.write().insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.data.write().remove(key);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if self.fail_scans.load(Ordering::SeqCst) {
            return Err(StoreError::Command("injected scan failure".to_string()));
        }
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
