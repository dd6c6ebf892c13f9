//! External key-value store abstraction
//!
//! The durability layer only needs four operations from its store: get, set
//! (no TTL), delete and prefix enumeration. [`TagStore`] captures them so the
//! Redis client and the in-process [`MemoryStore`] are interchangeable.
//!
//! Values are raw serialized bitmaps with no envelope.

pub mod memory;
pub mod redis;
pub mod util;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::{PoolMetricsSnapshot, RedisStore};

/// Core trait for key-value stores holding tag replicas
#[async_trait]
pub trait TagStore: Send + Sync + 'static {
    /// Identifier for logging
    fn store_id(&self) -> &str;

    /// Value stored at `key`, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` at `key`, overwriting any existing value
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every key starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Check the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release the connection; later calls fail with [`StoreError::Closed`]
    async fn close(&self) -> Result<(), StoreError>;
}
