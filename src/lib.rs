//! Tagbox - compressed-bitmap tag index with boolean queries
//!
//! This library provides an in-memory object tagging system with:
//! - One roaring bitmap per tag over `u32` object identifiers
//! - AND / OR / NOT / difference / XOR and multi-step queries under one read lock
//! - Debounced background replication to Redis
//! - Crash recovery from Redis and local JSON snapshots

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Concurrent tag name to bitmap index
pub mod index;

/// Set-algebra queries over the index
pub mod query;

/// External key-value stores holding tag replicas
/// Provides the store trait, a Redis client and an in-process store
pub mod store;

/// Replication, recovery and snapshot files
pub mod durability;

/// Service object combining index, queries and durability
pub mod system;

// Re-export main types
pub use config::Config;
pub use error::{BatchError, Error, Result, StoreError};
pub use index::TagIndex;
pub use query::{contains, count, object_ids, QueryEngine};
pub use roaring::RoaringBitmap;
pub use store::{MemoryStore, RedisStore, TagStore};
pub use system::TagSystem;
pub use types::{ObjectId, QueryKind, QueryOp, Stats, TagState};
