//! Durability Module
//!
//! Keeps a crash-safe copy of the tag index outside the process.
//!
//! # Components
//!
//! - **replication**: full and single-tag transfer to and from the store
//! - **worker**: debounced background replication and replica deletion
//! - **snapshot**: whole-index JSON snapshot files and the periodic writer

pub mod replication;
pub mod snapshot;
pub mod worker;

pub use replication::{Replicator, META_SUFFIX};
pub use snapshot::{load_snapshot, save_snapshot, SnapshotTask};
pub use worker::ReplicationWorker;
