//! Replication between the tag index and the external store
//!
//! Every store key is `<prefix><tag>`; the value is the tag's raw roaring
//! serialization. `<prefix>_meta` is reserved and never treated as a tag.
//!
//! Bitmaps are copied out of the index under its read lock, and the lock is
//! released before any store call is awaited.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{BatchError, Error, Result};
use crate::index::{deserialize_bitmap, TagIndex};
use crate::store::TagStore;
use crate::types::TagState;

/// Suffix of the reserved metadata key
pub const META_SUFFIX: &str = "_meta";

/// Moves tag bitmaps between a [`TagIndex`] and a [`TagStore`]
pub struct Replicator {
    index: Arc<TagIndex>,
    store: Arc<dyn TagStore>,
    prefix: String,
}

impl Replicator {
    /// Create a replicator writing keys under `prefix`
    pub fn new(index: Arc<TagIndex>, store: Arc<dyn TagStore>, prefix: impl Into<String>) -> Self {
        Self {
            index,
            store,
            prefix: prefix.into(),
        }
    }

    /// The replicated index
    pub fn index(&self) -> &Arc<TagIndex> {
        &self.index
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn TagStore> {
        &self.store
    }

    /// Store key for `tag`
    pub fn key_for(&self, tag: &str) -> String {
        format!("{}{}", self.prefix, tag)
    }

    /// The reserved metadata key
    pub fn meta_key(&self) -> String {
        self.key_for(META_SUFFIX)
    }

    /// Write every tag to the store
    ///
    /// Tags that fail to serialize or write are collected into a
    /// [`BatchError`]; the rest are still written and marked clean. Returns the
    /// number of tags written.
    pub async fn replicate_all(&self) -> Result<usize> {
        let snapshot = self.index.serialize_all();
        let mut batch = BatchError::new("replicate");
        let mut written = Vec::with_capacity(snapshot.len());

        for (name, serialized) in snapshot {
            let serialized = match serialized {
                Ok(serialized) => serialized,
                Err(e) => {
                    batch.push(name, e);
                    continue;
                },
            };

            match self.store.set(&self.key_for(&name), &serialized.bytes).await {
                Ok(()) => {
                    batch.record_success();
                    written.push((name, serialized.version));
                },
                Err(e) => batch.push(name, e.into()),
            }
        }

        self.index
            .mark_replicated(written.iter().map(|(name, version)| (name.as_str(), *version)));

        debug!(
            store = self.store.store_id(),
            written = batch.succeeded,
            failed = batch.failures.len(),
            "Replication pass finished"
        );
        batch.into_result()
    }

    /// Write one tag to the store immediately
    pub async fn replicate_tag(&self, tag: &str) -> Result<()> {
        let serialized = self
            .index
            .serialize_tag(tag)
            .ok_or_else(|| Error::TagNotFound(tag.to_string()))??;

        self.store.set(&self.key_for(tag), &serialized.bytes).await?;
        self.index.mark_replicated([(tag, serialized.version)]);
        Ok(())
    }

    /// Replace the in-memory `tag` with its stored bitmap
    pub async fn load_tag(&self, tag: &str) -> Result<()> {
        let bytes = self
            .store
            .get(&self.key_for(tag))
            .await?
            .ok_or_else(|| Error::TagNotFound(tag.to_string()))?;

        let bitmap = deserialize_bitmap(tag, &bytes)?;
        self.index.install_replicated(tag, bitmap);
        Ok(())
    }

    /// Load every tag stored under the prefix
    ///
    /// Keys that fail to read or decode are collected into a [`BatchError`]
    /// after every key has been attempted. A failed scan fails outright.
    /// Returns the number of tags loaded.
    pub async fn recover_all(&self) -> Result<usize> {
        let keys = self.store.scan_prefix(&self.prefix).await?;
        let meta_key = self.meta_key();
        let mut batch = BatchError::new("recover");

        for key in keys {
            if key == meta_key {
                continue;
            }
            let Some(tag) = key.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            if tag.is_empty() {
                continue;
            }

            let bytes = match self.store.get(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(key = %key, "Key vanished during recovery, skipping");
                    continue;
                },
                Err(e) => {
                    batch.push(tag, e.into());
                    continue;
                },
            };

            match deserialize_bitmap(tag, &bytes) {
                Ok(bitmap) => {
                    self.index.install_replicated(tag, bitmap);
                    batch.record_success();
                },
                Err(e) => batch.push(tag, e),
            }
        }

        if batch.failures.is_empty() {
            info!(tags = batch.succeeded, "Recovered tags from store");
        } else {
            warn!(
                tags = batch.succeeded,
                failed = batch.failures.len(),
                "Recovered tags from store with failures"
            );
        }
        batch.into_result()
    }

    /// Delete `tag`'s replica from the store
    pub async fn delete_tag(&self, tag: &str) -> Result<()> {
        self.store.delete(&self.key_for(tag)).await?;
        Ok(())
    }

    /// Delete the replica of a tag that emptied in memory
    ///
    /// Does nothing if the tag exists again. A tag re-created while the delete
    /// is in flight is marked dirty so its replica gets rewritten. Returns
    /// whether the delete was issued.
    pub async fn delete_emptied_tag(&self, tag: &str) -> Result<bool> {
        if self.index.tag_state(tag) != TagState::Absent {
            return Ok(false);
        }

        self.delete_tag(tag).await?;
        if self.index.invalidate_replica(tag) {
            debug!(tag = %tag, "Tag re-created during replica delete, marked dirty");
        }
        Ok(true)
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("store", &self.store.store_id())
            .field("prefix", &self.prefix)
            .finish()
    }
}
