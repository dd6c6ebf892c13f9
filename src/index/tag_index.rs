//! Tag Index - concurrent tag name to bitmap mapping
//!
//! The index owns one [`RoaringBitmap`] per tag plus a derived bitmap of every
//! object that was ever tagged. Both live behind a single reader/writer lock:
//! mutators take it exclusively for the duration of their in-memory update,
//! lookups and queries share it.
//!
//! # Invariants
//!
//! - A tag with an empty bitmap is never present
//! - `all_objects` is a superset of the union of all tag bitmaps; it only grows
//! - Every entry carries a mutation version used to track replication state
//!
//! # Example
//!
//! ```rust
//! use tagbox::index::TagIndex;
//!
//! let index = TagIndex::new();
//! index.add_tag(1, "vip");
//! index.batch_add_tags(2, &["vip", "female"]);
//!
//! assert!(index.has_tag(2, "female"));
//! assert_eq!(index.tag_cardinality("vip"), 2);
//!
//! index.remove_tag(2, "female");
//! assert!(!index.tag_names().contains(&"female".to_string()));
//! ```

use std::collections::HashMap;

use parking_lot::{RwLock, RwLockReadGuard};
use roaring::RoaringBitmap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::query::QueryEngine;
use crate::types::{ObjectId, Stats, TagState};

use super::notify::ChangeNotifier;

// ============================================================================
// Index State
// ============================================================================

/// A tag's bitmap with replication bookkeeping
#[derive(Debug, Clone)]
pub(crate) struct TagEntry {
    /// Objects carrying the tag
    pub(crate) bitmap: RoaringBitmap,

    /// Version assigned by the last mutation
    version: u64,

    /// Version last written to or read from the store
    replicated: Option<u64>,
}

impl TagEntry {
    fn state(&self) -> TagState {
        if self.replicated == Some(self.version) {
            TagState::Clean
        } else {
            TagState::Dirty
        }
    }
}

/// Everything guarded by the index lock
#[derive(Debug, Default)]
pub(crate) struct IndexState {
    /// Tag name to entry
    pub(crate) tags: HashMap<String, TagEntry>,

    /// Union of every bitmap ever inserted
    pub(crate) all_objects: RoaringBitmap,

    /// Monotonic version source, shared by all tags
    next_version: u64,
}

impl IndexState {
    /// Bitmap for `tag`, if present
    pub(crate) fn bitmap(&self, tag: &str) -> Option<&RoaringBitmap> {
        self.tags.get(tag).map(|entry| &entry.bitmap)
    }

    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Insert `object_id` into `tag`, creating it if needed
    ///
    /// Returns true if the tag changed.
    fn insert(&mut self, tag: &str, object_id: ObjectId) -> bool {
        let version = self.next_version + 1;
        let entry = self.tags.entry(tag.to_string()).or_insert_with(|| TagEntry {
            bitmap: RoaringBitmap::new(),
            version,
            replicated: None,
        });

        if entry.bitmap.insert(object_id) {
            entry.version = version;
            self.next_version = version;
            true
        } else {
            false
        }
    }
}

/// One tag serialized for replication or snapshotting
#[derive(Debug, Clone)]
pub struct SerializedTag {
    /// Tag name
    pub name: String,
    /// Entry version at serialization time
    pub version: u64,
    /// Roaring portable serialization of the bitmap
    pub bytes: Vec<u8>,
}

/// Serialize a bitmap into its portable byte form
pub fn serialize_bitmap(tag: &str, bitmap: &RoaringBitmap) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut bytes)
        .map_err(|e| Error::serialization(tag, e))?;
    Ok(bytes)
}

/// Decode a bitmap from its portable byte form
pub fn deserialize_bitmap(tag: &str, bytes: &[u8]) -> Result<RoaringBitmap> {
    RoaringBitmap::deserialize_from(bytes).map_err(|e| Error::serialization(tag, e))
}

// ============================================================================
// Tag Index
// ============================================================================

/// Concurrency-safe tag to bitmap index
#[derive(Debug, Default)]
pub struct TagIndex {
    state: RwLock<IndexState>,
    notifier: ChangeNotifier,
}

impl TagIndex {
    /// Create an index that notifies nobody
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index posting changes to `notifier`
    pub fn with_notifier(notifier: ChangeNotifier) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            notifier,
        }
    }

    /// Shared access for the query engine
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read()
    }

    /// Query engine over this index
    pub fn engine(&self) -> QueryEngine<'_> {
        QueryEngine::new(self)
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Tag `object_id` with `tag`, creating the tag if absent
    pub fn add_tag(&self, object_id: ObjectId, tag: &str) {
        if tag.is_empty() {
            debug!(object_id, "Ignoring add with empty tag name");
            return;
        }

        let changed = {
            let mut state = self.state.write();
            let changed = state.insert(tag, object_id);
            state.all_objects.insert(object_id);
            changed
        };

        if changed {
            self.notifier.mark_dirty();
        }
    }

    /// Remove `tag` from `object_id`
    ///
    /// Deletes the tag when its bitmap becomes empty and schedules deletion of
    /// its store replica. The all-objects bitmap is left untouched.
    pub fn remove_tag(&self, object_id: ObjectId, tag: &str) {
        let outcome = {
            let mut state = self.state.write();
            let version = state.next_version + 1;

            let Some(entry) = state.tags.get_mut(tag) else {
                return;
            };
            if !entry.bitmap.remove(object_id) {
                return;
            }

            if entry.bitmap.is_empty() {
                state.tags.remove(tag);
                Removal::Emptied
            } else {
                entry.version = version;
                state.next_version = version;
                Removal::Shrunk
            }
        };

        match outcome {
            Removal::Emptied => {
                debug!(tag = %tag, "Tag emptied, scheduling replica deletion");
                self.notifier.tag_removed(tag);
            }
            Removal::Shrunk => self.notifier.mark_dirty(),
        }
    }

    /// Tag `object_id` with every name in `tags` in one critical section
    pub fn batch_add_tags<S: AsRef<str>>(&self, object_id: ObjectId, tags: &[S]) {
        let mut changed = false;
        {
            let mut state = self.state.write();
            let mut any = false;

            for tag in tags.iter().map(AsRef::as_ref).filter(|t| !t.is_empty()) {
                changed |= state.insert(tag, object_id);
                any = true;
            }

            if any {
                state.all_objects.insert(object_id);
            }
        }

        if changed {
            self.notifier.mark_dirty();
        }
    }

    /// Tag every object in `object_ids` with `tag` in one critical section
    pub fn batch_add_objects_to_tag(&self, object_ids: &[ObjectId], tag: &str) {
        if tag.is_empty() || object_ids.is_empty() {
            return;
        }

        let changed = {
            let mut state = self.state.write();
            let version = state.bump_version();
            let IndexState {
                tags, all_objects, ..
            } = &mut *state;

            let entry = tags.entry(tag.to_string()).or_insert_with(|| TagEntry {
                bitmap: RoaringBitmap::new(),
                version,
                replicated: None,
            });

            let before = entry.bitmap.len();
            entry.bitmap.extend(object_ids.iter().copied());
            all_objects.extend(object_ids.iter().copied());

            let changed = entry.bitmap.len() != before;
            if changed {
                entry.version = version;
            }
            changed
        };

        if changed {
            self.notifier.mark_dirty();
        }
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Whether `object_id` carries `tag`
    pub fn has_tag(&self, object_id: ObjectId, tag: &str) -> bool {
        self.state
            .read()
            .bitmap(tag)
            .is_some_and(|bitmap| bitmap.contains(object_id))
    }

    /// Every tag carried by `object_id`, in no particular order
    ///
    /// Linear in the number of tags.
    pub fn object_tags(&self, object_id: ObjectId) -> Vec<String> {
        self.state
            .read()
            .tags
            .iter()
            .filter(|(_, entry)| entry.bitmap.contains(object_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// All tag names, in no particular order
    pub fn tag_names(&self) -> Vec<String> {
        self.state.read().tags.keys().cloned().collect()
    }

    /// Number of objects carrying `tag`, 0 if absent
    pub fn tag_cardinality(&self, tag: &str) -> u64 {
        self.state.read().bitmap(tag).map_or(0, RoaringBitmap::len)
    }

    /// Number of tags
    pub fn tag_count(&self) -> usize {
        self.state.read().tags.len()
    }

    /// Copy of the all-objects bitmap
    pub fn all_objects(&self) -> RoaringBitmap {
        self.state.read().all_objects.clone()
    }

    /// Copy of `tag`'s bitmap, if present
    pub fn bitmap(&self, tag: &str) -> Option<RoaringBitmap> {
        self.state.read().bitmap(tag).cloned()
    }

    /// Replication state of `tag`
    pub fn tag_state(&self, tag: &str) -> TagState {
        self.state
            .read()
            .tags
            .get(tag)
            .map_or(TagState::Absent, TagEntry::state)
    }

    /// Tags changed since they were last replicated
    pub fn dirty_tags(&self) -> Vec<String> {
        self.state
            .read()
            .tags
            .iter()
            .filter(|(_, entry)| entry.state() == TagState::Dirty)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Single-pass statistics under the read lock
    ///
    /// The largest tag is the last one seen with a cardinality strictly greater
    /// than the running maximum; ties resolve in map iteration order.
    pub fn stats(&self) -> Stats {
        let state = self.state.read();

        let mut stats = Stats {
            total_tags: state.tags.len(),
            unique_objects: state.all_objects.len(),
            ..Stats::default()
        };

        for (name, entry) in &state.tags {
            let cardinality = entry.bitmap.len();
            stats.total_objects += cardinality;
            stats.memory_usage += entry.bitmap.serialized_size() as u64;

            if cardinality > stats.largest_tag_size {
                stats.largest_tag_size = cardinality;
                stats.largest_tag = Some(name.clone());
            }
        }

        stats
    }

    // ------------------------------------------------------------------------
    // Durability support
    // ------------------------------------------------------------------------

    /// Serialize every tag under the read lock
    ///
    /// Each element pairs the tag name with its serialized form or the error
    /// that prevented serialization.
    pub fn serialize_all(&self) -> Vec<(String, Result<SerializedTag>)> {
        let state = self.state.read();
        state
            .tags
            .iter()
            .map(|(name, entry)| {
                let serialized = serialize_bitmap(name, &entry.bitmap).map(|bytes| SerializedTag {
                    name: name.clone(),
                    version: entry.version,
                    bytes,
                });
                (name.clone(), serialized)
            })
            .collect()
    }

    /// Serialize one tag, if present
    pub fn serialize_tag(&self, tag: &str) -> Option<Result<SerializedTag>> {
        let state = self.state.read();
        state.tags.get(tag).map(|entry| {
            serialize_bitmap(tag, &entry.bitmap).map(|bytes| SerializedTag {
                name: tag.to_string(),
                version: entry.version,
                bytes,
            })
        })
    }

    /// Mark tags clean if they have not changed since `version` was serialized
    pub fn mark_replicated<'a, I>(&self, written: I)
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        let mut state = self.state.write();
        for (name, version) in written {
            if let Some(entry) = state.tags.get_mut(name) {
                if entry.version == version {
                    entry.replicated = Some(version);
                }
            }
        }
    }

    /// Replace `tag` with a bitmap read from the store, marking it clean
    ///
    /// Empty bitmaps remove the tag instead. The bitmap is folded into the
    /// all-objects bitmap.
    pub fn install_replicated(&self, tag: &str, bitmap: RoaringBitmap) {
        let mut state = self.state.write();
        if bitmap.is_empty() {
            state.tags.remove(tag);
            return;
        }

        let version = state.bump_version();
        state.all_objects |= &bitmap;
        state.tags.insert(
            tag.to_string(),
            TagEntry {
                bitmap,
                version,
                replicated: Some(version),
            },
        );
    }

    /// Forget that `tag` matches the store and request replication
    ///
    /// Returns false if the tag is absent.
    pub fn invalidate_replica(&self, tag: &str) -> bool {
        let present = match self.state.write().tags.get_mut(tag) {
            Some(entry) => {
                entry.replicated = None;
                true
            }
            None => false,
        };

        if present {
            self.notifier.mark_dirty();
        }
        present
    }

    /// Union `bitmap` into `tag`, creating it if needed
    ///
    /// The merged tag is dirty relative to the store.
    pub fn merge_tag(&self, tag: &str, bitmap: &RoaringBitmap) {
        if tag.is_empty() || bitmap.is_empty() {
            return;
        }

        let changed = {
            let mut state = self.state.write();
            let version = state.bump_version();
            state.all_objects |= bitmap;

            let entry = state.tags.entry(tag.to_string()).or_insert_with(|| TagEntry {
                bitmap: RoaringBitmap::new(),
                version,
                replicated: None,
            });
            let before = entry.bitmap.len();
            entry.bitmap |= bitmap;

            let changed = entry.bitmap.len() != before;
            if changed {
                entry.version = version;
            }
            changed
        };

        if changed {
            self.notifier.mark_dirty();
        }
    }
}

enum Removal {
    Emptied,
    Shrunk,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::notify::ChangeNotifier;

    fn setup_scenario() -> TagIndex {
        let index = TagIndex::new();
        index.batch_add_tags(1, &["vip", "male"]);
        index.batch_add_tags(2, &["vip", "female"]);
        index.batch_add_tags(3, &["vip", "male"]);
        index
    }

    #[test]
    fn test_add_tag_is_idempotent() {
        let index = TagIndex::new();
        index.add_tag(7, "vip");
        index.add_tag(7, "vip");
        assert_eq!(index.tag_cardinality("vip"), 1);
        assert_eq!(index.all_objects().len(), 1);
    }

    #[test]
    fn test_remove_last_member_deletes_tag() {
        let index = setup_scenario();
        index.remove_tag(2, "female");

        assert!(!index.tag_names().contains(&"female".to_string()));
        assert_eq!(index.tag_cardinality("female"), 0);
        assert_eq!(index.tag_state("female"), TagState::Absent);
    }

    #[test]
    fn test_remove_does_not_shrink_all_objects() {
        let index = TagIndex::new();
        index.add_tag(42, "solo");
        index.remove_tag(42, "solo");

        assert_eq!(index.tag_count(), 0);
        assert!(index.all_objects().contains(42));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let index = setup_scenario();
        index.remove_tag(1, "ghost");
        index.remove_tag(99, "vip");
        assert_eq!(index.tag_cardinality("vip"), 3);
    }

    #[test]
    fn test_object_tags() {
        let index = setup_scenario();
        let mut tags = index.object_tags(1);
        tags.sort();
        assert_eq!(tags, vec!["male", "vip"]);
        assert!(index.object_tags(99).is_empty());
    }

    #[test]
    fn test_batch_add_objects_to_tag() {
        let index = TagIndex::new();
        index.batch_add_objects_to_tag(&[1, 2, 3, 3], "active");
        assert_eq!(index.tag_cardinality("active"), 3);
        assert_eq!(index.all_objects().len(), 3);

        // Empty input must not create an empty tag
        index.batch_add_objects_to_tag(&[], "never");
        assert_eq!(index.tag_state("never"), TagState::Absent);
    }

    #[test]
    fn test_batch_add_tags_with_no_names() {
        let index = TagIndex::new();
        index.batch_add_tags::<&str>(5, &[]);
        assert!(index.all_objects().is_empty());
    }

    #[test]
    fn test_empty_tag_name_ignored() {
        let index = TagIndex::new();
        index.add_tag(1, "");
        index.batch_add_tags(1, &["", "ok"]);
        assert_eq!(index.tag_names(), vec!["ok".to_string()]);
    }

    #[test]
    fn test_stats() {
        let index = setup_scenario();
        let stats = index.stats();

        assert_eq!(stats.total_tags, 3);
        assert_eq!(stats.total_objects, 6);
        assert_eq!(stats.unique_objects, 3);
        assert_eq!(stats.largest_tag.as_deref(), Some("vip"));
        assert_eq!(stats.largest_tag_size, 3);
        assert!(stats.memory_usage > 0);
    }

    #[test]
    fn test_stats_empty_index() {
        let stats = TagIndex::new().stats();
        assert_eq!(stats, Stats::default());
        assert!(stats.largest_tag.is_none());
    }

    #[test]
    fn test_dirty_clean_transitions() {
        let index = TagIndex::new();
        index.add_tag(1, "vip");
        assert_eq!(index.tag_state("vip"), TagState::Dirty);

        let serialized = index.serialize_tag("vip").unwrap().unwrap();
        index.mark_replicated([("vip", serialized.version)]);
        assert_eq!(index.tag_state("vip"), TagState::Clean);

        // Re-adding an existing member changes nothing
        index.add_tag(1, "vip");
        assert_eq!(index.tag_state("vip"), TagState::Clean);

        index.add_tag(2, "vip");
        assert_eq!(index.tag_state("vip"), TagState::Dirty);
        assert_eq!(index.dirty_tags(), vec!["vip".to_string()]);
    }

    #[test]
    fn test_stale_replication_does_not_mark_clean() {
        let index = TagIndex::new();
        index.add_tag(1, "vip");
        let serialized = index.serialize_tag("vip").unwrap().unwrap();

        // Mutation while the write is in flight
        index.add_tag(2, "vip");
        index.mark_replicated([("vip", serialized.version)]);
        assert_eq!(index.tag_state("vip"), TagState::Dirty);
    }

    #[test]
    fn test_install_replicated_is_clean_and_feeds_all_objects() {
        let index = TagIndex::new();
        let bitmap: RoaringBitmap = [10, 20, 30].into_iter().collect();
        index.install_replicated("recovered", bitmap);

        assert_eq!(index.tag_state("recovered"), TagState::Clean);
        assert_eq!(index.all_objects().len(), 3);
        assert!(index.has_tag(20, "recovered"));
    }

    #[test]
    fn test_invalidate_replica() {
        let (notifier, mut rx) = ChangeNotifier::channel(100, true);
        let index = TagIndex::with_notifier(notifier);
        index.install_replicated("vip", [1, 2].into_iter().collect());
        assert_eq!(index.tag_state("vip"), TagState::Clean);

        assert!(index.invalidate_replica("vip"));
        assert_eq!(index.tag_state("vip"), TagState::Dirty);
        assert!(rx.triggers.try_recv().is_ok());

        assert!(!index.invalidate_replica("ghost"));
        assert!(rx.triggers.try_recv().is_err());
    }

    #[test]
    fn test_merge_tag_unions() {
        let index = TagIndex::new();
        index.add_tag(1, "vip");
        let incoming: RoaringBitmap = [2, 3].into_iter().collect();
        index.merge_tag("vip", &incoming);

        assert_eq!(index.tag_cardinality("vip"), 3);
        assert_eq!(index.all_objects().len(), 3);
    }

    #[test]
    fn test_bitmap_serialization_roundtrip() {
        let bitmap: RoaringBitmap = (0..1000).step_by(7).collect();
        let bytes = serialize_bitmap("t", &bitmap).unwrap();
        assert_eq!(deserialize_bitmap("t", &bytes).unwrap(), bitmap);

        let err = deserialize_bitmap("t", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Serialization { ref tag, .. } if tag == "t"));
    }

    #[test]
    fn test_notifications() {
        let (notifier, mut rx) = ChangeNotifier::channel(100, true);
        let index = TagIndex::with_notifier(notifier);

        index.add_tag(1, "vip");
        assert!(rx.triggers.try_recv().is_ok());

        // No-op mutation posts nothing
        index.add_tag(1, "vip");
        assert!(rx.triggers.try_recv().is_err());

        index.remove_tag(1, "vip");
        assert_eq!(rx.deletions.try_recv().unwrap(), "vip");
        assert!(rx.triggers.try_recv().is_err());
    }
}
