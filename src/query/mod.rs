//! Query Engine over the tag index
//!
//! Pure set algebra over the index's current state: every public operation
//! takes the shared lock exactly once, computes a fresh bitmap and never
//! mutates the index. Multi-tag and multi-op queries therefore see one
//! consistent point-in-time view of every tag they reference.
//!
//! Missing tags are not errors. They behave as empty sets, except that any
//! missing tag in an AND list empties the whole result.
//!
//! # Example
//!
//! ```rust
//! use roaring::RoaringBitmap;
//! use tagbox::index::TagIndex;
//! use tagbox::query::object_ids;
//!
//! let index = TagIndex::new();
//! index.batch_add_tags(1, &["vip", "male"]);
//! index.batch_add_tags(2, &["vip", "female"]);
//!
//! let engine = index.engine();
//! assert_eq!(object_ids(&engine.query_and(&["vip", "male"])), vec![1]);
//! assert_eq!(object_ids(&engine.query_difference("vip", "male")), vec![2]);
//!
//! let universe: RoaringBitmap = (1..=4).collect();
//! assert_eq!(object_ids(&engine.query_not("vip", &universe)), vec![3, 4]);
//! ```

use roaring::RoaringBitmap;

use crate::error::Result;
use crate::index::tag_index::IndexState;
use crate::index::TagIndex;
use crate::types::{ObjectId, QueryKind, QueryOp};

// ============================================================================
// Query Engine
// ============================================================================

/// Read-only query interface borrowing a [`TagIndex`]
#[derive(Debug, Clone, Copy)]
pub struct QueryEngine<'a> {
    index: &'a TagIndex,
}

impl<'a> QueryEngine<'a> {
    /// Create an engine over `index`
    pub fn new(index: &'a TagIndex) -> Self {
        Self { index }
    }

    /// Objects carrying `tag`
    pub fn query(&self, tag: &str) -> RoaringBitmap {
        self.index.read().bitmap(tag).cloned().unwrap_or_default()
    }

    /// Objects carrying every tag in `tags`
    pub fn query_and<S: AsRef<str>>(&self, tags: &[S]) -> RoaringBitmap {
        and_locked(&self.index.read(), tags)
    }

    /// Objects carrying at least one tag in `tags`
    pub fn query_or<S: AsRef<str>>(&self, tags: &[S]) -> RoaringBitmap {
        or_locked(&self.index.read(), tags)
    }

    /// Objects of `universe` not carrying `tag`
    pub fn query_not(&self, tag: &str, universe: &RoaringBitmap) -> RoaringBitmap {
        not_locked(&self.index.read(), tag, universe)
    }

    /// Tagged objects not carrying `tag`
    pub fn query_not_in_system(&self, tag: &str) -> RoaringBitmap {
        let state = self.index.read();
        not_locked(&state, tag, &state.all_objects)
    }

    /// Objects carrying `tag_a` but not `tag_b`
    pub fn query_difference(&self, tag_a: &str, tag_b: &str) -> RoaringBitmap {
        let state = self.index.read();
        match (state.bitmap(tag_a), state.bitmap(tag_b)) {
            (None, _) => RoaringBitmap::new(),
            (Some(a), None) => a.clone(),
            (Some(a), Some(b)) => a - b,
        }
    }

    /// Objects carrying exactly one of `tag_a` and `tag_b`
    pub fn query_xor(&self, tag_a: &str, tag_b: &str) -> RoaringBitmap {
        let state = self.index.read();
        match (state.bitmap(tag_a), state.bitmap(tag_b)) {
            (None, None) => RoaringBitmap::new(),
            (Some(a), None) => a.clone(),
            (None, Some(b)) => b.clone(),
            (Some(a), Some(b)) => a ^ b,
        }
    }

    /// Evaluate each op on its own tags, then intersect all partial results
    ///
    /// An op's kind only decides how its own tags combine; partial results
    /// are always intersected with each other, even for OR ops. Every op is
    /// validated before any is evaluated.
    pub fn complex_query(&self, ops: &[QueryOp]) -> Result<RoaringBitmap> {
        for op in ops {
            op.validate()?;
        }

        let state = self.index.read();
        let mut result: Option<RoaringBitmap> = None;

        for op in ops {
            let partial = match op.kind {
                QueryKind::And => and_locked(&state, &op.tags),
                QueryKind::Or => or_locked(&state, &op.tags),
                QueryKind::Not => not_locked(&state, &op.tags[0], &state.all_objects),
            };

            result = Some(match result {
                None => partial,
                Some(mut acc) => {
                    acc &= &partial;
                    acc
                }
            });
        }

        Ok(result.unwrap_or_default())
    }
}

// ============================================================================
// Locked helpers (caller holds the read lock)
// ============================================================================

fn and_locked<S: AsRef<str>>(state: &IndexState, tags: &[S]) -> RoaringBitmap {
    let Some((first, rest)) = tags.split_first() else {
        return RoaringBitmap::new();
    };
    let Some(first) = state.bitmap(first.as_ref()) else {
        return RoaringBitmap::new();
    };

    let mut result = first.clone();
    for tag in rest {
        match state.bitmap(tag.as_ref()) {
            Some(bitmap) => result &= bitmap,
            None => return RoaringBitmap::new(),
        }
    }
    result
}

fn or_locked<S: AsRef<str>>(state: &IndexState, tags: &[S]) -> RoaringBitmap {
    let mut result = RoaringBitmap::new();
    for bitmap in tags.iter().filter_map(|tag| state.bitmap(tag.as_ref())) {
        result |= bitmap;
    }
    result
}

fn not_locked(state: &IndexState, tag: &str, universe: &RoaringBitmap) -> RoaringBitmap {
    match state.bitmap(tag) {
        Some(bitmap) => universe - bitmap,
        None => universe.clone(),
    }
}

// ============================================================================
// Bitmap helpers
// ============================================================================

/// Object identifiers in ascending order
pub fn object_ids(bitmap: &RoaringBitmap) -> Vec<ObjectId> {
    bitmap.iter().collect()
}

/// Number of objects in `bitmap`
pub fn count(bitmap: &RoaringBitmap) -> u64 {
    bitmap.len()
}

/// Whether `object_id` is in `bitmap`
pub fn contains(bitmap: &RoaringBitmap, object_id: ObjectId) -> bool {
    bitmap.contains(object_id)
}
