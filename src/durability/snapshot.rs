//! Local snapshot files
//!
//! A snapshot is one pretty-printed JSON object mapping each tag name to the
//! base64 encoding of its roaring serialization:
//!
//! ```json
//! {
//!   "female": "OjAAAAEAAAAAAAAAEAAAAAIA",
//!   "vip": "OjAAAAEAAAAAAAIAEAAAAAEAAgADAA=="
//! }
//! ```
//!
//! Saving writes a sibling temporary file and renames it over the target, so
//! readers never observe a partial snapshot. Loading unions into the index
//! instead of replacing it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{BatchError, Error, Result};
use crate::index::{deserialize_bitmap, TagIndex};

type SnapshotDocument = BTreeMap<String, String>;

/// Write every tag of `index` to `path`
///
/// Returns the number of tags written. Tags that fail to serialize are left out
/// of the file and reported as a [`BatchError`] after it is in place.
pub fn save_snapshot(index: &TagIndex, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let mut batch = BatchError::new("snapshot_save");
    let mut document = SnapshotDocument::new();

    for (name, serialized) in index.serialize_all() {
        match serialized {
            Ok(serialized) => {
                document.insert(name, STANDARD.encode(&serialized.bytes));
                batch.record_success();
            },
            Err(e) => batch.push(name, e),
        }
    }

    let contents = serde_json::to_vec_pretty(&document)
        .map_err(|e| Error::Snapshot(format!("Failed to encode snapshot: {}", e)))?;

    let tmp = temp_path(path);
    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    debug!(path = %path.display(), tags = document.len(), "Snapshot saved");
    batch.into_result()
}

/// Merge the snapshot at `path` into `index`
///
/// Every tag is attempted; tags with bad encodings are reported as a
/// [`BatchError`] while the rest are merged. Returns the number of tags merged.
pub fn load_snapshot(index: &TagIndex, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let contents = fs::read(path)?;
    let document: SnapshotDocument = serde_json::from_slice(&contents).map_err(|e| {
        Error::Snapshot(format!("Failed to parse snapshot {}: {}", path.display(), e))
    })?;

    let mut batch = BatchError::new("snapshot_load");
    for (name, encoded) in document {
        let bitmap = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| Error::serialization(&name, e))
            .and_then(|bytes| deserialize_bitmap(&name, &bytes));

        match bitmap {
            Ok(bitmap) => {
                index.merge_tag(&name, &bitmap);
                batch.record_success();
            },
            Err(e) => batch.push(name, e),
        }
    }

    debug!(path = %path.display(), tags = batch.succeeded, "Snapshot loaded");
    batch.into_result()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Periodic snapshot writer
#[derive(Debug)]
pub struct SnapshotTask {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotTask {
    /// Spawn a task saving `index` to `path` every `interval`
    ///
    /// The first snapshot is taken one interval after spawning. File I/O runs
    /// on the blocking pool.
    pub fn spawn(index: Arc<TagIndex>, path: PathBuf, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        info!(path = %path.display(), interval_secs = interval.as_secs(), "Periodic snapshots started");

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        let index = index.clone();
                        let target = path.clone();
                        match tokio::task::spawn_blocking(move || save_snapshot(&index, &target)).await {
                            Ok(Ok(_)) => {},
                            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Periodic snapshot failed"),
                            Err(e) => warn!(error = %e, "Periodic snapshot task panicked"),
                        }
                    }
                }
            }

            info!("Periodic snapshots stopped");
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the timer and wait for an in-flight snapshot to finish
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(e) = handle.await {
            warn!(error = %e, "Snapshot task ended abnormally");
        }
    }

    /// Cancel the timer without waiting
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TagState;
    use tempfile::TempDir;

    fn scenario() -> TagIndex {
        let index = TagIndex::new();
        index.batch_add_tags(1, &["vip", "male"]);
        index.batch_add_tags(2, &["vip", "female"]);
        index.batch_add_tags(3, &["vip", "male"]);
        index
    }

    #[test]
    fn test_roundtrip_into_empty_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.json");
        let source = scenario();

        assert_eq!(save_snapshot(&source, &path).unwrap(), 3);
        assert!(!temp_path(&path).exists());

        let restored = TagIndex::new();
        assert_eq!(load_snapshot(&restored, &path).unwrap(), 3);
        for tag in ["vip", "male", "female"] {
            assert_eq!(restored.bitmap(tag), source.bitmap(tag));
        }
        assert_eq!(restored.all_objects(), source.all_objects());
        assert_eq!(restored.tag_state("vip"), TagState::Dirty);
    }

    #[test]
    fn test_load_merges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.json");
        save_snapshot(&scenario(), &path).unwrap();

        let index = TagIndex::new();
        index.add_tag(99, "vip");
        index.add_tag(99, "local");
        load_snapshot(&index, &path).unwrap();

        assert_eq!(index.tag_cardinality("vip"), 4);
        assert!(index.has_tag(99, "local"));
        assert_eq!(index.all_objects().len(), 4);
    }

    #[test]
    fn test_document_is_readable_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.json");
        save_snapshot(&scenario(), &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let document: SnapshotDocument = serde_json::from_str(&contents).unwrap();
        assert_eq!(
            document.keys().cloned().collect::<Vec<_>>(),
            vec!["female", "male", "vip"]
        );
    }

    #[test]
    fn test_bad_entries_are_reported_per_tag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.json");
        let bitmap: roaring::RoaringBitmap = [5u32].into_iter().collect();
        let good = STANDARD.encode(crate::index::serialize_bitmap("ok", &bitmap).unwrap());
        let body = format!(
            r#"{{"ok": "{}", "not_base64": "!!!", "not_roaring": "{}"}}"#,
            good,
            STANDARD.encode([1u8, 2, 3])
        );
        fs::write(&path, body).unwrap();

        let index = TagIndex::new();
        let Error::Batch(batch) = load_snapshot(&index, &path).unwrap_err() else {
            panic!("expected batch error");
        };
        assert_eq!(batch.succeeded, 1);
        assert_eq!(
            batch.failed_tags().collect::<Vec<_>>(),
            vec!["not_base64", "not_roaring"]
        );
        assert!(index.has_tag(5, "ok"));
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = TempDir::new().unwrap();
        let index = TagIndex::new();

        let missing = load_snapshot(&index, dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(missing, Error::Io(_)));

        let path = dir.path().join("garbage.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(load_snapshot(&index, &path).unwrap_err(), Error::Snapshot(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("periodic.json");
        let index = Arc::new(scenario());

        let mut task = SnapshotTask::spawn(index, path.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        task.stop().await;

        assert!(path.exists());
    }
}
