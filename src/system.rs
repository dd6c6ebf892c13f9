//! Tag System - the index, its query engine and durability wired together
//!
//! [`TagSystem`] is the entry point most callers want. It owns the tag index,
//! the store connection, the background replication worker and, once started,
//! the periodic snapshot task.
//!
//! Mutators, lookups and queries are synchronous and never touch the store.
//! Durability calls are async.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tagbox::{Config, MemoryStore, TagSystem};
//!
//! # #[tokio::main]
//! # async fn main() -> tagbox::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let system = TagSystem::with_store(Config::default(), store.clone()).await?;
//!
//! system.batch_add_tags(1, &["vip", "male"]);
//! system.batch_add_tags(2, &["vip", "female"]);
//! assert_eq!(tagbox::object_ids(&system.query_and(&["vip", "male"])), vec![1]);
//!
//! system.shutdown().await?;
//! assert!(store.get_raw("tags:vip").is_some());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use roaring::RoaringBitmap;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::durability::{self, ReplicationWorker, Replicator, SnapshotTask};
use crate::error::{Error, Result};
use crate::index::{ChangeNotifier, TagIndex};
use crate::store::{RedisStore, TagStore};
use crate::types::{ObjectId, QueryOp, Stats, TagState};

/// Tag index with background durability
pub struct TagSystem {
    config: Config,
    index: Arc<TagIndex>,
    replicator: Arc<Replicator>,
    worker: Mutex<Option<ReplicationWorker>>,
    snapshots: Mutex<Option<SnapshotTask>>,
    closed: AtomicBool,
}

impl TagSystem {
    /// Connect to the Redis store named by `config` and start replication
    ///
    /// Fails with [`Error::Connection`] if the store is unreachable.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let store = RedisStore::connect(&config.store)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Self::with_store(config, Arc::new(store)).await
    }

    /// Start a system over an already-constructed store
    ///
    /// The store must answer a ping.
    pub async fn with_store(config: Config, store: Arc<dyn TagStore>) -> Result<Self> {
        config.validate()?;
        store
            .ping()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (notifier, receiver) = ChangeNotifier::channel(
            config.replication.queue_capacity,
            config.replication.auto_replicate,
        );
        let index = Arc::new(TagIndex::with_notifier(notifier));
        let replicator = Arc::new(Replicator::new(
            index.clone(),
            store.clone(),
            config.key_prefix.clone(),
        ));
        let worker =
            ReplicationWorker::spawn(replicator.clone(), receiver, config.replication.interval());

        info!(
            store = store.store_id(),
            prefix = %config.key_prefix,
            auto_replicate = config.replication.auto_replicate,
            "Tag system started"
        );

        Ok(Self {
            config,
            index,
            replicator,
            worker: Mutex::new(Some(worker)),
            snapshots: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying index
    pub fn index(&self) -> &Arc<TagIndex> {
        &self.index
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown("tag system has been shut down".to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Tag `object_id` with `tag`
    pub fn add_tag(&self, object_id: ObjectId, tag: &str) {
        self.index.add_tag(object_id, tag);
    }

    /// Remove `tag` from `object_id`
    pub fn remove_tag(&self, object_id: ObjectId, tag: &str) {
        self.index.remove_tag(object_id, tag);
    }

    /// Tag `object_id` with every name in `tags`
    pub fn batch_add_tags<S: AsRef<str>>(&self, object_id: ObjectId, tags: &[S]) {
        self.index.batch_add_tags(object_id, tags);
    }

    /// Tag every object in `object_ids` with `tag`
    pub fn batch_add_objects_to_tag(&self, object_ids: &[ObjectId], tag: &str) {
        self.index.batch_add_objects_to_tag(object_ids, tag);
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Whether `object_id` carries `tag`
    pub fn has_tag(&self, object_id: ObjectId, tag: &str) -> bool {
        self.index.has_tag(object_id, tag)
    }

    /// Tags carried by `object_id`
    pub fn object_tags(&self, object_id: ObjectId) -> Vec<String> {
        self.index.object_tags(object_id)
    }

    /// All tag names
    pub fn tag_names(&self) -> Vec<String> {
        self.index.tag_names()
    }

    /// Number of objects carrying `tag`
    pub fn tag_cardinality(&self, tag: &str) -> u64 {
        self.index.tag_cardinality(tag)
    }

    /// Number of tags
    pub fn tag_count(&self) -> usize {
        self.index.tag_count()
    }

    /// Every object ever tagged
    pub fn all_objects(&self) -> RoaringBitmap {
        self.index.all_objects()
    }

    /// Replication state of `tag`
    pub fn tag_state(&self, tag: &str) -> TagState {
        self.index.tag_state(tag)
    }

    /// Index statistics
    pub fn stats(&self) -> Stats {
        self.index.stats()
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// Objects carrying `tag`
    pub fn query(&self, tag: &str) -> RoaringBitmap {
        self.index.engine().query(tag)
    }

    /// Objects carrying every tag
    pub fn query_and<S: AsRef<str>>(&self, tags: &[S]) -> RoaringBitmap {
        self.index.engine().query_and(tags)
    }

    /// Objects carrying any tag
    pub fn query_or<S: AsRef<str>>(&self, tags: &[S]) -> RoaringBitmap {
        self.index.engine().query_or(tags)
    }

    /// Objects of `universe` without `tag`
    pub fn query_not(&self, tag: &str, universe: &RoaringBitmap) -> RoaringBitmap {
        self.index.engine().query_not(tag, universe)
    }

    /// Tagged objects without `tag`
    pub fn query_not_in_system(&self, tag: &str) -> RoaringBitmap {
        self.index.engine().query_not_in_system(tag)
    }

    /// Objects with `tag_a` but not `tag_b`
    pub fn query_difference(&self, tag_a: &str, tag_b: &str) -> RoaringBitmap {
        self.index.engine().query_difference(tag_a, tag_b)
    }

    /// Objects with exactly one of `tag_a` and `tag_b`
    pub fn query_xor(&self, tag_a: &str, tag_b: &str) -> RoaringBitmap {
        self.index.engine().query_xor(tag_a, tag_b)
    }

    /// Intersection of every op's partial result
    pub fn complex_query(&self, ops: &[QueryOp]) -> Result<RoaringBitmap> {
        self.index.engine().complex_query(ops)
    }

    // ------------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------------

    /// Write every tag to the store now
    pub async fn replicate_all(&self) -> Result<usize> {
        self.ensure_open()?;
        self.replicator.replicate_all().await
    }

    /// Write one tag to the store now
    pub async fn replicate_tag(&self, tag: &str) -> Result<()> {
        self.ensure_open()?;
        self.replicator.replicate_tag(tag).await
    }

    /// Replace one tag with its stored copy
    pub async fn load_tag(&self, tag: &str) -> Result<()> {
        self.ensure_open()?;
        self.replicator.load_tag(tag).await
    }

    /// Load every stored tag into the index
    pub async fn recover_all(&self) -> Result<usize> {
        self.ensure_open()?;
        self.replicator.recover_all().await
    }

    /// Write a snapshot of the whole index to `path`
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        durability::save_snapshot(&self.index, path)
    }

    /// Merge the snapshot at `path` into the index
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        durability::load_snapshot(&self.index, path)
    }

    /// Start periodic snapshots if configured
    ///
    /// Does nothing when snapshots are disabled, no path is set, snapshots
    /// are already running or the system is shut down. Must be called from
    /// within a tokio runtime.
    pub fn start_snapshots(&self) {
        let snapshot = &self.config.snapshot;
        let Some(path) = snapshot.path.clone().filter(|_| snapshot.enabled) else {
            debug!("Periodic snapshots not configured");
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut task = self.snapshots.lock();
        if task.is_none() {
            *task = Some(SnapshotTask::spawn(
                self.index.clone(),
                path,
                snapshot.interval(),
            ));
        }
    }

    /// Whether periodic snapshots are running
    pub fn snapshots_running(&self) -> bool {
        self.snapshots.lock().is_some()
    }

    /// Stop background tasks, replicate once more and close the store
    ///
    /// The store is closed even when the final replication fails; that
    /// failure is then returned. Later durability calls fail with
    /// [`Error::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Shutdown("tag system already shut down".to_string()));
        }

        let snapshots = self.snapshots.lock().take();
        if let Some(mut task) = snapshots {
            task.stop().await;
        }

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }

        let replicated = self.replicator.replicate_all().await;
        if let Err(e) = &replicated {
            warn!(error = %e, "Final replication failed");
        }

        let closed = self.replicator.store().close().await;
        info!("Tag system shut down");

        replicated?;
        closed?;
        Ok(())
    }
}

impl Drop for TagSystem {
    fn drop(&mut self) {
        // The worker holds the index, so it has to be stopped explicitly
        if let Some(mut worker) = self.worker.get_mut().take() {
            worker.abort();
        }
        if let Some(mut task) = self.snapshots.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TagSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagSystem")
            .field("replicator", &self.replicator)
            .field("tags", &self.index.tag_count())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn system_with(config: Config) -> (TagSystem, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let system = TagSystem::with_store(config, store.clone()).await.unwrap();
        (system, store)
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = TagSystem::with_store(Config::default().key_prefix(""), store)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_connection_error() {
        let store = Arc::new(MemoryStore::new());
        store.close().await.unwrap();
        let err = TagSystem::with_store(Config::default(), store).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_shutdown_replicates_and_closes() {
        let (system, store) = system_with(Config::default().auto_replicate(false)).await;
        system.batch_add_tags(1, &["vip", "male"]);

        system.shutdown().await.unwrap();
        assert!(store.is_closed());
        assert_eq!(store.keys(), vec!["tags:male", "tags:vip"]);

        assert!(matches!(system.replicate_all().await, Err(Error::Shutdown(_))));
        assert!(matches!(system.shutdown().await, Err(Error::Shutdown(_))));
        // In-memory reads still work
        assert!(system.has_tag(1, "vip"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_store_when_replication_fails() {
        let (system, store) = system_with(Config::default().auto_replicate(false)).await;
        system.add_tag(1, "bad");
        store.fail_key("tags:bad");

        let err = system.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Batch(_)));
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_start_snapshots_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::default().snapshot(dir.path().join("s.json"), Duration::from_secs(60));
        let (system, _) = system_with(config).await;

        system.start_snapshots();
        system.start_snapshots();
        assert!(system.snapshots_running());

        system.shutdown().await.unwrap();
        assert!(!system.snapshots_running());
    }

    #[tokio::test]
    async fn test_start_snapshots_without_config_is_noop() {
        let (system, _) = system_with(Config::default()).await;
        system.start_snapshots();
        assert!(!system.snapshots_running());
    }
}
