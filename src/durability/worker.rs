//! Debounced background replication
//!
//! The worker wakes once per interval. On each wake it drains at most one
//! trigger from the queue:
//!
//! - a trigger was drained: remember the time and do nothing else this tick
//! - the queue was empty and a trigger was seen at least one interval ago:
//!   run a full replication pass and forget the trigger
//!
//! A burst of mutations therefore converges to a single full pass roughly one
//! to two intervals after the burst ends. Deletions of emptied tags arrive on
//! their own queue and are applied as they come.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::replication::Replicator;
use crate::index::ChangeReceiver;

/// Handle to the background replication task
#[derive(Debug)]
pub struct ReplicationWorker {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl ReplicationWorker {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn(replicator: Arc<Replicator>, receiver: ChangeReceiver, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run(replicator, receiver, interval, shutdown.clone()));

        info!(interval_ms = interval.as_millis() as u64, "Replication worker started");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the worker after it applies pending deletions
    ///
    /// Pending triggers are discarded; callers wanting a final pass run one
    /// themselves.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(e) = handle.await {
            warn!(error = %e, "Replication worker ended abnormally");
        }
    }

    /// Cancel the worker without waiting
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether the worker task is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

async fn run(
    replicator: Arc<Replicator>,
    mut receiver: ChangeReceiver,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_trigger: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            Some(tag) = receiver.deletions.recv() => {
                delete_replica(&replicator, &tag).await;
            }

            _ = ticker.tick() => {
                let now = Instant::now();
                match receiver.triggers.try_recv() {
                    Ok(()) => last_trigger = Some(now),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                        let due = last_trigger
                            .is_some_and(|at| now.duration_since(at) >= interval);
                        if due {
                            last_trigger = None;
                            replicate(&replicator).await;
                        }
                    }
                }
            }
        }
    }

    while let Ok(tag) = receiver.deletions.try_recv() {
        delete_replica(&replicator, &tag).await;
    }
    info!("Replication worker stopped");
}

async fn replicate(replicator: &Replicator) {
    match replicator.replicate_all().await {
        Ok(count) => debug!(tags = count, "Background replication complete"),
        Err(e) => warn!(error = %e, "Background replication failed"),
    }
}

async fn delete_replica(replicator: &Replicator, tag: &str) {
    match replicator.delete_emptied_tag(tag).await {
        Ok(true) => debug!(tag = %tag, "Deleted emptied tag from store"),
        Ok(false) => debug!(tag = %tag, "Tag re-created before its replica was deleted, keeping it"),
        Err(e) => warn!(tag = %tag, error = %e, "Failed to delete emptied tag from store"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ChangeNotifier, TagIndex};
    use crate::store::MemoryStore;
    use crate::types::TagState;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn setup(auto_replicate: bool) -> (Arc<TagIndex>, Arc<MemoryStore>, ReplicationWorker) {
        let (notifier, receiver) = ChangeNotifier::channel(100, auto_replicate);
        let index = Arc::new(TagIndex::with_notifier(notifier));
        let store = Arc::new(MemoryStore::new());
        let replicator = Arc::new(Replicator::new(index.clone(), store.clone(), "tags:"));
        let worker = ReplicationWorker::spawn(replicator, receiver, INTERVAL);
        (index, store, worker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_converges_to_one_pass() {
        let (index, store, mut worker) = setup(true);
        for id in 0..50 {
            index.add_tag(id, "vip");
        }

        // Nothing is written while triggers are still being drained
        tokio::time::sleep(INTERVAL / 2).await;
        assert_eq!(store.write_count(), 0);

        tokio::time::sleep(INTERVAL * 60).await;
        assert_eq!(store.write_count(), 1);
        assert_eq!(index.tag_state("vip"), TagState::Clean);

        worker.stop().await;
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_replication_when_disabled() {
        let (index, store, mut worker) = setup(false);
        index.add_tag(1, "vip");

        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(store.write_count(), 0);
        assert_eq!(index.tag_state("vip"), TagState::Dirty);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_emptied_tag_is_deleted() {
        let (index, store, mut worker) = setup(false);
        store.insert_raw("tags:solo", vec![1]);
        index.add_tag(1, "solo");
        index.remove_tag(1, "solo");

        tokio::time::sleep(INTERVAL).await;
        assert!(store.get_raw("tags:solo").is_none());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_failed_delete_is_not_fatal() {
        let (index, store, mut worker) = setup(false);
        store.fail_key("tags:solo");
        index.add_tag(1, "solo");
        index.remove_tag(1, "solo");

        worker.stop().await;
        assert_eq!(store.delete_count(), 0);
        assert_eq!(index.tag_state("solo"), TagState::Absent);
    }
}
