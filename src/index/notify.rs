//! Change notification from the index to the replication worker
//!
//! Mutators are synchronous and must never block or fail, so notifications are
//! posted with non-blocking sends. Replication triggers go through a bounded
//! queue and are dropped when it is full: a full queue already means a save is
//! pending. Deletions of emptied tags use an unbounded queue so none are lost.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Receiving half handed to the replication worker
#[derive(Debug)]
pub struct ChangeReceiver {
    /// Coalescing replication triggers
    pub triggers: mpsc::Receiver<()>,
    /// Names of tags whose store replica must be deleted
    pub deletions: mpsc::UnboundedReceiver<String>,
}

/// Sending half held by the index
#[derive(Debug, Clone, Default)]
pub struct ChangeNotifier {
    triggers: Option<mpsc::Sender<()>>,
    deletions: Option<mpsc::UnboundedSender<String>>,
}

impl ChangeNotifier {
    /// Notifier that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a notifier/receiver pair
    ///
    /// With `auto_replicate` off, triggers are never posted but deletions
    /// still are.
    pub fn channel(capacity: usize, auto_replicate: bool) -> (Self, ChangeReceiver) {
        let (trigger_tx, trigger_rx) = mpsc::channel(capacity.max(1));
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();

        let notifier = Self {
            triggers: auto_replicate.then_some(trigger_tx),
            deletions: Some(delete_tx),
        };

        (
            notifier,
            ChangeReceiver {
                triggers: trigger_rx,
                deletions: delete_rx,
            },
        )
    }

    /// Signal that the index changed
    pub fn mark_dirty(&self) {
        if let Some(tx) = &self.triggers {
            match tx.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(())) => trace!("Replication trigger queue full, coalescing"),
                Err(TrySendError::Closed(())) => trace!("Replication worker gone, trigger dropped"),
            }
        }
    }

    /// Schedule removal of an emptied tag's store replica
    pub fn tag_removed(&self, tag: &str) {
        if let Some(tx) = &self.deletions {
            if tx.send(tag.to_string()).is_err() {
                trace!(tag = %tag, "Replication worker gone, deletion dropped");
            }
        }
    }
}
