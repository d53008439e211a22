//! Persistent hand-off of reply publications that cannot finish inside the
//! request that started them.

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{ChainItem, Credentials, EnqueueError, NewQueueEntry, QueueEntry};

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert_entries(&self, entries: &[NewQueueEntry]) -> Result<Vec<Uuid>, Error>;

    /// Moves up to `limit` of the oldest pending entries to `processing` and
    /// returns them oldest first. Safe against concurrent claimers.
    async fn claim_pending(&self, limit: i64) -> Result<Vec<QueueEntry>, Error>;

    async fn complete(&self, queue_id: Uuid) -> Result<(), Error>;

    /// Back to pending with `retry_count + 1`, keeping the error.
    async fn requeue(&self, queue_id: Uuid, error: &str) -> Result<(), Error>;

    /// Terminal failure.
    async fn fail(&self, queue_id: Uuid, error: &str) -> Result<(), Error>;

    async fn has_pending(&self) -> Result<bool, Error>;

    /// Deletes completed entries processed before `cutoff`.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;

    /// Returns entries stuck in `processing` to `pending`.
    async fn reset_processing(&self) -> Result<u64, Error>;

    async fn entries_for_chain(&self, parent_media_id: &str) -> Result<Vec<QueueEntry>, Error>;
}

/// Wakes the queue worker. Signals raised while the worker is busy collapse
/// into a single wake-up.
#[derive(Clone, Default)]
pub struct ProcessorSignal {
    notify: Arc<Notify>,
}

impl ProcessorSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[derive(Clone)]
pub struct ThreadQueue {
    store: Arc<dyn QueueStore>,
    signal: ProcessorSignal,
    max_retries: i32,
}

impl ThreadQueue {
    pub fn new(store: Arc<dyn QueueStore>, signal: ProcessorSignal, max_retries: i32) -> Self {
        Self {
            store,
            signal,
            max_retries,
        }
    }

    pub fn signal(&self) -> &ProcessorSignal {
        &self.signal
    }

    /// Queues every reply of a chain. Each entry replies to the chain's root
    /// post, so the replies end up flat under the root.
    #[instrument(skip(self, items, credentials), fields(count = items.len()))]
    pub async fn enqueue(
        &self,
        parent_media_id: &str,
        items: &[ChainItem],
        credentials: &Credentials,
        first_thread_id: &str,
    ) -> Result<Vec<Uuid>, EnqueueError> {
        if parent_media_id.trim().is_empty() || first_thread_id.trim().is_empty() {
            return Err(EnqueueError::MissingParent);
        }
        if items.is_empty() {
            return Err(EnqueueError::Empty);
        }
        if items.iter().any(|item| item.sequence == 0) {
            return Err(EnqueueError::RootItem);
        }

        let entries: Vec<NewQueueEntry> = items
            .iter()
            .map(|item| NewQueueEntry {
                parent_media_id: parent_media_id.to_string(),
                item: item.clone(),
                credentials: credentials.clone(),
                reply_to_id: first_thread_id.to_string(),
                max_retries: self.max_retries,
            })
            .collect();

        let ids = self.store.insert_entries(&entries).await?;
        info!(parent_media_id, queued = ids.len(), "Replies queued");

        debug!("Signalling queue processor");
        self.signal.raise();

        Ok(ids)
    }
}
