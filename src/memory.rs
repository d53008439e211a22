//! In-process store with the same semantics as the Postgres one. Used by
//! tests and local runs without a database.

use anyhow::{anyhow, bail, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use uuid::Uuid;

use crate::content::ContentStore;
use crate::queue::QueueStore;
use crate::{ContentRecord, NewQueueEntry, PublishStatus, QueueEntry, QueueStatus};

#[derive(Default)]
pub struct MemoryStore {
    queue: Mutex<Vec<QueueEntry>>,
    contents: Mutex<Vec<ContentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every queue entry in insertion order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.queue.lock().map(|q| q.clone()).unwrap_or_default()
    }

    pub fn records(&self) -> Vec<ContentRecord> {
        self.contents.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn record(&self, parent_media_id: &str, thread_sequence: i32) -> Option<ContentRecord> {
        self.records().into_iter().find(|r| {
            r.parent_media_id.as_deref() == Some(parent_media_id)
                && r.thread_sequence == thread_sequence
        })
    }

    /// Rewrites `processed_at`, for exercising retention sweeps.
    pub fn set_processed_at(&self, queue_id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
        self.with_entry(queue_id, |entry| {
            entry.processed_at = Some(at);
            Ok(())
        })
    }

    fn with_entry<T>(
        &self,
        queue_id: Uuid,
        f: impl FnOnce(&mut QueueEntry) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut queue = self.queue.lock().map_err(|_| anyhow!("queue lock poisoned"))?;
        let entry = queue
            .iter_mut()
            .find(|entry| entry.queue_id == queue_id)
            .ok_or_else(|| anyhow!("queue entry {} not found", queue_id))?;
        f(entry)
    }

    fn update_record(
        &self,
        parent_media_id: &str,
        thread_sequence: i32,
        f: impl Fn(&mut ContentRecord),
    ) -> Result<(), Error> {
        let mut contents = self
            .contents
            .lock()
            .map_err(|_| anyhow!("contents lock poisoned"))?;
        contents
            .iter_mut()
            .filter(|r| {
                r.parent_media_id.as_deref() == Some(parent_media_id)
                    && r.thread_sequence == thread_sequence
            })
            .for_each(f);
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_entries(&self, entries: &[NewQueueEntry]) -> Result<Vec<Uuid>, Error> {
        let mut queue = self.queue.lock().map_err(|_| anyhow!("queue lock poisoned"))?;

        for new in entries {
            if queue.iter().any(|e| {
                e.parent_media_id == new.parent_media_id
                    && e.thread_sequence == new.item.sequence
            }) {
                bail!(
                    "duplicate queue entry {}#{}",
                    new.parent_media_id,
                    new.item.sequence
                );
            }
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(entries.len());
        for new in entries {
            let queue_id = Uuid::new_v4();
            queue.push(QueueEntry {
                queue_id,
                parent_media_id: new.parent_media_id.clone(),
                thread_sequence: new.item.sequence,
                content: new.item.content.clone(),
                media_urls: new.item.media_urls.clone(),
                media_type: new.item.media_type,
                social_id: new.credentials.social_id.clone(),
                access_token: new.credentials.access_token.clone(),
                user_id: new.credentials.user_id.clone(),
                reply_to_id: new.reply_to_id.clone(),
                status: QueueStatus::Pending,
                created_at: now,
                processed_at: None,
                retry_count: 0,
                max_retries: new.max_retries,
                error: None,
            });
            ids.push(queue_id);
        }
        Ok(ids)
    }

    async fn claim_pending(&self, limit: i64) -> Result<Vec<QueueEntry>, Error> {
        let mut queue = self.queue.lock().map_err(|_| anyhow!("queue lock poisoned"))?;
        let limit = usize::try_from(limit).unwrap_or(0);

        // Insertion order doubles as creation order.
        Ok(queue
            .iter_mut()
            .filter(|entry| entry.status == QueueStatus::Pending)
            .take(limit)
            .map(|entry| {
                entry.status = QueueStatus::Processing;
                entry.clone()
            })
            .collect())
    }

    async fn complete(&self, queue_id: Uuid) -> Result<(), Error> {
        self.with_entry(queue_id, |entry| {
            if entry.status == QueueStatus::Processing {
                entry.status = QueueStatus::Completed;
                entry.processed_at = Some(Utc::now());
                entry.error = None;
            }
            Ok(())
        })
    }

    async fn requeue(&self, queue_id: Uuid, error: &str) -> Result<(), Error> {
        self.with_entry(queue_id, |entry| {
            if entry.status != QueueStatus::Processing || entry.retry_count >= entry.max_retries {
                bail!("queue entry {} cannot be requeued", queue_id);
            }
            entry.status = QueueStatus::Pending;
            entry.retry_count += 1;
            entry.error = Some(error.to_string());
            Ok(())
        })
    }

    async fn fail(&self, queue_id: Uuid, error: &str) -> Result<(), Error> {
        self.with_entry(queue_id, |entry| {
            if entry.status == QueueStatus::Processing {
                entry.status = QueueStatus::Failed;
                entry.processed_at = Some(Utc::now());
                entry.error = Some(error.to_string());
            }
            Ok(())
        })
    }

    async fn has_pending(&self) -> Result<bool, Error> {
        let queue = self.queue.lock().map_err(|_| anyhow!("queue lock poisoned"))?;
        Ok(queue.iter().any(|entry| entry.status == QueueStatus::Pending))
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut queue = self.queue.lock().map_err(|_| anyhow!("queue lock poisoned"))?;
        let before = queue.len();
        queue.retain(|entry| {
            !(entry.status == QueueStatus::Completed
                && entry.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - queue.len()) as u64)
    }

    async fn reset_processing(&self) -> Result<u64, Error> {
        let mut queue = self.queue.lock().map_err(|_| anyhow!("queue lock poisoned"))?;
        let mut reset = 0;
        for entry in queue
            .iter_mut()
            .filter(|entry| entry.status == QueueStatus::Processing)
        {
            entry.status = QueueStatus::Pending;
            reset += 1;
        }
        Ok(reset)
    }

    async fn entries_for_chain(&self, parent_media_id: &str) -> Result<Vec<QueueEntry>, Error> {
        let mut entries: Vec<QueueEntry> = self
            .entries()
            .into_iter()
            .filter(|entry| entry.parent_media_id == parent_media_id)
            .collect();
        entries.sort_by_key(|entry| entry.thread_sequence);
        Ok(entries)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn save_chain(&self, records: &[ContentRecord]) -> Result<(), Error> {
        let mut contents = self
            .contents
            .lock()
            .map_err(|_| anyhow!("contents lock poisoned"))?;

        for record in records {
            let existing = record.parent_media_id.as_ref().and_then(|parent| {
                contents.iter_mut().find(|r| {
                    r.parent_media_id.as_ref() == Some(parent)
                        && r.thread_sequence == record.thread_sequence
                })
            });
            match existing {
                Some(existing) => *existing = record.clone(),
                None => contents.push(record.clone()),
            }
        }
        Ok(())
    }

    async fn mark_posted(
        &self,
        parent_media_id: &str,
        thread_sequence: i32,
        media_id: &str,
    ) -> Result<(), Error> {
        self.update_record(parent_media_id, thread_sequence, |record| {
            record.publish_status = PublishStatus::Posted;
            record.media_id = Some(media_id.to_string());
        })
    }

    async fn mark_failed(&self, parent_media_id: &str, thread_sequence: i32) -> Result<(), Error> {
        self.update_record(parent_media_id, thread_sequence, |record| {
            record.publish_status = PublishStatus::Failed;
        })
    }
}
