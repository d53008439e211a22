use crate::config::Pacing;
use crate::content::ContentStore;
use crate::publisher::Publisher;
use crate::queue::{ProcessorSignal, QueueStore};
use crate::retry::{retry_with_backoff, Backoff, RetryDecision, RetryPolicy};
use crate::{PublishError, QueueEntry};
use anyhow::Error;
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

const STATUS_WRITE_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff: Backoff::Linear {
        base: Duration::from_secs(1),
        step: Duration::from_secs(1),
    },
};

/// Result of one `process_queue` pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Another pass was already running in this process.
    pub skipped: bool,
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Entries whose new status could not be written; they stay `processing`
    /// until the next `recover_stale`.
    pub stranded: usize,
    pub pending_remaining: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Completed,
    Requeued,
    Failed,
    Stranded,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the reply queue: claims pending entries, publishes them, and
/// records the outcome on both the entry and its content record.
pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    content: Arc<dyn ContentStore>,
    publisher: Publisher,
    pacing: Pacing,
    busy: AtomicBool,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        content: Arc<dyn ContentStore>,
        publisher: Publisher,
        pacing: Pacing,
    ) -> Self {
        Self {
            store,
            content,
            publisher,
            pacing,
            busy: AtomicBool::new(false),
        }
    }

    #[instrument(name = "queue.process", skip(self))]
    pub async fn process_queue(&self) -> Result<BatchReport, Error> {
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            debug!("Queue pass already running");
            return Ok(BatchReport {
                skipped: true,
                ..BatchReport::default()
            });
        };

        let claimed = self.store.claim_pending(self.pacing.batch_size).await?;
        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };

        for (index, entry) in claimed.iter().enumerate() {
            if index > 0 {
                sleep(self.pacing.queue_item_gap).await;
            }
            match self.process_entry(entry).await {
                EntryOutcome::Completed => report.completed += 1,
                EntryOutcome::Requeued => report.requeued += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::Stranded => report.stranded += 1,
            }
        }

        report.pending_remaining = self.store.has_pending().await?;
        info!(
            claimed = report.claimed,
            completed = report.completed,
            requeued = report.requeued,
            failed = report.failed,
            stranded = report.stranded,
            pending_remaining = report.pending_remaining,
            "Queue pass finished"
        );
        Ok(report)
    }

    #[instrument(
        skip(self, entry),
        fields(
            queue_id = %entry.queue_id,
            parent_media_id = %entry.parent_media_id,
            sequence = entry.thread_sequence,
            retry_count = entry.retry_count
        )
    )]
    async fn process_entry(&self, entry: &QueueEntry) -> EntryOutcome {
        let result = self
            .publisher
            .publish(
                &entry.item(),
                &entry.credentials(),
                Some(entry.reply_to_id.as_str()),
            )
            .await;

        match result {
            Ok(media_id) => {
                let store = self.store.as_ref();
                let queue_id = entry.queue_id;
                if !write_status("completed", move |_| store.complete(queue_id)).await {
                    return EntryOutcome::Stranded;
                }
                if let Err(err) = self
                    .content
                    .mark_posted(&entry.parent_media_id, entry.thread_sequence, &media_id)
                    .await
                {
                    error!(message = "Failed to update content record", error = ?err);
                }
                EntryOutcome::Completed
            }
            Err(err) => self.handle_failure(entry, err).await,
        }
    }

    async fn handle_failure(&self, entry: &QueueEntry, err: PublishError) -> EntryOutcome {
        let message = err.to_string();
        let decision = match err {
            PublishError::InvalidItem(_) => RetryDecision::DeadLetter,
            _ => RetryDecision::for_failure(entry.retry_count, entry.max_retries),
        };

        let store = self.store.as_ref();
        let queue_id = entry.queue_id;
        let message = message.as_str();

        match decision {
            RetryDecision::Requeue => {
                warn!(error = %message, "Publish failed, entry requeued");
                if !write_status("pending", move |_| store.requeue(queue_id, message)).await {
                    return EntryOutcome::Stranded;
                }
                EntryOutcome::Requeued
            }
            RetryDecision::DeadLetter => {
                error!(error = %message, "Publish failed permanently");
                if !write_status("failed", move |_| store.fail(queue_id, message)).await {
                    return EntryOutcome::Stranded;
                }
                if let Err(err) = self
                    .content
                    .mark_failed(&entry.parent_media_id, entry.thread_sequence)
                    .await
                {
                    error!(message = "Failed to update content record", error = ?err);
                }
                EntryOutcome::Failed
            }
        }
    }

    /// Deletes entries that completed more than the retention window ago.
    #[instrument(name = "queue.cleanup", skip(self))]
    pub async fn cleanup_queue(&self) -> Result<u64, Error> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.pacing.completed_retention)?;
        let deleted = self.store.delete_completed_before(cutoff).await?;
        info!(deleted, "Queue cleanup finished");
        Ok(deleted)
    }

    /// Returns entries orphaned in `processing` by a previous run to pending.
    pub async fn recover_stale(&self) -> Result<u64, Error> {
        let reset = self.store.reset_processing().await?;
        if reset > 0 {
            warn!(reset, "Requeued entries left in processing");
        }
        Ok(reset)
    }
}

/// Writes a queue status change, retrying briefly so a short database blip
/// does not leave the entry in `processing`.
async fn write_status<F, Fut>(status: &'static str, op: F) -> bool
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    match retry_with_backoff(STATUS_WRITE_POLICY, |_: &Error| true, op).await {
        Ok(()) => true,
        Err(err) => {
            error!(
                message = "Failed to record entry status",
                status,
                error = ?err.into_inner()
            );
            false
        }
    }
}

/// Worker loop: runs a pass whenever the queue is signalled or the poll
/// interval elapses, re-arms while pending work remains, and sweeps completed
/// entries on the cleanup interval.
pub async fn run(
    cancel_token: CancellationToken,
    processor: Arc<QueueProcessor>,
    signal: ProcessorSignal,
    poll_interval: Duration,
    cleanup_interval: Duration,
) {
    if let Err(err) = processor.recover_stale().await {
        error!(message = "Failed to recover stale entries", error = ?err);
    }

    let rearm_delay = processor.pacing.rearm_delay;
    let mut poll = interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup = interval(cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'outer: loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            _ = signal.wait() => {
                debug!("Worker signalled");
            },
            _ = poll.tick() => {
                trace!("Worker poll tick");
            },
            _ = cleanup.tick() => {
                if let Err(err) = processor.cleanup_queue().await {
                    error!(message = "Queue cleanup failed", error = ?err);
                }
                continue;
            },
        }

        loop {
            match processor.process_queue().await {
                Ok(report) if report.pending_remaining => {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            debug!("Worker Cancelled");
                            break 'outer;
                        },
                        _ = sleep(rearm_delay) => {},
                    }
                }
                Ok(_) => break,
                Err(err) => {
                    error!(message = "Queue pass failed", error = ?err);
                    break;
                }
            }
        }
    }

    info!("Worker stopped.");
}
