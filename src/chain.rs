//! Publishes an ordered list of posts as one thread.

use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Pacing;
use crate::content::{chain_record, failed_placeholder, ContentStore};
use crate::publisher::Publisher;
use crate::queue::ThreadQueue;
use crate::{CallerContext, ChainError, ChainItem, ContentRecord, Credentials, PublishStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    /// External id of the root post.
    pub parent_thread_id: String,
    /// Ids of published items in sequence order; failed replies carry a
    /// `failed_<index>` placeholder. Queued replies are not listed.
    pub thread_ids: Vec<String>,
    /// Number of replies handed to the queue.
    pub queued: usize,
}

#[derive(Clone)]
pub struct ChainCoordinator {
    publisher: Publisher,
    queue: ThreadQueue,
    content: Arc<dyn ContentStore>,
    pacing: Pacing,
}

impl ChainCoordinator {
    pub fn new(
        publisher: Publisher,
        queue: ThreadQueue,
        content: Arc<dyn ContentStore>,
        pacing: Pacing,
    ) -> Self {
        Self {
            publisher,
            queue,
            content,
            pacing,
        }
    }

    /// Publishes the root post, then either publishes the replies in place
    /// (interactive) or queues them (automated). Succeeds once the root is
    /// live; individual reply failures only show up on their records.
    #[instrument(skip(self, items, context), fields(items = items.len()))]
    pub async fn post_chain(
        &self,
        items: Vec<ChainItem>,
        context: CallerContext,
    ) -> Result<ChainOutcome, ChainError> {
        let items = normalize(items)?;
        let credentials = context.credentials();

        if items.len() == 1 {
            return self.post_single(&items[0], credentials).await;
        }

        let root = &items[0];
        let parent_thread_id = self
            .publisher
            .publish(root, credentials, None)
            .await
            .map_err(ChainError::RootPublish)?;
        info!(parent_thread_id = %parent_thread_id, "Root post published");

        match &context {
            CallerContext::Automated(_) => {
                self.queue_replies(&items, credentials, parent_thread_id).await
            }
            CallerContext::Interactive(_) => {
                self.publish_replies(&items, credentials, parent_thread_id).await
            }
        }
    }

    async fn post_single(
        &self,
        item: &ChainItem,
        credentials: &Credentials,
    ) -> Result<ChainOutcome, ChainError> {
        let media_id = self
            .publisher
            .publish(item, credentials, None)
            .await
            .map_err(ChainError::RootPublish)?;

        let record = chain_record(
            item,
            credentials,
            None,
            Some(media_id.as_str()),
            PublishStatus::Posted,
        );
        self.content.save_chain(&[record]).await?;

        Ok(ChainOutcome {
            parent_thread_id: media_id.clone(),
            thread_ids: vec![media_id],
            queued: 0,
        })
    }

    async fn queue_replies(
        &self,
        items: &[ChainItem],
        credentials: &Credentials,
        parent_thread_id: String,
    ) -> Result<ChainOutcome, ChainError> {
        let parent = parent_thread_id.as_str();
        let records: Vec<ContentRecord> = items
            .iter()
            .map(|item| {
                let (media_id, status) = if item.sequence == 0 {
                    (Some(parent), PublishStatus::Posted)
                } else {
                    (None, PublishStatus::Scheduled)
                };
                chain_record(item, credentials, Some(parent), media_id, status)
            })
            .collect();

        // Records first, so the processor always finds a row to update.
        self.content.save_chain(&records).await?;

        let replies = &items[1..];
        let enqueued = self.queue.enqueue(parent, replies, credentials, parent).await;
        if let Err(source) = enqueued {
            error!(error = %source, "Enqueue failed, marking replies failed");
            for item in replies {
                if let Err(err) = self.content.mark_failed(parent, item.sequence).await {
                    error!(sequence = item.sequence, error = ?err, "Failed to update content record");
                }
            }
            return Err(ChainError::Enqueue {
                parent_thread_id,
                source,
            });
        }

        Ok(ChainOutcome {
            thread_ids: vec![parent_thread_id.clone()],
            parent_thread_id,
            queued: replies.len(),
        })
    }

    async fn publish_replies(
        &self,
        items: &[ChainItem],
        credentials: &Credentials,
        parent_thread_id: String,
    ) -> Result<ChainOutcome, ChainError> {
        let root = &items[0];
        let settle = if root.has_media() {
            self.pacing.root_settle_media
        } else {
            self.pacing.root_settle_text
        };
        debug!(settle_ms = settle.as_millis() as u64, "Waiting for root to settle");
        sleep(settle).await;

        let mut results = vec![(parent_thread_id.clone(), PublishStatus::Posted)];
        let mut reply_to = parent_thread_id.clone();

        for (index, item) in items.iter().enumerate().skip(1) {
            if index > 1 {
                sleep(self.pacing.reply_gap).await;
            }

            match self
                .publisher
                .publish(item, credentials, Some(reply_to.as_str()))
                .await
            {
                Ok(id) => {
                    // Only live posts become reply targets, so a failed reply
                    // leaves the thread attached to the last one that went out.
                    reply_to = id.clone();
                    results.push((id, PublishStatus::Posted));
                }
                Err(err) => {
                    warn!(index, error = %err, "Reply failed, continuing with the rest of the chain");
                    results.push((failed_placeholder(index), PublishStatus::Failed));
                }
            }
        }

        let parent = parent_thread_id.as_str();
        let records: Vec<ContentRecord> = items
            .iter()
            .zip(&results)
            .map(|(item, (id, status))| {
                chain_record(item, credentials, Some(parent), Some(id.as_str()), *status)
            })
            .collect();
        self.content.save_chain(&records).await?;

        Ok(ChainOutcome {
            parent_thread_id,
            thread_ids: results.into_iter().map(|(id, _)| id).collect(),
            queued: 0,
        })
    }
}

/// Orders items by sequence and checks the whole chain before anything is
/// published.
fn normalize(mut items: Vec<ChainItem>) -> Result<Vec<ChainItem>, ChainError> {
    if items.is_empty() {
        return Err(ChainError::Empty);
    }

    items.sort_by_key(|item| item.sequence);
    let contiguous = items
        .iter()
        .enumerate()
        .all(|(index, item)| item.sequence as i64 == index as i64);
    if !contiguous {
        return Err(ChainError::BadSequence {
            expected: items.len(),
            found: items.iter().map(|item| item.sequence).collect(),
        });
    }

    for item in &items {
        item.validate().map_err(ChainError::InvalidItem)?;
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediaType;

    #[test]
    fn normalize_sorts_by_sequence() {
        let items = normalize(vec![ChainItem::text(1, "b"), ChainItem::text(0, "a")]).unwrap();
        assert_eq!(items[0].content, "a");
        assert_eq!(items[1].content, "b");
    }

    #[test]
    fn normalize_rejects_gaps_and_duplicates() {
        assert!(matches!(
            normalize(vec![ChainItem::text(0, "a"), ChainItem::text(2, "c")]),
            Err(ChainError::BadSequence { .. })
        ));
        assert!(matches!(
            normalize(vec![ChainItem::text(0, "a"), ChainItem::text(0, "b")]),
            Err(ChainError::BadSequence { .. })
        ));
    }

    #[test]
    fn normalize_rejects_invalid_reply() {
        let bad = ChainItem::with_media(1, "b", MediaType::Carousel, vec!["x".into()]);
        let err = normalize(vec![ChainItem::text(0, "a"), bad]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn normalize_rejects_empty() {
        assert!(matches!(normalize(vec![]), Err(ChainError::Empty)));
    }
}
