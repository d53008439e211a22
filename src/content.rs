//! Writes chain results back into `my_contents`.

use anyhow::Error;
use async_trait::async_trait;

use crate::{ChainItem, ContentRecord, Credentials, PublishStatus};

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Upserts records keyed by (parent_media_id, thread_sequence). Records
    /// without a parent (single posts) are always inserted.
    async fn save_chain(&self, records: &[ContentRecord]) -> Result<(), Error>;

    /// Marks a chain item posted and stores its external id.
    async fn mark_posted(
        &self,
        parent_media_id: &str,
        thread_sequence: i32,
        media_id: &str,
    ) -> Result<(), Error>;

    async fn mark_failed(&self, parent_media_id: &str, thread_sequence: i32) -> Result<(), Error>;
}

/// Builds the record of a published, failed or scheduled chain item.
pub fn chain_record(
    item: &ChainItem,
    credentials: &Credentials,
    parent_media_id: Option<&str>,
    media_id: Option<&str>,
    publish_status: PublishStatus,
) -> ContentRecord {
    ContentRecord {
        user_id: credentials.user_id.clone(),
        social_id: credentials.social_id.clone(),
        content: item.content.clone(),
        media_urls: item.media_urls.clone(),
        media_type: item.media_type,
        publish_status,
        media_id: media_id.map(str::to_string),
        parent_media_id: parent_media_id.map(str::to_string),
        thread_sequence: item.sequence,
        is_thread_chain: parent_media_id.is_some(),
    }
}

/// Placeholder id stored for a reply that could not be published.
pub fn failed_placeholder(index: usize) -> String {
    format!("failed_{}", index)
}
