use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod api;
pub mod chain;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod memory;
pub mod platform;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod server;
pub mod telemetry;
pub mod worker;

pub use error::{ChainError, EnqueueError, PublishError};

/// Kind of media a post carries. Must agree with the number of media urls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "media_type_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    Text,
    Image,
    Video,
    Carousel,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Text => "TEXT",
            MediaType::Image => "IMAGE",
            MediaType::Video => "VIDEO",
            MediaType::Carousel => "CAROUSEL",
        }
    }
}

/// One post of a thread chain. Sequence 0 is the root post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainItem {
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub media_type: MediaType,
    pub sequence: i32,
}

impl ChainItem {
    pub fn text(sequence: i32, content: impl Into<String>) -> Self {
        ChainItem {
            content: content.into(),
            media_urls: vec![],
            media_type: MediaType::Text,
            sequence,
        }
    }

    pub fn with_media(
        sequence: i32,
        content: impl Into<String>,
        media_type: MediaType,
        media_urls: Vec<String>,
    ) -> Self {
        ChainItem {
            content: content.into(),
            media_urls,
            media_type,
            sequence,
        }
    }

    pub fn has_media(&self) -> bool {
        !self.media_urls.is_empty()
    }

    /// Checks the caller contract before anything reaches the network.
    pub fn validate(&self) -> Result<(), PublishError> {
        if self.content.trim().is_empty() {
            return Err(PublishError::InvalidItem(format!(
                "item {} has empty content",
                self.sequence
            )));
        }

        let urls = self.media_urls.len();
        let consistent = match self.media_type {
            MediaType::Text => urls == 0,
            MediaType::Image | MediaType::Video => urls == 1,
            MediaType::Carousel => urls >= 2,
        };
        if !consistent {
            return Err(PublishError::InvalidItem(format!(
                "item {} is {} but carries {} media url(s)",
                self.sequence,
                self.media_type.as_str(),
                urls
            )));
        }

        if self.media_urls.iter().any(|url| url.trim().is_empty()) {
            return Err(PublishError::InvalidItem(format!(
                "item {} has a blank media url",
                self.sequence
            )));
        }

        Ok(())
    }
}

/// Account credentials captured when a chain is submitted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub social_id: String,
    pub access_token: String,
    pub user_id: String,
}

// Keep tokens out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("social_id", &self.social_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Who is asking for a chain to be published.
///
/// Interactive callers have a live session and wait for every reply to be
/// published. Automated callers (scheduled publishing) hand replies to the
/// persistent queue and return as soon as the root post is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerContext {
    Interactive(Credentials),
    Automated(Credentials),
}

impl CallerContext {
    pub fn credentials(&self) -> &Credentials {
        match self {
            CallerContext::Interactive(credentials) | CallerContext::Automated(credentials) => {
                credentials
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_status_enum", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A reply waiting in (or done with) the persistent queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntry {
    pub queue_id: Uuid,
    pub parent_media_id: String,
    pub thread_sequence: i32,
    pub content: String,
    pub media_urls: Vec<String>,
    pub media_type: MediaType,
    pub social_id: String,
    pub access_token: String,
    pub user_id: String,
    pub reply_to_id: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error: Option<String>,
}

impl QueueEntry {
    pub fn item(&self) -> ChainItem {
        ChainItem {
            content: self.content.clone(),
            media_urls: self.media_urls.clone(),
            media_type: self.media_type,
            sequence: self.thread_sequence,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            social_id: self.social_id.clone(),
            access_token: self.access_token.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Row to be written by `QueueStore::insert_entries`.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub parent_media_id: String,
    pub item: ChainItem,
    pub credentials: Credentials,
    pub reply_to_id: String,
    pub max_retries: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "publish_status_enum", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Draft,
    Scheduled,
    Posted,
    Failed,
    ReadyToPublish,
}

/// One row of `my_contents`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ContentRecord {
    pub user_id: String,
    pub social_id: String,
    pub content: String,
    pub media_urls: Vec<String>,
    pub media_type: MediaType,
    pub publish_status: PublishStatus,
    pub media_id: Option<String>,
    pub parent_media_id: Option<String>,
    pub thread_sequence: i32,
    pub is_thread_chain: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_item_with_urls_is_rejected() {
        let item = ChainItem::with_media(
            0,
            "hello",
            MediaType::Text,
            vec!["https://cdn.example.com/a.png".into()],
        );
        assert!(matches!(item.validate(), Err(PublishError::InvalidItem(_))));
    }

    #[test]
    fn media_counts_follow_media_type() {
        let one = vec!["https://cdn.example.com/a.png".to_string()];
        let two = vec![
            "https://cdn.example.com/a.png".to_string(),
            "https://cdn.example.com/b.png".to_string(),
        ];

        assert!(ChainItem::with_media(0, "x", MediaType::Image, one.clone())
            .validate()
            .is_ok());
        assert!(ChainItem::with_media(0, "x", MediaType::Video, one.clone())
            .validate()
            .is_ok());
        assert!(ChainItem::with_media(0, "x", MediaType::Image, two.clone())
            .validate()
            .is_err());
        assert!(ChainItem::with_media(0, "x", MediaType::Carousel, one)
            .validate()
            .is_err());
        assert!(ChainItem::with_media(0, "x", MediaType::Carousel, two)
            .validate()
            .is_ok());
    }

    #[test]
    fn blank_content_is_rejected() {
        assert!(ChainItem::text(1, "   ").validate().is_err());
    }

    #[test]
    fn credentials_debug_hides_token() {
        let credentials = Credentials {
            social_id: "1789".into(),
            access_token: "secret-token".into(),
            user_id: "u-1".into(),
        };
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("1789"));
    }

    #[test]
    fn chain_item_uses_camel_case_json() {
        let item: ChainItem = serde_json::from_value(serde_json::json!({
            "content": "hi",
            "mediaUrls": ["https://cdn.example.com/v.mp4"],
            "mediaType": "VIDEO",
            "sequence": 2
        }))
        .unwrap();
        assert_eq!(item.media_type, MediaType::Video);
        assert_eq!(item.sequence, 2);
    }
}
