use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use crate::config::Pacing;
use crate::platform::{ContainerRequest, ThreadsApi};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::{ChainItem, Credentials, MediaType, PublishError};

/// Makes one post (or reply) appear on the platform: create a container,
/// then publish it with bounded retries.
#[derive(Clone)]
pub struct Publisher {
    api: Arc<dyn ThreadsApi>,
    pacing: Pacing,
}

impl Publisher {
    pub fn new(api: Arc<dyn ThreadsApi>, pacing: Pacing) -> Self {
        Self { api, pacing }
    }

    #[instrument(
        skip(self, item, credentials),
        fields(sequence = item.sequence, media_type = item.media_type.as_str())
    )]
    pub async fn publish(
        &self,
        item: &ChainItem,
        credentials: &Credentials,
        reply_to_id: Option<&str>,
    ) -> Result<String, PublishError> {
        item.validate()?;

        let creation_id = self.create_container(item, credentials, reply_to_id).await?;
        let post_id = self
            .publish_container(credentials, &creation_id, item.has_media())
            .await?;

        info!(post_id = %post_id, reply_to = ?reply_to_id, "Published");
        Ok(post_id)
    }

    async fn create_container(
        &self,
        item: &ChainItem,
        credentials: &Credentials,
        reply_to_id: Option<&str>,
    ) -> Result<String, PublishError> {
        let reply_to_id = reply_to_id.map(str::to_string);
        let text = item.content.clone();

        let request = match item.media_type {
            MediaType::Text => ContainerRequest::Text { text, reply_to_id },
            MediaType::Image => ContainerRequest::Image {
                text,
                image_url: item.media_urls[0].clone(),
                reply_to_id,
            },
            MediaType::Video => ContainerRequest::Video {
                text,
                video_url: item.media_urls[0].clone(),
                reply_to_id,
            },
            MediaType::Carousel => {
                let children = self.create_carousel_items(item, credentials).await?;
                ContainerRequest::Carousel {
                    text,
                    children,
                    reply_to_id,
                }
            }
        };

        self.api.create_container(credentials, &request).await
    }

    async fn create_carousel_items(
        &self,
        item: &ChainItem,
        credentials: &Credentials,
    ) -> Result<Vec<String>, PublishError> {
        let mut children = Vec::with_capacity(item.media_urls.len());

        for (index, media_url) in item.media_urls.iter().enumerate() {
            if index > 0 {
                sleep(self.pacing.carousel_item_gap).await;
            }
            let request = ContainerRequest::CarouselItem {
                media_url: media_url.clone(),
            };
            let child = self.api.create_container(credentials, &request).await?;
            debug!(index, child = %child, "Carousel item created");
            children.push(child);
        }

        Ok(children)
    }

    async fn publish_container(
        &self,
        credentials: &Credentials,
        creation_id: &str,
        has_media: bool,
    ) -> Result<String, PublishError> {
        let delay = if has_media {
            self.pacing.publish_retry_media
        } else {
            self.pacing.publish_retry_text
        };
        let policy = RetryPolicy::fixed(self.pacing.publish_attempts, delay);

        let api = self.api.as_ref();
        retry_with_backoff(policy, PublishError::is_retryable, move |attempt| {
            debug!(attempt, creation_id, "Publishing container");
            api.publish_container(credentials, creation_id)
        })
        .await
        .map_err(|err| match err {
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { attempts, last } => PublishError::PublishExhausted {
                attempts,
                last: last.to_string(),
            },
        })
    }
}
