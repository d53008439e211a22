//! Client for the external posting platform (Threads Graph API).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{Credentials, PublishError};

pub const DEFAULT_API_BASE: &str = "https://graph.threads.net/v1.0";

const VIDEO_EXTENSIONS: [&str; 4] = [".mp4", ".mov", ".m4v", ".webm"];

/// Parameters of one container-creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRequest {
    Text {
        text: String,
        reply_to_id: Option<String>,
    },
    Image {
        text: String,
        image_url: String,
        reply_to_id: Option<String>,
    },
    Video {
        text: String,
        video_url: String,
        reply_to_id: Option<String>,
    },
    CarouselItem {
        media_url: String,
    },
    Carousel {
        text: String,
        children: Vec<String>,
        reply_to_id: Option<String>,
    },
}

impl ContainerRequest {
    /// Query parameters for `POST {base}/{social_id}/threads`, without the
    /// access token.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        let reply = match self {
            ContainerRequest::Text { text, reply_to_id } => {
                params.push(("media_type", "TEXT".to_string()));
                params.push(("text", text.clone()));
                reply_to_id
            }
            ContainerRequest::Image {
                text,
                image_url,
                reply_to_id,
            } => {
                params.push(("media_type", "IMAGE".to_string()));
                params.push(("text", text.clone()));
                params.push(("image_url", image_url.clone()));
                reply_to_id
            }
            ContainerRequest::Video {
                text,
                video_url,
                reply_to_id,
            } => {
                params.push(("media_type", "VIDEO".to_string()));
                params.push(("text", text.clone()));
                params.push(("video_url", video_url.clone()));
                reply_to_id
            }
            ContainerRequest::CarouselItem { media_url } => {
                if is_video_url(media_url) {
                    params.push(("media_type", "VIDEO".to_string()));
                    params.push(("video_url", media_url.clone()));
                } else {
                    params.push(("media_type", "IMAGE".to_string()));
                    params.push(("image_url", media_url.clone()));
                }
                params.push(("is_carousel_item", "true".to_string()));
                return params;
            }
            ContainerRequest::Carousel {
                text,
                children,
                reply_to_id,
            } => {
                params.push(("media_type", "CAROUSEL".to_string()));
                params.push(("text", text.clone()));
                params.push(("children", children.join(",")));
                reply_to_id
            }
        };

        if let Some(reply_to_id) = reply {
            params.push(("reply_to_id", reply_to_id.clone()));
        }
        params
    }
}

fn is_video_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// The two calls needed to make a post appear.
#[async_trait]
pub trait ThreadsApi: Send + Sync {
    /// Creates a media container and returns its creation id.
    async fn create_container(
        &self,
        credentials: &Credentials,
        request: &ContainerRequest,
    ) -> Result<String, PublishError>;

    /// Publishes a container and returns the external post id.
    async fn publish_container(
        &self,
        credentials: &Credentials,
        creation_id: &str,
    ) -> Result<String, PublishError>;
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: Option<String>,
}

fn parse_id(body: &str) -> Result<String, PublishError> {
    let parsed: IdResponse = serde_json::from_str(body)
        .map_err(|e| PublishError::MalformedResponse(format!("{} - body: {}", e, body)))?;

    match parsed.id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(PublishError::MalformedResponse(format!(
            "missing id - body: {}",
            body
        ))),
    }
}

#[derive(Clone)]
pub struct HttpThreadsApi {
    base_url: String,
    http: Client,
}

impl HttpThreadsApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }
}

#[async_trait]
impl ThreadsApi for HttpThreadsApi {
    #[instrument(skip_all, fields(social_id = %credentials.social_id))]
    async fn create_container(
        &self,
        credentials: &Credentials,
        request: &ContainerRequest,
    ) -> Result<String, PublishError> {
        let url = format!("{}/{}/threads", self.base_url, credentials.social_id);
        let mut params = request.query_params();
        params.push(("access_token", credentials.access_token.clone()));

        let resp = self
            .http
            .post(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| PublishError::ContainerCreationFailed(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PublishError::ContainerCreationFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(PublishError::ContainerCreationFailed(format!(
                "Status {}: {}",
                status, text
            )));
        }

        let creation_id = parse_id(&text)
            .map_err(|e| PublishError::ContainerCreationFailed(e.to_string()))?;
        debug!(creation_id = %creation_id, "Container created");
        Ok(creation_id)
    }

    #[instrument(skip_all, fields(social_id = %credentials.social_id, creation_id = %creation_id))]
    async fn publish_container(
        &self,
        credentials: &Credentials,
        creation_id: &str,
    ) -> Result<String, PublishError> {
        let url = format!("{}/{}/threads_publish", self.base_url, credentials.social_id);

        let resp = self
            .http
            .post(&url)
            .query(&[
                ("creation_id", creation_id),
                ("access_token", credentials.access_token.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(PublishError::PublishRejected {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_id(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn text_reply_carries_reply_to_id() {
        let params = ContainerRequest::Text {
            text: "second".into(),
            reply_to_id: Some("root-1".into()),
        }
        .query_params();

        assert_eq!(value(&params, "media_type"), Some("TEXT"));
        assert_eq!(value(&params, "text"), Some("second"));
        assert_eq!(value(&params, "reply_to_id"), Some("root-1"));
        assert_eq!(value(&params, "image_url"), None);
    }

    #[test]
    fn carousel_item_has_no_text_or_reply() {
        let params = ContainerRequest::CarouselItem {
            media_url: "https://cdn.example.com/a.jpg".into(),
        }
        .query_params();

        assert_eq!(value(&params, "media_type"), Some("IMAGE"));
        assert_eq!(value(&params, "is_carousel_item"), Some("true"));
        assert_eq!(value(&params, "text"), None);
        assert_eq!(value(&params, "reply_to_id"), None);
    }

    #[test]
    fn carousel_item_detects_video_urls() {
        let params = ContainerRequest::CarouselItem {
            media_url: "https://cdn.example.com/clip.MP4?sig=abc".into(),
        }
        .query_params();

        assert_eq!(value(&params, "media_type"), Some("VIDEO"));
        assert!(value(&params, "video_url").is_some());
    }

    #[test]
    fn carousel_parent_joins_children() {
        let params = ContainerRequest::Carousel {
            text: "look".into(),
            children: vec!["c1".into(), "c2".into(), "c3".into()],
            reply_to_id: None,
        }
        .query_params();

        assert_eq!(value(&params, "media_type"), Some("CAROUSEL"));
        assert_eq!(value(&params, "children"), Some("c1,c2,c3"));
        assert_eq!(value(&params, "reply_to_id"), None);
    }

    #[test]
    fn parse_id_rejects_empty_and_garbage() {
        assert_eq!(parse_id(r#"{"id":"123"}"#).unwrap(), "123");
        assert!(matches!(
            parse_id("{}"),
            Err(PublishError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_id(""),
            Err(PublishError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_id(r#"{"id":""}"#),
            Err(PublishError::MalformedResponse(_))
        ));
    }

    #[test]
    fn base_url_is_trimmed() {
        let api = HttpThreadsApi::new("https://graph.threads.net/v1.0/");
        assert_eq!(api.base_url, "https://graph.threads.net/v1.0");
    }
}
