use thiserror::Error;

/// Failures of a single publish (container creation + container publish).
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid chain item: {0}")]
    InvalidItem(String),

    #[error("container creation failed: {0}")]
    ContainerCreationFailed(String),

    #[error("publish rejected with status {status}: {body}")]
    PublishRejected { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("publish failed after {attempts} attempts: {last}")]
    PublishExhausted { attempts: u32, last: String },
}

impl PublishError {
    /// Errors the publish phase may retry against the same container.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PublishError::PublishRejected { .. }
                | PublishError::MalformedResponse(_)
                | PublishError::Transport(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("parent media id is required")]
    MissingParent,

    #[error("nothing to enqueue")]
    Empty,

    #[error("sequence 0 is the root post and is never queued")]
    RootItem,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain has no items")]
    Empty,

    #[error("chain sequences must run 0..{expected} without gaps, got {found:?}")]
    BadSequence { expected: usize, found: Vec<i32> },

    #[error(transparent)]
    InvalidItem(PublishError),

    #[error("root post failed: {0}")]
    RootPublish(PublishError),

    /// The root post is live; its replies could not be queued.
    #[error("root post {parent_thread_id} published but enqueue failed: {source}")]
    Enqueue {
        parent_thread_id: String,
        #[source]
        source: EnqueueError,
    },

    #[error("saving chain failed: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChainError {
    /// Whether the request was rejected before anything was published.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChainError::Empty | ChainError::BadSequence { .. } | ChainError::InvalidItem(_)
        )
    }
}
