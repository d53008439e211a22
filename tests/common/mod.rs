#![allow(dead_code)]

use anyhow::{bail, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use threadchain::api::AppState;
use threadchain::config::Pacing;
use threadchain::memory::MemoryStore;
use threadchain::platform::{ContainerRequest, ThreadsApi};
use threadchain::queue::QueueStore;
use threadchain::server::build_state;
use threadchain::{CallerContext, Credentials, NewQueueEntry, PublishError, QueueEntry};

/// One scripted response of the publish endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Ok,
    Status(u16),
    Malformed,
}

#[derive(Debug, Clone)]
pub enum ApiCall {
    Create {
        request: ContainerRequest,
        at: Instant,
    },
    Publish {
        creation_id: String,
        at: Instant,
    },
}

/// Platform double: containers are numbered `c1, c2, ...`, a published
/// container `cN` becomes post `post-cN`.
#[derive(Default)]
pub struct ScriptedApi {
    calls: Mutex<Vec<ApiCall>>,
    publish_script: Mutex<VecDeque<PublishStep>>,
    failing_texts: Mutex<HashSet<String>>,
    containers: Mutex<u32>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Responses for the next publish calls; afterwards publishes succeed.
    pub fn script_publish(&self, steps: &[PublishStep]) {
        self.publish_script.lock().unwrap().extend(steps.iter().copied());
    }

    /// Container creation fails for posts with this text.
    pub fn fail_text(&self, text: &str) {
        self.failing_texts.lock().unwrap().insert(text.to_string());
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> Vec<(ContainerRequest, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Create { request, at } => Some((request, at)),
                _ => None,
            })
            .collect()
    }

    pub fn publishes(&self) -> Vec<(String, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Publish { creation_id, at } => Some((creation_id, at)),
                _ => None,
            })
            .collect()
    }

    /// `reply_to_id` of every non-carousel-item container, in call order.
    pub fn reply_targets(&self) -> Vec<Option<String>> {
        self.creates()
            .into_iter()
            .filter_map(|(request, _)| match request {
                ContainerRequest::Text { reply_to_id, .. }
                | ContainerRequest::Image { reply_to_id, .. }
                | ContainerRequest::Video { reply_to_id, .. }
                | ContainerRequest::Carousel { reply_to_id, .. } => Some(reply_to_id),
                ContainerRequest::CarouselItem { .. } => None,
            })
            .collect()
    }
}

fn request_text(request: &ContainerRequest) -> Option<&str> {
    match request {
        ContainerRequest::Text { text, .. }
        | ContainerRequest::Image { text, .. }
        | ContainerRequest::Video { text, .. }
        | ContainerRequest::Carousel { text, .. } => Some(text),
        ContainerRequest::CarouselItem { .. } => None,
    }
}

#[async_trait]
impl ThreadsApi for ScriptedApi {
    async fn create_container(
        &self,
        _credentials: &Credentials,
        request: &ContainerRequest,
    ) -> Result<String, PublishError> {
        self.calls.lock().unwrap().push(ApiCall::Create {
            request: request.clone(),
            at: Instant::now(),
        });

        if let Some(text) = request_text(request) {
            if self.failing_texts.lock().unwrap().contains(text) {
                return Err(PublishError::ContainerCreationFailed(format!(
                    "Status 400 Bad Request: rejected {}",
                    text
                )));
            }
        }

        let mut containers = self.containers.lock().unwrap();
        *containers += 1;
        Ok(format!("c{}", *containers))
    }

    async fn publish_container(
        &self,
        _credentials: &Credentials,
        creation_id: &str,
    ) -> Result<String, PublishError> {
        self.calls.lock().unwrap().push(ApiCall::Publish {
            creation_id: creation_id.to_string(),
            at: Instant::now(),
        });

        let step = self
            .publish_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PublishStep::Ok);

        match step {
            PublishStep::Ok => Ok(format!("post-{}", creation_id)),
            PublishStep::Status(status) => Err(PublishError::PublishRejected {
                status,
                body: r#"{"error":{"message":"try again"}}"#.to_string(),
            }),
            PublishStep::Malformed => Err(PublishError::MalformedResponse(
                "missing id - body: {}".to_string(),
            )),
        }
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        social_id: "17841400000000000".to_string(),
        access_token: "test-access-token".to_string(),
        user_id: "user-1".to_string(),
    }
}

pub fn interactive() -> CallerContext {
    CallerContext::Interactive(credentials())
}

pub fn automated() -> CallerContext {
    CallerContext::Automated(credentials())
}

/// Queue store in front of a `MemoryStore` that can be told to fail, to
/// stand in for an unavailable database.
pub struct FlakyQueue {
    inner: Arc<MemoryStore>,
    refuse_inserts: AtomicBool,
    failing_writes: AtomicU32,
}

impl FlakyQueue {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(FlakyQueue {
            inner,
            refuse_inserts: AtomicBool::new(false),
            failing_writes: AtomicU32::new(0),
        })
    }

    pub fn refuse_inserts(&self) {
        self.refuse_inserts.store(true, Ordering::SeqCst);
    }

    /// The next `count` status writes (complete, requeue, fail) error out.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn write_allowed(&self) -> Result<(), Error> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failed.is_ok() {
            bail!("connection reset");
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FlakyQueue {
    async fn insert_entries(&self, entries: &[NewQueueEntry]) -> Result<Vec<Uuid>, Error> {
        if self.refuse_inserts.load(Ordering::SeqCst) {
            bail!("db down");
        }
        self.inner.insert_entries(entries).await
    }

    async fn claim_pending(&self, limit: i64) -> Result<Vec<QueueEntry>, Error> {
        self.inner.claim_pending(limit).await
    }

    async fn complete(&self, queue_id: Uuid) -> Result<(), Error> {
        self.write_allowed()?;
        self.inner.complete(queue_id).await
    }

    async fn requeue(&self, queue_id: Uuid, error: &str) -> Result<(), Error> {
        self.write_allowed()?;
        self.inner.requeue(queue_id, error).await
    }

    async fn fail(&self, queue_id: Uuid, error: &str) -> Result<(), Error> {
        self.write_allowed()?;
        self.inner.fail(queue_id, error).await
    }

    async fn has_pending(&self) -> Result<bool, Error> {
        self.inner.has_pending().await
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        self.inner.delete_completed_before(cutoff).await
    }

    async fn reset_processing(&self) -> Result<u64, Error> {
        self.inner.reset_processing().await
    }

    async fn entries_for_chain(&self, parent_media_id: &str) -> Result<Vec<QueueEntry>, Error> {
        self.inner.entries_for_chain(parent_media_id).await
    }
}

pub struct Harness {
    pub api: Arc<ScriptedApi>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<FlakyQueue>,
    pub state: Arc<AppState>,
}

impl Harness {
    pub fn new() -> Self {
        let api = ScriptedApi::new();
        let store = Arc::new(MemoryStore::new());
        let queue = FlakyQueue::new(store.clone());
        let state = build_state(queue.clone(), store.clone(), api.clone(), Pacing::default());
        Harness {
            api,
            store,
            queue,
            state,
        }
    }
}
