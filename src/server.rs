use crate::api::{self, AppState};
use crate::chain::ChainCoordinator;
use crate::config::{ConfigContext, Pacing};
use crate::content::ContentStore;
use crate::db::DbHandle;
use crate::platform::{HttpThreadsApi, ThreadsApi};
use crate::publisher::Publisher;
use crate::queue::{ProcessorSignal, QueueStore, ThreadQueue};
use crate::worker::{self, QueueProcessor};
use anyhow::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Wires the pipeline together from configuration and the given stores.
pub fn build_state(
    queue_store: Arc<dyn QueueStore>,
    content_store: Arc<dyn ContentStore>,
    api: Arc<dyn ThreadsApi>,
    pacing: Pacing,
) -> Arc<AppState> {
    let signal = ProcessorSignal::new();
    let publisher = Publisher::new(api, pacing.clone());
    let queue = ThreadQueue::new(queue_store.clone(), signal.clone(), pacing.max_retries);
    let coordinator =
        ChainCoordinator::new(publisher.clone(), queue, content_store.clone(), pacing.clone());
    let processor = Arc::new(QueueProcessor::new(
        queue_store.clone(),
        content_store,
        publisher,
        pacing,
    ));

    Arc::new(AppState {
        coordinator,
        processor,
        queue_store,
        signal,
    })
}

/// Runs the queue worker and the trigger API until cancelled.
pub async fn serve(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    trace!("Connecting to db:{}", config.connect_url);
    let handle = Arc::new(DbHandle::new(&config.connect_url).await?);
    let threads_api: Arc<dyn ThreadsApi> = Arc::new(HttpThreadsApi::new(&config.api_base));

    let state = build_state(handle.clone(), handle, threads_api, Pacing::default());

    let worker_spawn = {
        let cancel_token = cancel_token.clone();
        let processor = state.processor.clone();
        let signal = state.signal.clone();
        let poll_interval = config.poll_interval();
        let cleanup_interval = config.cleanup_interval();
        tokio::spawn(
            async move {
                worker::run(
                    cancel_token,
                    processor,
                    signal,
                    poll_interval,
                    cleanup_interval,
                )
                .await;
            }
            .instrument(info_span!("worker")),
        )
    };

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!("Listening on http://{}", config.bind);

    let shutdown = cancel_token.clone();
    let http_result = axum::serve(listener, api::routes(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(err) = &http_result {
        error!(message = "HTTP server error", error = ?err);
    }

    // Stop the worker whichever way the server ended.
    cancel_token.cancel();
    worker_spawn.await?;
    http_result?;

    info!("Server stopped.");

    Ok(())
}
