use anyhow::Error;
use clap::Parser;

use std::env;
use threadchain::config::ConfigContext;
use threadchain::{server, telemetry};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(cancel_token.clone(), config).await {
                    error!("Error starting server: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("server")),
        )
    };

    server_spawn.await?;

    Ok(())
}

async fn wait_for_shutdown(token: CancellationToken) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = token.cancelled() => {},
    }
    token.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "threadchain=debug,info");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let app = tokio::spawn(setup(token.clone(), config));

    let signals = {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = wait_for_shutdown(token).await {
                error!("Failed to install signal handlers: {}", err);
            }
        })
    };

    app.await??;
    token.cancel();
    signals.await?;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
