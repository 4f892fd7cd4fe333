//! Encoder relay binary
//!
//! Serves one ffmpeg screen encoder to any number of HTTP consumers.

use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use encoder_relay::{
    config::{describe_bind, RelayConfig},
    encoder::FfmpegSpawner,
    relay::Relay,
    server::HttpServer,
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env();

    tracing::info!(
        url = %describe_bind(&config.server.bind_addr),
        display = %config.encoder.display,
        size = %config.encoder.video_size(),
        fps = config.encoder.framerate,
        bitrate = %config.encoder.bitrate,
        codec = %config.encoder.codec,
        "Starting encoder relay"
    );

    let (relay, handle) = Relay::new(Arc::new(config.encoder), FfmpegSpawner::new());
    let relay_task = tokio::spawn(relay.run());

    let control = handle.clone();
    let server = HttpServer::new(config.server, handle);
    server.run_until(shutdown_signal()).await?;

    let stats = control.stats().await?;
    tracing::info!(
        spawns = stats.spawns,
        restarts = stats.restarts,
        spawn_failures = stats.spawn_failures,
        consumers = stats.total_sinks,
        slow_consumers = stats.slow_consumer_disconnects,
        bytes = stats.bytes_broadcast,
        avg_bitrate = stats.bitrate(),
        "Encoder relay stopped"
    );

    // Dropping the last handles ends the event loop
    drop(control);
    drop(server);
    if let Err(e) = relay_task.await {
        tracing::error!(error = %e, "Relay task failed");
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
