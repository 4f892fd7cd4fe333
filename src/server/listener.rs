//! HTTP server listener
//!
//! Binds the configured address and serves the relay router until shutdown.

use std::future::Future;

use axum::Router;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::relay::RelayHandle;
use crate::server::config::ServerConfig;
use crate::server::http;

/// HTTP front end of the relay
pub struct HttpServer {
    config: ServerConfig,
    relay: RelayHandle,
}

impl HttpServer {
    /// Create a new server serving `relay`
    pub fn new(config: ServerConfig, relay: RelayHandle) -> Self {
        Self { config, relay }
    }

    /// Router with all relay endpoints
    pub fn router(&self) -> Router {
        http::router(self.relay.clone(), self.config.max_pending_bytes)
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// When `shutdown` resolves the relay is shut down first, which ends every
    /// open stream body, then in-flight requests are drained.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "HTTP server listening");

        let relay = self.relay.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Shutdown signal received");

                if let Err(e) = relay.shutdown().await {
                    tracing::warn!(error = %e, "Relay already stopped");
                }
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
