//! Streaming HTTP server
//!
//! Binds the listener, serves the chat endpoint and coordinates graceful
//! shutdown with the connection manager.

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::http;
use crate::config::ServerConfig;
use crate::connection::ConnectionManager;

/// HTTP server for streaming chat connections
pub struct StreamServer {
    config: ServerConfig,
    manager: Arc<ConnectionManager>,
    shutdown: CancellationToken,
}

impl StreamServer {
    /// Create a new server and start its broadcast pipeline
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let manager = Arc::new(ConnectionManager::new(config.connection.clone())?);
        Ok(Self {
            config,
            manager,
            shutdown: CancellationToken::new(),
        })
    }

    /// The connection manager behind this server
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Router serving the configured endpoint
    pub fn router(&self) -> Router {
        http::router(&self.config.path, Arc::clone(&self.manager))
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// On shutdown every open stream is ended first, otherwise the HTTP
    /// server would wait on them forever.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Streaming server listening on http://{}{}",
            listener.local_addr()?,
            self.config.path
        );

        let manager = Arc::clone(&self.manager);
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Shutdown signal received, closing open streams");
                manager.shutdown().await;
            })
            .await?;

        info!("Streaming server stopped");
        Ok(())
    }
}
