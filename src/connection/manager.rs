//! Connection lifecycle manager
//!
//! Opens streams (id, preamble, registration, timeout), closes them on
//! request or when the transport gives up, forwards publishes to the
//! broadcast pipeline, and tears everything down at shutdown.
//!
//! Each connection moves `OPENING -> OPEN -> CLOSED` exactly once. Every
//! close path (request, timeout, disconnect, failed write, shutdown) ends in
//! the same place: the entry leaves the registry and the response stream
//! ends.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionStream,
    WriteError,
};
use crate::broadcast::{BroadcastPipeline, Message, PipelineError, PipelineStats};
use crate::config::{ConfigError, ConnectionConfig};
use crate::protocol::{frame, ControlRequest, ProtocolError, RequestType};

/// Errors that can occur during connection manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Failed to write to connection: {0}")]
    Write(#[from] WriteError),

    #[error("Failed to encode message: {0}")]
    Encoding(#[from] ProtocolError),

    #[error("Broadcast error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

/// A freshly opened connection, ready to be handed to the transport
pub struct OpenConnection {
    /// Id assigned to the connection
    pub id: ConnectionId,
    /// Response body source; the preamble is already queued
    pub stream: ConnectionStream,
}

/// What `shutdown` tore down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Connections removed from the registry
    pub closed_connections: usize,
    /// Queued messages that were never dispatched
    pub discarded_messages: usize,
}

/// Owns the registry and broadcast pipeline and drives connection lifecycles
pub struct ConnectionManager {
    registry: Arc<ConnectionRegistry>,
    pipeline: BroadcastPipeline,
    config: ConnectionConfig,
    /// Parent of every connection's token
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager and start its dispatch loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ConnectionConfig) -> ManagerResult<Self> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = BroadcastPipeline::new(Arc::clone(&registry));
        pipeline.start()?;

        Ok(Self {
            registry,
            pipeline,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Number of open connections
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// The connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcast counters
    pub fn stats(&self) -> &PipelineStats {
        self.pipeline.stats()
    }

    /// Whether shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        self.pipeline.is_shutdown() || self.shutdown.is_cancelled()
    }

    /// Open a new streaming connection
    ///
    /// Queues the preamble, registers the connection and arms its timeout.
    pub async fn open(&self) -> ManagerResult<OpenConnection> {
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }

        let id = ConnectionId::generate();
        let (handle, stream) = ConnectionHandle::new(
            id.clone(),
            self.config.channel_capacity,
            self.shutdown.child_token(),
        );

        // Queued before registration, so it precedes every broadcast frame
        handle.write(frame::preamble(id.as_str()))?;

        self.registry.register(handle.clone()).await;
        if !handle.mark_open() {
            self.registry.remove(&id).await;
            return Err(ManagerError::Write(WriteError::Closed));
        }
        self.watch(handle);

        info!("{}: open", id);
        Ok(OpenConnection { id, stream })
    }

    /// Close a connection by id
    ///
    /// Unknown or already closed ids are ignored. Returns whether this call
    /// closed the connection.
    pub async fn close(&self, id: &ConnectionId) -> bool {
        let Some(handle) = self.registry.remove(id).await else {
            debug!("Close requested for unknown connection {}", id);
            return false;
        };

        let closed = handle.close();
        if closed {
            log_closed(&handle, CloseReason::Requested);
        }
        closed
    }

    /// Enqueue an encoded payload for broadcast
    pub fn publish(&self, payload: impl Into<Bytes>) -> ManagerResult<()> {
        self.pipeline.publish(Message::new(payload))?;
        Ok(())
    }

    /// Handle a control request from a client
    ///
    /// `close` closes the named connection; anything else is encoded and
    /// published. The sender id is not checked for `send`.
    pub async fn handle_request(&self, request: ControlRequest) -> ManagerResult<()> {
        info!(
            "{}: {}",
            request.id.as_deref().unwrap_or("-"),
            request.kind
        );

        match request.kind {
            RequestType::Close => {
                if let Some(id) = request.id {
                    self.close(&ConnectionId::from(id)).await;
                }
                Ok(())
            }
            RequestType::Send => {
                let payload = request.message.encode(self.config.max_message_bytes)?;
                self.publish(payload)
            }
        }
    }

    /// Stop accepting connections, discard queued messages and drop every connection
    ///
    /// Clients are not sent anything; they see their stream end.
    ///
    /// Connections are drained before the root token is cancelled, so their
    /// watchers find nothing left to remove. An open racing with shutdown is
    /// still ended by the root token.
    pub async fn shutdown(&self) -> ShutdownSummary {
        let discarded_messages = self.pipeline.shutdown().await;

        let drained = self.registry.drain().await;
        for handle in &drained {
            if handle.close() {
                log_closed(handle, CloseReason::Shutdown);
            }
        }
        self.shutdown.cancel();

        let summary = ShutdownSummary {
            closed_connections: drained.len(),
            discarded_messages,
        };
        info!(
            "Connection manager shut down: {} connections closed, {} messages discarded",
            summary.closed_connections, summary.discarded_messages
        );
        summary
    }

    /// Close the connection when it times out, its client goes away, or it is cancelled elsewhere
    fn watch(&self, handle: ConnectionHandle) {
        let registry = Arc::clone(&self.registry);
        // Measured from open, not from the task's first poll
        let deadline = tokio::time::Instant::now() + self.config.timeout();

        tokio::spawn(async move {
            let reason = tokio::select! {
                // Only a cancelled parent leaves the state open here
                _ = handle.cancelled() => CloseReason::Shutdown,
                _ = tokio::time::sleep_until(deadline) => CloseReason::Timeout,
                _ = handle.disconnected() => CloseReason::Disconnected,
            };

            registry.remove(handle.id()).await;
            if handle.close() {
                log_closed(&handle, reason);
            }
        });
    }
}

fn log_closed(handle: &ConnectionHandle, reason: CloseReason) {
    info!(
        "{}: closed ({}) after {:.1}s",
        handle.id(),
        reason,
        handle.age().as_secs_f64()
    );
}
