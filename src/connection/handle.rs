//! A single streaming connection
//!
//! The handle owns the sending half of the connection's output channel and
//! the token that ends its response body. Cloning is cheap; all clones refer
//! to the same connection.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Errors from writing to a connection
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("Connection is closed")]
    Closed,

    #[error("Connection output buffer is full")]
    Full,
}

/// Result type for connection writes
pub type WriteResult<T> = Result<T, WriteError>;

/// Opaque identifier of one streaming connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, preamble not yet registered
    Opening = 0,
    /// Registered and receiving broadcasts
    Open = 1,
    /// Terminal
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close request
    Requested,
    /// Connection reached its timeout
    Timeout,
    /// Client went away
    Disconnected,
    /// A broadcast write failed
    WriteFailed,
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::Requested => "requested",
            CloseReason::Timeout => "timeout",
            CloseReason::Disconnected => "disconnected",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

struct Inner {
    id: ConnectionId,
    sender: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    opened_at: Instant,
    state: AtomicU8,
}

/// Writable side of a streaming connection
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Create a handle and the stream that feeds the response body
    ///
    /// The stream yields everything written to the handle and ends once the
    /// handle is closed or every handle clone is dropped.
    pub fn new(
        id: ConnectionId,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, ConnectionStream) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = Self {
            inner: Arc::new(Inner {
                id,
                sender,
                cancel: cancel.clone(),
                opened_at: Instant::now(),
                state: AtomicU8::new(ConnectionState::Opening as u8),
            }),
        };
        let stream = ConnectionStream { receiver, cancel };
        (handle, stream)
    }

    /// Connection id
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Time since the connection was opened
    pub fn age(&self) -> Duration {
        self.inner.opened_at.elapsed()
    }

    /// When the connection was opened
    pub fn opened_at(&self) -> Instant {
        self.inner.opened_at
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Queue bytes for the client without waiting
    pub fn write(&self, bytes: Bytes) -> WriteResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(WriteError::Closed);
        }
        self.inner.sender.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WriteError::Full,
            mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
        })
    }

    /// Move from OPENING to OPEN. Returns false if the connection already left OPENING.
    pub fn mark_open(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ConnectionState::Opening as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// End the response stream and mark the connection CLOSED
    ///
    /// Returns true only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let previous = self
            .inner
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        self.inner.cancel.cancel();
        previous != ConnectionState::Closed as u8
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolves when the connection is cancelled
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Resolves when the client side of the stream has been dropped
    pub async fn disconnected(&self) {
        self.inner.sender.closed().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Readable side of a streaming connection, consumed by the transport
pub struct ConnectionStream {
    receiver: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl ConnectionStream {
    /// Convert into a byte stream that ends when the connection is closed
    ///
    /// Bytes still buffered at close time are discarded.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        ReceiverStream::new(self.receiver).take_until(self.cancel.cancelled_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (ConnectionHandle, ConnectionStream) {
        ConnectionHandle::new(ConnectionId::generate(), capacity, CancellationToken::new())
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_state_transitions() {
        let (conn, _stream) = handle(4);
        assert_eq!(conn.state(), ConnectionState::Opening);

        assert!(conn.mark_open());
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(!conn.mark_open());

        assert!(conn.close());
        assert!(conn.is_closed());
        assert!(!conn.close());
        assert!(!conn.mark_open());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_write_reaches_stream() {
        let (conn, stream) = handle(4);
        conn.write(Bytes::from_static(b"one")).unwrap();
        conn.write(Bytes::from_static(b"two")).unwrap();
        drop(conn);

        let received: Vec<Bytes> = stream.into_stream().collect().await;
        assert_eq!(received, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_write_full_buffer() {
        let (conn, _stream) = handle(1);
        conn.write(Bytes::from_static(b"a")).unwrap();
        assert_eq!(conn.write(Bytes::from_static(b"b")), Err(WriteError::Full));
    }

    #[test]
    fn test_write_after_receiver_dropped() {
        let (conn, stream) = handle(4);
        drop(stream);
        assert_eq!(conn.write(Bytes::from_static(b"a")), Err(WriteError::Closed));
    }

    #[test]
    fn test_write_after_close() {
        let (conn, _stream) = handle(4);
        conn.close();
        assert_eq!(conn.write(Bytes::from_static(b"a")), Err(WriteError::Closed));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (conn, stream) = handle(4);
        let keep_alive = conn.clone();
        let reader = tokio::spawn(async move { stream.into_stream().count().await });

        conn.close();
        assert_eq!(reader.await.unwrap(), 0);
        assert!(keep_alive.is_closed());
    }

    #[tokio::test]
    async fn test_disconnected_resolves_when_stream_dropped() {
        let (conn, stream) = handle(4);
        drop(stream);
        tokio::time::timeout(Duration::from_secs(1), conn.disconnected())
            .await
            .unwrap();
    }
}
