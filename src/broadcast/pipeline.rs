//! Ordered broadcast pipeline
//!
//! Publishers push messages onto an unbounded FIFO queue and return
//! immediately. A single dispatch task drains the queue and writes each
//! frame to every registered connection, dropping connections whose write
//! fails. With one consumer, every connection sees messages in the same
//! order they were enqueued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionRegistry};
use crate::protocol::frame;

/// Errors that can occur during pipeline operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Broadcast pipeline is closed")]
    Closed,

    #[error("Dispatch loop is already running")]
    AlreadyRunning,
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// A message waiting to be broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    /// Wrap an encoded payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The encoded payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Counters kept by the dispatch loop
#[derive(Debug, Default)]
pub struct PipelineStats {
    dispatched: AtomicU64,
    writes: AtomicU64,
    failed_writes: AtomicU64,
}

impl PipelineStats {
    /// Messages fully dispatched
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Successful frame writes
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Writes that failed and dropped their connection
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }
}

/// Where the queue's consumer currently lives
enum DispatchState {
    /// Receiver parked until `start`
    Idle(mpsc::UnboundedReceiver<Message>),
    /// Receiver owned by the dispatch task, handed back when it exits
    Running(JoinHandle<mpsc::UnboundedReceiver<Message>>),
    /// Shut down
    Stopped,
}

/// Queue of pending messages plus its dispatch task
pub struct BroadcastPipeline {
    sender: mpsc::UnboundedSender<Message>,
    state: Mutex<DispatchState>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    stats: Arc<PipelineStats>,
}

impl BroadcastPipeline {
    /// Create a pipeline delivering to `registry`. Nothing is dispatched until [`start`](Self::start).
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            state: Mutex::new(DispatchState::Idle(receiver)),
            registry,
            shutdown: CancellationToken::new(),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Spawn the dispatch loop
    ///
    /// The queue has a single consumer, so this succeeds at most once.
    pub fn start(&self) -> PipelineResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = match std::mem::replace(&mut *state, DispatchState::Stopped) {
            DispatchState::Idle(receiver) => receiver,
            DispatchState::Running(worker) => {
                *state = DispatchState::Running(worker);
                return Err(PipelineError::AlreadyRunning);
            }
            DispatchState::Stopped => return Err(PipelineError::Closed),
        };

        let dispatcher = Dispatcher {
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown.clone(),
            stats: Arc::clone(&self.stats),
        };
        *state = DispatchState::Running(tokio::spawn(dispatcher.run(receiver)));
        info!("Broadcast dispatch loop started");
        Ok(())
    }

    /// Enqueue a message for broadcast. Never waits for delivery.
    pub fn publish(&self, message: Message) -> PipelineResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Closed);
        }
        self.sender.send(message).map_err(|_| PipelineError::Closed)
    }

    /// Dispatch counters
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the dispatch loop and discard anything still queued
    ///
    /// Waits for an in-progress message to finish dispatching. Returns the
    /// number of discarded messages. Calling this again returns 0.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let state = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, DispatchState::Stopped)
        };
        let receiver = match state {
            DispatchState::Idle(receiver) => Some(receiver),
            DispatchState::Running(worker) => match worker.await {
                Ok(receiver) => Some(receiver),
                Err(e) => {
                    warn!("Dispatch loop ended abnormally: {}", e);
                    None
                }
            },
            DispatchState::Stopped => None,
        };

        let discarded = receiver.map(discard_pending).unwrap_or(0);
        if discarded > 0 {
            info!("Discarded {} undelivered messages", discarded);
        }
        discarded
    }
}

fn discard_pending(mut receiver: mpsc::UnboundedReceiver<Message>) -> usize {
    receiver.close();
    let mut discarded = 0;
    while receiver.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

/// State owned by the dispatch task
struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    /// Drain the queue until shutdown. Hands the receiver back so the caller can discard leftovers.
    async fn run(
        self,
        mut receiver: mpsc::UnboundedReceiver<Message>,
    ) -> mpsc::UnboundedReceiver<Message> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.dispatch(&message).await;
        }

        debug!("Broadcast dispatch loop stopped");
        receiver
    }

    /// Write one message to every connection in the current snapshot
    async fn dispatch(&self, message: &Message) {
        let frame = frame::encode(message.payload());
        let connections = self.registry.snapshot().await;
        let recipients = connections.len();

        for handle in connections {
            match handle.write(frame.clone()) {
                Ok(()) => {
                    self.stats.writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
                    self.registry.remove(handle.id()).await;
                    if handle.close() {
                        warn!(
                            "{}: closed ({}) after {:?}: {}",
                            handle.id(),
                            CloseReason::WriteFailed,
                            handle.age(),
                            e
                        );
                    }
                }
            }
        }

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Dispatched {} byte message to {} connections",
            message.payload().len(),
            recipients
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;
    use crate::connection::{ConnectionHandle, ConnectionId, ConnectionStream};
    use crate::protocol::frame::FrameDecoder;

    async fn connect(
        registry: &ConnectionRegistry,
        id: &str,
        capacity: usize,
    ) -> (ConnectionHandle, ConnectionStream) {
        let (handle, stream) =
            ConnectionHandle::new(ConnectionId::from(id), capacity, CancellationToken::new());
        handle.mark_open();
        registry.register(handle.clone()).await;
        (handle, stream)
    }

    /// Read frames until `count` payloads have arrived
    async fn read_frames(
        stream: &mut (impl futures_util::Stream<Item = Bytes> + Unpin),
        count: usize,
    ) -> Vec<String> {
        let mut decoder = FrameDecoder::new();
        let mut payloads = Vec::new();
        while payloads.len() < count {
            let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended early");
            decoder.extend(&chunk);
            while let Some(payload) = decoder.next_frame().unwrap() {
                payloads.push(String::from_utf8(payload.to_vec()).unwrap());
            }
        }
        payloads
    }

    #[tokio::test]
    async fn test_publish_reaches_all_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = BroadcastPipeline::new(Arc::clone(&registry));
        pipeline.start().unwrap();

        let (_a, stream_a) = connect(&registry, "a", 16).await;
        let (_b, stream_b) = connect(&registry, "b", 16).await;
        let mut stream_a = Box::pin(stream_a.into_stream());
        let mut stream_b = Box::pin(stream_b.into_stream());

        pipeline.publish(Message::new("hello")).unwrap();

        assert_eq!(read_frames(&mut stream_a, 1).await, vec!["hello"]);
        assert_eq!(read_frames(&mut stream_b, 1).await, vec!["hello"]);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = BroadcastPipeline::new(registry);
        pipeline.start().unwrap();
        assert_eq!(pipeline.start(), Err(PipelineError::AlreadyRunning));
        pipeline.shutdown().await;
        assert_eq!(pipeline.start(), Err(PipelineError::Closed));
    }

    #[tokio::test]
    async fn test_fifo_order_across_publishers() {
        const PUBLISHERS: usize = 4;
        const PER_PUBLISHER: usize = 25;
        const CONNECTIONS: usize = 3;

        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = Arc::new(BroadcastPipeline::new(Arc::clone(&registry)));
        pipeline.start().unwrap();

        let mut streams = Vec::new();
        for i in 0..CONNECTIONS {
            let (handle, stream) = connect(&registry, &format!("c{}", i), 256).await;
            streams.push((handle, Box::pin(stream.into_stream())));
        }

        let mut publishers = Vec::new();
        for p in 0..PUBLISHERS {
            let pipeline = Arc::clone(&pipeline);
            publishers.push(tokio::spawn(async move {
                for n in 0..PER_PUBLISHER {
                    pipeline.publish(Message::new(format!("{}:{}", p, n))).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for publisher in publishers {
            publisher.await.unwrap();
        }

        let total = PUBLISHERS * PER_PUBLISHER;
        let mut sequences = Vec::new();
        for (_, stream) in streams.iter_mut() {
            sequences.push(read_frames(stream, total).await);
        }

        // Same global order everywhere
        for sequence in &sequences[1..] {
            assert_eq!(sequence, &sequences[0]);
        }

        // No duplicates or omissions, and each publisher's order is kept
        let first = &sequences[0];
        assert_eq!(first.len(), total);
        for p in 0..PUBLISHERS {
            let own: Vec<usize> = first
                .iter()
                .filter_map(|m| m.split_once(':'))
                .filter(|(publisher, _)| *publisher == p.to_string())
                .map(|(_, n)| n.parse().unwrap())
                .collect();
            assert_eq!(own, (0..PER_PUBLISHER).collect::<Vec<_>>());
        }

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_write_removes_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = BroadcastPipeline::new(Arc::clone(&registry));

        let (good, good_stream) = connect(&registry, "good", 16).await;
        let (bad, bad_stream) = connect(&registry, "bad", 16).await;
        drop(bad_stream);

        pipeline.start().unwrap();
        pipeline.publish(Message::new("first")).unwrap();
        pipeline.publish(Message::new("second")).unwrap();

        let mut good_stream = Box::pin(good_stream.into_stream());
        assert_eq!(
            read_frames(&mut good_stream, 2).await,
            vec!["first", "second"]
        );

        assert!(!registry.contains(bad.id()).await);
        assert!(registry.contains(good.id()).await);
        assert!(bad.is_closed());
        assert_eq!(pipeline.stats().failed_writes(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_connection_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = BroadcastPipeline::new(Arc::clone(&registry));
        let (slow, _slow_stream) = connect(&registry, "slow", 1).await;

        pipeline.start().unwrap();
        pipeline.publish(Message::new("1")).unwrap();
        pipeline.publish(Message::new("2")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), slow.cancelled())
            .await
            .unwrap();
        assert!(!registry.contains(slow.id()).await);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_discards_pending() {
        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = BroadcastPipeline::new(Arc::clone(&registry));
        let (conn, stream) = connect(&registry, "a", 16).await;

        for n in 0..3 {
            pipeline.publish(Message::new(n.to_string())).unwrap();
        }
        assert_eq!(pipeline.shutdown().await, 3);
        assert_eq!(pipeline.stats().dispatched(), 0);
        assert_eq!(pipeline.publish(Message::new("late")), Err(PipelineError::Closed));
        assert_eq!(pipeline.shutdown().await, 0);

        drop(conn);
        registry.drain().await;
        let received: Vec<Bytes> = stream.into_stream().collect().await;
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_loop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = BroadcastPipeline::new(registry);
        pipeline.start().unwrap();

        tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
            .await
            .unwrap();
        assert!(pipeline.is_shutdown());
        assert_eq!(pipeline.publish(Message::new("late")), Err(PipelineError::Closed));
    }
}
