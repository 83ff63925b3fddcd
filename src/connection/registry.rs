//! Registry of open streaming connections
//!
//! The only state shared between request handlers and the dispatch loop.
//! Broadcast iterates over a snapshot so the lock is never held while
//! writing to clients.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ConnectionHandle, ConnectionId};

/// Thread-safe map from connection id to its output handle
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. An existing entry with the same id is replaced.
    pub async fn register(&self, handle: ConnectionHandle) {
        let id = handle.id().clone();
        let mut connections = self.connections.write().await;
        if connections.insert(id.clone(), handle).is_some() {
            warn!("Connection {} was already registered, replacing it", id);
        }
        debug!("Registered connection {} ({} open)", id, connections.len());
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub async fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.write().await.remove(id);
        if removed.is_some() {
            debug!("Removed connection {}", id);
        }
        removed
    }

    /// Look up a connection
    pub async fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(id).cloned()
    }

    /// Whether a connection is registered
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no connections are registered
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Point-in-time copy of every entry
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Call `f` for every entry in a point-in-time snapshot
    ///
    /// Registrations and removals made while `f` runs do not affect the
    /// current pass.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ConnectionId, &ConnectionHandle),
    {
        for handle in self.snapshot().await {
            f(handle.id(), &handle);
        }
    }

    /// Remove and return every entry
    pub async fn drain(&self) -> Vec<ConnectionHandle> {
        let mut connections = self.connections.write().await;
        connections.drain().map(|(_, handle)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::connection::ConnectionStream;

    fn handle(id: &str) -> (ConnectionHandle, ConnectionStream) {
        ConnectionHandle::new(ConnectionId::from(id), 8, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        let (conn, _stream) = handle("a");
        registry.register(conn).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(&"a".into()).await);
        let found = registry.get(&"a".into()).await.unwrap();
        assert_eq!(found.id().as_str(), "a");
    }

    #[tokio::test]
    async fn test_register_same_id_last_wins() {
        let registry = ConnectionRegistry::new();
        let (first, _s1) = handle("a");
        let (second, _s2) = handle("a");
        second.mark_open();
        registry.register(first).await;
        registry.register(second).await;

        assert_eq!(registry.len().await, 1);
        let found = registry.get(&"a".into()).await.unwrap();
        assert_eq!(found.state(), crate::connection::ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _stream) = handle("a");
        registry.register(conn).await;

        assert!(registry.remove(&"a".into()).await.is_some());
        assert!(registry.remove(&"a".into()).await.is_none());
        assert!(registry.remove(&"never".into()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_for_each_visits_snapshot() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut streams = Vec::new();
        for id in ["a", "b", "c"] {
            let (conn, stream) = handle(id);
            registry.register(conn).await;
            streams.push(stream);
        }

        let mut seen = Vec::new();
        registry
            .for_each(|id, _| seen.push(id.as_str().to_string()))
            .await;
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_changes() {
        let registry = ConnectionRegistry::new();
        let (a, _sa) = handle("a");
        registry.register(a).await;

        let snapshot = registry.snapshot().await;
        registry.remove(&"a".into()).await;
        let (b, _sb) = handle("b");
        registry.register(b).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id().as_str(), "a");
    }

    #[tokio::test]
    async fn test_concurrent_register_and_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (conn, _stream) = handle(&format!("conn-{}", i));
                registry.register(conn).await;
                let _ = registry.snapshot().await;
                if i % 2 == 0 {
                    registry.remove(&format!("conn-{}", i).into()).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.len().await, 16);
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (a, _sa) = handle("a");
        let (b, _sb) = handle("b");
        registry.register(a).await;
        registry.register(b).await;

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty().await);
    }
}
