//! Connection registry.
//!
//! The registry is the set of all live connections, shared by `Arc` between
//! the HTTP layer (which registers), the ingress loops (which unregister on
//! disconnect) and the router (which scans and evicts on write failure).
//!
//! # Architecture
//!
//! ```text
//!  ws upgrade ──register──▶ ┌──────────────────────────────┐
//!                           │           Registry           │
//!  ingress loop ─evict────▶ │ RwLock<HashMap<ConnectionId, │
//!                           │            Arc<Connection>>> │
//!  router ─for_each_matching▶└──────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! `register`, `unregister` and `evict` take the write lock.
//! `for_each_matching` takes the read lock only long enough to snapshot the
//! matching connections, then writes with no lock held, so a stalled peer
//! never blocks registration or removal of other connections.
//!
//! `unregister` retires the connection under the write lock. A retired
//! connection is skipped by every scan and refuses writes, so no write is
//! started on a connection after its `unregister` has returned, even by a
//! scan whose snapshot still holds it. Connections that fail a write are
//! reported back to the caller and removed after the scan.

mod connection;

pub use connection::{ChannelSink, Connection, FrameSink, TransportError};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use relay_core::ConnectionId;

/// Default bound on closing a removed connection's transport
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe set of live connections keyed by connection id.
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    close_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_close_timeout(DEFAULT_CLOSE_TIMEOUT)
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry whose evictions give up closing a
    /// transport after `close_timeout`.
    pub fn with_close_timeout(close_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            close_timeout,
        }
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Adds a connection and returns the handle used to remove it.
    ///
    /// Never fails.
    pub async fn register(&self, connection: Connection) -> ConnectionId {
        let id = connection.id().clone();
        let mut connections = self.connections.write().await;
        debug!(
            connection_id = %id,
            cid = %connection.cid(),
            role = %connection.role(),
            "Registering connection"
        );
        connections.insert(id.clone(), Arc::new(connection));
        id
    }

    /// Removes and retires a connection and returns it.
    ///
    /// Idempotent: returns `None` if the connection was already removed.
    /// Does not close the transport; see [`Registry::evict`].
    pub async fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(id);
        if let Some(connection) = &removed {
            connection.retire();
            debug!(connection_id = %id, remaining = connections.len(), "Unregistered connection");
        }
        removed
    }

    /// Removes a connection and closes its transport.
    ///
    /// Only the caller that actually removed the entry closes it, so a
    /// transport is closed at most once even when the ingress loop and the
    /// router race to remove the same connection. Returns true if this call
    /// performed the removal.
    ///
    /// Waits at most the close timeout for the transport to close.
    pub async fn evict(&self, id: &ConnectionId) -> bool {
        match self.unregister(id).await {
            Some(connection) => {
                if !connection.close(self.close_timeout).await {
                    debug!(connection_id = %id, "Close timed out, dropping transport");
                }
                true
            }
            None => false,
        }
    }

    /// Like [`Registry::evict`], but closes the transport on a spawned task
    /// so the caller does not wait for the peer.
    ///
    /// The connection is unregistered before this returns. Must be called
    /// from within a tokio runtime.
    pub async fn evict_detached(&self, id: &ConnectionId) -> bool {
        match self.unregister(id).await {
            Some(connection) => {
                let close_timeout = self.close_timeout;
                let id = id.clone();
                tokio::spawn(async move {
                    if !connection.close(close_timeout).await {
                        debug!(connection_id = %id, "Close timed out, dropping transport");
                    }
                });
                true
            }
            None => false,
        }
    }

    /// Calls `f` for every connection whose correlation id matches `target`.
    ///
    /// The matching set is snapshotted under the read lock and `f` runs with
    /// no lock held. Connections retired after the snapshot are skipped. A
    /// failing `f` does not stop the scan; the ids of connections for which
    /// `f` failed are returned so the caller can evict them after the scan.
    pub async fn for_each_matching<F, Fut, E>(&self, target: &str, mut f: F) -> Vec<ConnectionId>
    where
        F: FnMut(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let matching: Vec<Arc<Connection>> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|c| c.cid().matches(target))
                .cloned()
                .collect()
        };

        let mut failed = Vec::new();
        for connection in matching {
            if connection.is_retired() {
                continue;
            }

            let id = connection.id().clone();
            if let Err(e) = f(connection).await {
                debug!(connection_id = %id, error = %e, "Write to matching connection failed");
                failed.push(id);
            }
        }

        failed
    }

    /// Number of live connections whose correlation id matches `target`.
    pub async fn count_matching(&self, target: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.cid().matches(target))
            .count()
    }

    /// Returns true if the connection is currently registered.
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Ids of all live connections, in no particular order.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
