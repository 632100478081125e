//! A registered connection and the write half of its transport.
//!
//! The read half of a transport belongs to the connection's ingress loop.
//! The write half lives here, behind an async mutex, and is only written by
//! the router (or closed by whoever removes the connection).
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport failures are returned as `TransportError`

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use relay_core::{ConnectionId, CorrelationId, Role};

/// Outbound half of a transport.
///
/// Implemented for the WebSocket sink used in production and for
/// [`ChannelSink`], an in-memory sink.
#[async_trait]
pub trait FrameSink: Send {
    /// Writes one text frame.
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError>;

    /// Closes the transport. Errors are ignored: the peer may already be gone.
    async fn close(&mut self);
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

/// In-memory sink backed by a bounded channel, for tests.
///
/// Production connections use the WebSocket sink; this one lets the
/// registry, router and ingress loop be driven without a socket. Frames
/// written to the sink are readable from the paired receiver. Dropping the
/// receiver makes every later write fail with `TransportError::Closed`;
/// leaving it full makes writes block.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<String>>,
}

impl ChannelSink {
    /// Creates a sink holding at most `capacity` unread frames.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

/// One live duplex session as seen by the registry.
pub struct Connection {
    id: ConnectionId,
    role: Role,
    cid: CorrelationId,
    writer: Mutex<Box<dyn FrameSink>>,
    retired: AtomicBool,
}

impl Connection {
    /// Creates a connection with a freshly generated id.
    pub fn new(role: Role, cid: CorrelationId, sink: impl FrameSink + 'static) -> Self {
        Self {
            id: ConnectionId::new(),
            role,
            cid,
            writer: Mutex::new(Box::new(sink)),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn cid(&self) -> &CorrelationId {
        &self.cid
    }

    /// Returns true once the connection has been removed from the registry.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Marks the connection as removed. Later writes fail without touching
    /// the transport.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Writes one frame, giving up after `write_timeout`.
    ///
    /// The timeout covers both waiting for the writer lock and the write
    /// itself, so a stalled peer cannot hold the caller longer than that.
    /// A retired connection is never written to.
    pub async fn send_frame(
        &self,
        frame: String,
        write_timeout: Duration,
    ) -> Result<(), TransportError> {
        match timeout(write_timeout, async {
            let mut writer = self.writer.lock().await;
            if self.is_retired() {
                return Err(TransportError::Closed);
            }
            writer.send_text(frame).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    /// Closes the write half of the transport, giving up after
    /// `close_timeout`.
    ///
    /// Closing flushes a close frame, which never completes against a peer
    /// that stopped reading. Returns false if the close did not finish in
    /// time; the transport is then released when the connection is dropped.
    pub async fn close(&self, close_timeout: Duration) -> bool {
        timeout(close_timeout, async {
            let mut writer = self.writer.lock().await;
            writer.close().await;
        })
        .await
        .is_ok()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("cid", &self.cid)
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

/// Errors writing to a connection's transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Transport closed")]
    Closed,
}
