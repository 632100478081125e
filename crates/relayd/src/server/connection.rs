//! Ingress loop for a single client connection.
//!
//! Each upgraded WebSocket gets its own `ConnectionHandler` that:
//! - Reads frames from the connection's read half
//! - Decodes them into typed events
//! - Submits events to the router
//! - Evicts the connection from the registry when the loop ends
//!
//! State machine: `Connected -> (ReadFrame)* -> Closed`.
//!
//! | Frame / condition          | Action                         |
//! |----------------------------|--------------------------------|
//! | known event                | submit to router, keep reading |
//! | unknown `event` value      | ignore, keep reading           |
//! | malformed envelope         | close the connection           |
//! | frame over the size limit  | close the connection           |
//! | close frame / EOF / error  | close the connection           |
//! | ping / pong                | ignore                         |
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::ConnectionId;
use relay_protocol::{decode, DecodeError};

use crate::registry::Registry;
use crate::router::{RouterError, RouterHandle};

/// Ingress loop for one connection.
///
/// Generic over the read half so it can be driven by any stream of
/// WebSocket messages.
pub struct ConnectionHandler<S> {
    /// Registration handle of this connection
    connection_id: ConnectionId,

    /// Read half of the transport
    reader: S,

    /// Shared connection registry
    registry: Arc<Registry>,

    /// Submission handle of the process-wide router
    router: RouterHandle,

    /// Largest accepted frame, in bytes
    max_frame_size: usize,

    /// Server shutdown signal
    cancel_token: CancellationToken,
}

impl<S, E> ConnectionHandler<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    /// Creates a handler for an already registered connection.
    pub fn new(
        connection_id: ConnectionId,
        reader: S,
        registry: Arc<Registry>,
        router: RouterHandle,
        max_frame_size: usize,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            reader,
            registry,
            router,
            max_frame_size,
            cancel_token,
        }
    }

    /// Runs the loop until the connection closes.
    ///
    /// Always evicts the connection from the registry before returning.
    /// Returns `Ok(())` when the peer closed the connection normally and the
    /// reason otherwise.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.process_frames().await;

        match &result {
            Ok(()) => debug!(connection_id = %self.connection_id, "Peer closed connection"),
            Err(e) => debug!(connection_id = %self.connection_id, error = %e, "Connection closed"),
        }

        self.registry.evict(&self.connection_id).await;
        info!(connection_id = %self.connection_id, "Client disconnected");

        result
    }

    /// Main read loop.
    async fn process_frames(&mut self) -> Result<(), ConnectionError> {
        loop {
            let next = tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(ConnectionError::Shutdown),
                next = self.reader.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
                None => return Ok(()),
            };

            match message {
                Message::Text(text) => self.handle_frame(text.as_bytes()).await?,
                Message::Binary(bytes) => self.handle_frame(&bytes).await?,
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    /// Decodes one frame and submits the resulting event.
    async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        if frame.len() > self.max_frame_size {
            return Err(ConnectionError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        let event = match decode(frame) {
            Ok(event) => event,
            Err(e) if e.is_fatal() => return Err(ConnectionError::Decode(e)),
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "Ignoring frame");
                return Ok(());
            }
        };

        debug!(
            connection_id = %self.connection_id,
            event = %event.kind(),
            target = %event.target(),
            "Received event"
        );

        match self.router.submit(event).await {
            Ok(()) => Ok(()),
            Err(RouterError::Backlogged { kind }) => {
                warn!(connection_id = %self.connection_id, event = %kind, "Router backlogged, event dropped");
                Ok(())
            }
            Err(RouterError::ChannelClosed) => Err(ConnectionError::RouterUnavailable),
        }
    }
}

/// Reasons an ingress loop ends other than a normal close by the peer.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Router unavailable")]
    RouterUnavailable,

    #[error("Server shutting down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelSink, Connection};
    use crate::router::{spawn_router, RouterConfig};
    use futures::stream;
    use relay_core::{CorrelationId, Role};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const MAX_FRAME: usize = 1024;
    const STAMP_FRAME: &str = r#"{"event":"SEND_STAMP_TO_CUSTOMER_NOTIFY","data":{"guid":"u1","prize_id":7}}"#;

    struct Fixture {
        registry: Arc<Registry>,
        router: RouterHandle,
        cancel_token: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(Registry::new());
            let cancel_token = CancellationToken::new();
            let (router, _task) = spawn_router(
                Arc::clone(&registry),
                RouterConfig::default(),
                cancel_token.clone(),
            );
            Self {
                registry,
                router,
                cancel_token,
            }
        }

        async fn register(&self, cid: &str) -> (ConnectionId, mpsc::Receiver<String>) {
            let (sink, rx) = ChannelSink::new(8);
            let id = self
                .registry
                .register(Connection::new(Role::default(), CorrelationId::new(cid), sink))
                .await;
            (id, rx)
        }

        fn handler<S>(&self, id: ConnectionId, reader: S) -> ConnectionHandler<S>
        where
            S: Stream<Item = Result<Message, String>> + Unpin,
        {
            ConnectionHandler::new(
                id,
                reader,
                Arc::clone(&self.registry),
                self.router.clone(),
                MAX_FRAME,
                self.cancel_token.clone(),
            )
        }
    }

    fn frames(messages: Vec<Message>) -> impl Stream<Item = Result<Message, String>> + Unpin {
        stream::iter(messages.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_event_reaches_matching_connection() {
        let fixture = Fixture::new();
        let (_target, mut target_rx) = fixture.register("u1").await;
        let (sender, _sender_rx) = fixture.register("staff").await;

        let handler = fixture.handler(sender.clone(), frames(vec![Message::Text(STAMP_FRAME.to_string())]));
        assert!(handler.run().await.is_ok());

        let frame = tokio::time::timeout(Duration::from_secs(1), target_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("\"guid\":\"u1\""));

        // End of stream removed the sender only
        assert!(!fixture.registry.contains(&sender).await);
        assert_eq!(fixture.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let fixture = Fixture::new();
        let (_target, mut target_rx) = fixture.register("u1").await;
        let (id, _rx) = fixture.register("staff").await;

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Message, String>>();
        let handler = fixture.handler(id.clone(), rx);
        let task = tokio::spawn(handler.run());

        tx.unbounded_send(Ok(Message::Text(
            r#"{"event":"SOMETHING_ELSE","data":{"guid":"u1"}}"#.to_string(),
        )))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Still open, nothing routed
        assert!(!task.is_finished());
        assert!(fixture.registry.contains(&id).await);
        assert!(target_rx.try_recv().is_err());

        // A later valid frame on the same connection is still routed
        tx.unbounded_send(Ok(Message::Text(STAMP_FRAME.to_string()))).unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), target_rx.recv())
            .await
            .unwrap();
        assert!(frame.is_some());

        drop(tx);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_envelope_closes_connection() {
        let fixture = Fixture::new();
        let (_target, mut target_rx) = fixture.register("u1").await;
        let (id, mut own_rx) = fixture.register("staff").await;

        let handler = fixture.handler(
            id.clone(),
            frames(vec![
                Message::Text("not json".to_string()),
                Message::Text(STAMP_FRAME.to_string()),
            ]),
        );

        let result = handler.run().await;
        assert!(matches!(
            result,
            Err(ConnectionError::Decode(DecodeError::MalformedEnvelope(_)))
        ));
        assert!(!fixture.registry.contains(&id).await);

        // Writer was closed and the frame after the garbage was never read
        assert!(own_rx.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(target_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_binary_frames_are_decoded() {
        let fixture = Fixture::new();
        let (_target, mut target_rx) = fixture.register("u1").await;
        let (id, _rx) = fixture.register("staff").await;

        let handler = fixture.handler(id, frames(vec![Message::Binary(STAMP_FRAME.as_bytes().to_vec())]));
        assert!(handler.run().await.is_ok());

        let frame = tokio::time::timeout(Duration::from_secs(1), target_rx.recv())
            .await
            .unwrap();
        assert!(frame.is_some());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let fixture = Fixture::new();
        let (id, _rx) = fixture.register("staff").await;

        let big = "x".repeat(MAX_FRAME + 1);
        let handler = fixture.handler(id.clone(), frames(vec![Message::Text(big)]));

        let result = handler.run().await;
        assert!(matches!(
            result,
            Err(ConnectionError::FrameTooLarge { size, max }) if size == MAX_FRAME + 1 && max == MAX_FRAME
        ));
        assert!(!fixture.registry.contains(&id).await);
    }

    #[tokio::test]
    async fn test_close_frame_and_read_error_end_loop() {
        let fixture = Fixture::new();

        let (closed, _rx1) = fixture.register("a").await;
        let handler = fixture.handler(
            closed.clone(),
            frames(vec![Message::Ping(vec![1]), Message::Close(None)]),
        );
        assert!(handler.run().await.is_ok());
        assert!(!fixture.registry.contains(&closed).await);

        let (errored, _rx2) = fixture.register("b").await;
        let reader = stream::iter(vec![Err::<Message, String>("connection reset".to_string())]);
        let handler = fixture.handler(errored.clone(), reader);
        assert!(matches!(handler.run().await, Err(ConnectionError::Io(ref e)) if e == "connection reset"));
        assert!(!fixture.registry.contains(&errored).await);
    }

    #[tokio::test]
    async fn test_shutdown_ends_loop() {
        let fixture = Fixture::new();
        let (id, _rx) = fixture.register("a").await;

        let (_tx, rx) = futures::channel::mpsc::unbounded::<Result<Message, String>>();
        let task = tokio::spawn(fixture.handler(id.clone(), rx).run());

        fixture.cancel_token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Shutdown)));
        assert!(!fixture.registry.contains(&id).await);
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::FrameTooLarge {
            size: 2_000_000,
            max: 1_048_576,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
