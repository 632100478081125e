//! Event router.
//!
//! Exactly one router runs per process. It owns the receiving end of the
//! event channel, takes events off it in FIFO order, and dispatches each
//! event to the connections whose correlation id equals the event's target.
//! All kinds share the channel, so the events of one ingress loop are
//! dispatched in the order that loop submitted them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  submit   ┌──────────────────────┐
//! │ ingress loop │──────────▶│ event channel (mpsc) │──┐
//! │ (per client) │           └──────────────────────┘  │ recv
//! └──────────────┘                                     ▼
//!                                            ┌──────────────────┐
//!                                            │      Router      │
//!                                            └────────┬─────────┘
//!                                                     │ for_each_matching
//!                                                     ▼
//!                                            ┌──────────────────┐
//!                                            │     Registry     │──▶ matching writers
//!                                            └──────────────────┘
//! ```
//!
//! Delivery is best-effort and at-most-once: events with no matching
//! connection are dropped, nothing is queued for clients that connect later,
//! and failed writes are not retried. A connection whose write fails or
//! times out is evicted after the scan; its transport is closed on a
//! separate task so a stalled peer never holds up the next event.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Encoding failures are logged and the event is dropped

mod handle;

pub use handle::{RouterError, RouterHandle};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_protocol::{encode, Event};

use crate::registry::Registry;

/// Router tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Capacity of the event channel
    pub event_buffer: usize,
    /// Longest an ingress loop waits for room in a full channel
    pub submit_timeout: Duration,
    /// Longest the router waits on a single connection write
    pub write_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            submit_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Connections whose correlation id matched the target
    pub matched: usize,
    /// Matched connections that accepted the frame
    pub delivered: usize,
    /// Matched connections whose write failed and which were evicted
    pub failed: usize,
}

/// Spawns the process-wide router and returns the handle for submitting
/// events to it.
///
/// Call this once at startup. The router owns the receiver of the channel
/// behind the returned handle, so clones of the handle all feed the same
/// single router. The router stops when `cancel_token` is cancelled or when
/// every handle has been dropped.
///
/// Must be called from within a tokio runtime.
pub fn spawn_router(
    registry: Arc<Registry>,
    config: RouterConfig,
    cancel_token: CancellationToken,
) -> (RouterHandle, JoinHandle<()>) {
    let buffer = config.event_buffer.max(1);
    let (event_tx, event_rx) = mpsc::channel(buffer);

    let router = Router {
        registry,
        receiver: event_rx,
        write_timeout: config.write_timeout,
        cancel_token,
    };
    let task = tokio::spawn(router.run());

    let handle = RouterHandle::new(event_tx, config.submit_timeout);
    (handle, task)
}

/// The router task state. Constructed only by [`spawn_router`].
struct Router {
    registry: Arc<Registry>,
    receiver: mpsc::Receiver<Event>,
    write_timeout: Duration,
    cancel_token: CancellationToken,
}

impl Router {
    async fn run(mut self) {
        info!("Event router starting");
        let mut routed: u64 = 0;

        loop {
            let event = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Event router shutting down");
                    break;
                }
                received = self.receiver.recv() => match received {
                    Some(event) => event,
                    None => {
                        debug!("Event channel closed");
                        break;
                    }
                },
            };

            dispatch(&self.registry, &event, self.write_timeout).await;
            routed += 1;
        }

        info!(routed, "Event router stopped");
    }
}

/// Encodes `event` and writes it to every connection whose correlation id
/// equals the event's target.
///
/// Each write is bounded by `write_timeout`. Connections whose write fails
/// are unregistered once the registry scan has finished; closing their
/// transports happens in the background.
pub async fn dispatch(registry: &Registry, event: &Event, write_timeout: Duration) -> DispatchReport {
    let kind = event.kind();
    let target = event.target();

    let frame = match encode(event) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "Failed to encode event, dropping");
            return DispatchReport::default();
        }
    };

    let mut matched = 0;
    let failed_ids = registry
        .for_each_matching(target, |connection| {
            matched += 1;
            let frame = frame.clone();
            async move { connection.send_frame(frame, write_timeout).await }
        })
        .await;

    if matched == 0 {
        debug!(event = %kind, target = %target, "No connection for target, event dropped");
        return DispatchReport::default();
    }

    for id in &failed_ids {
        if registry.evict_detached(id).await {
            warn!(connection_id = %id, event = %kind, "Evicted connection after failed write");
        }
    }

    let report = DispatchReport {
        matched,
        delivered: matched - failed_ids.len(),
        failed: failed_ids.len(),
    };

    debug!(
        event = %kind,
        target = %target,
        matched = report.matched,
        delivered = report.delivered,
        failed = report.failed,
        "Dispatched event"
    );

    report
}
