//! Submission interface for the event router.
//!
//! `RouterHandle` is cheap to clone; every ingress loop holds one.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RouterError`

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use relay_protocol::{Event, EventKind};

/// Handle for submitting decoded events to the router.
///
/// Every kind shares one bounded FIFO channel, so events submitted through
/// one handle reach the router in submission order. Submission waits at most
/// `submit_timeout` for room in the channel, so a slow router delays an
/// ingress loop by a bounded amount and never blocks it indefinitely.
#[derive(Clone)]
pub struct RouterHandle {
    sender: mpsc::Sender<Event>,
    submit_timeout: Duration,
}

impl RouterHandle {
    pub(crate) fn new(sender: mpsc::Sender<Event>, submit_timeout: Duration) -> Self {
        Self {
            sender,
            submit_timeout,
        }
    }

    /// Submits an event to the router.
    ///
    /// # Errors
    ///
    /// - `RouterError::Backlogged` if the channel stayed full for the whole
    ///   submit timeout; the event is dropped
    /// - `RouterError::ChannelClosed` if the router has stopped
    pub async fn submit(&self, event: Event) -> Result<(), RouterError> {
        self.sender
            .send_timeout(event, self.submit_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(event) => RouterError::Backlogged { kind: event.kind() },
                SendTimeoutError::Closed(_) => RouterError::ChannelClosed,
            })
    }

    /// Returns true while the router is accepting events.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Errors submitting events to the router.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("Router backlog full for {kind}, event dropped")]
    Backlogged { kind: EventKind },

    #[error("Router channel closed")]
    ChannelClosed,
}
