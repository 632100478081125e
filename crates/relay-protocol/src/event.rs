//! Event kinds and their typed payload records.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lenient::{lenient, lenient_int};

/// Discriminator for `SEND_STAMP_TO_CUSTOMER_NOTIFY`.
pub const STAMP_TO_CUSTOMER_NOTIFY: &str = "SEND_STAMP_TO_CUSTOMER_NOTIFY";

/// Discriminator for `SEND_STAMP_SUCCESS_NOTIFY`.
pub const STAMP_SUCCESS_NOTIFY: &str = "SEND_STAMP_SUCCESS_NOTIFY";

// ============================================================================
// Event Kind
// ============================================================================

/// The closed set of event kinds the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Stamp exchange details sent to a customer.
    StampToCustomer,
    /// Status code/message sent back after a stamp operation.
    StampSuccess,
}

impl EventKind {
    /// All known kinds, in declaration order.
    pub const ALL: [EventKind; 2] = [EventKind::StampToCustomer, EventKind::StampSuccess];

    /// Wire discriminator for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StampToCustomer => STAMP_TO_CUSTOMER_NOTIFY,
            EventKind::StampSuccess => STAMP_SUCCESS_NOTIFY,
        }
    }

    /// Looks up a kind by its wire discriminator (exact match).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload Records
// ============================================================================

/// Payload of `SEND_STAMP_TO_CUSTOMER_NOTIFY`.
///
/// Routed by `guid`. Every other field is relayed verbatim. Fields that are
/// missing or carry the wrong JSON type decode to their zero value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StampToCustomerNotify {
    #[serde(deserialize_with = "lenient")]
    pub guid: String,
    #[serde(deserialize_with = "lenient")]
    pub uid: String,
    #[serde(deserialize_with = "lenient")]
    pub desc: String,
    #[serde(deserialize_with = "lenient_int")]
    pub prize_id: i64,
    #[serde(deserialize_with = "lenient")]
    pub item_name: String,
    #[serde(deserialize_with = "lenient_int")]
    pub exchange_num: i64,
    #[serde(deserialize_with = "lenient_int")]
    pub spend_stamp_num: i64,
    #[serde(deserialize_with = "lenient_int")]
    pub remain_stamp_num: i64,
}

/// Payload of `SEND_STAMP_SUCCESS_NOTIFY`.
///
/// Routed by `uid`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StampSuccessNotify {
    #[serde(deserialize_with = "lenient")]
    pub uid: String,
    #[serde(deserialize_with = "lenient_int")]
    pub code: i64,
    #[serde(deserialize_with = "lenient")]
    pub message: String,
}

// ============================================================================
// Event
// ============================================================================

/// A decoded event: discriminator plus typed payload.
///
/// Serializes to the wire envelope `{"event": <kind>, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "SEND_STAMP_TO_CUSTOMER_NOTIFY")]
    StampToCustomer(StampToCustomerNotify),

    #[serde(rename = "SEND_STAMP_SUCCESS_NOTIFY")]
    StampSuccess(StampSuccessNotify),
}

impl Event {
    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StampToCustomer(_) => EventKind::StampToCustomer,
            Event::StampSuccess(_) => EventKind::StampSuccess,
        }
    }

    /// Returns the correlation id this event is addressed to.
    pub fn target(&self) -> &str {
        match self {
            Event::StampToCustomer(payload) => &payload.guid,
            Event::StampSuccess(payload) => &payload.uid,
        }
    }
}

impl From<StampToCustomerNotify> for Event {
    fn from(payload: StampToCustomerNotify) -> Self {
        Event::StampToCustomer(payload)
    }
}

impl From<StampSuccessNotify> for Event {
    fn from(payload: StampSuccessNotify) -> Self {
        Event::StampSuccess(payload)
    }
}
