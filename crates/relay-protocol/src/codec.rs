//! Frame codec: wire envelope to typed `Event` and back.
//!
//! Both directions use the same envelope:
//!
//! ```text
//! { "event": "<DISCRIMINATOR>", "data": { ...kind-specific fields... } }
//! ```
//!
//! Decoding is a two-step dispatch: the envelope is parsed first, then the
//! `event` discriminator selects which payload record `data` is decoded into.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::event::{Event, EventKind, StampSuccessNotify, StampToCustomerNotify};

/// Outer envelope with an untyped payload.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not a JSON object with a string `event` field.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope is well formed but names an event kind we do not route.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

impl DecodeError {
    /// Returns true if the connection that produced this frame should be
    /// terminated. Unknown events are ignored instead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::MalformedEnvelope(_))
    }
}

/// Errors produced while encoding an outbound frame.
#[derive(Debug, Error)]
#[error("Failed to encode {kind}: {reason}")]
pub struct EncodeError {
    pub kind: EventKind,
    pub reason: String,
}

/// Decodes one inbound frame.
///
/// # Errors
///
/// - `DecodeError::MalformedEnvelope` if the frame is not valid JSON, is not
///   an object, or lacks a string `event` field
/// - `DecodeError::UnknownEvent` if the discriminator is not a known kind
///
/// Payload fields that are missing or un-coercible are zero-filled; they
/// never cause an error.
pub fn decode(frame: &[u8]) -> Result<Event, DecodeError> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))?;

    if !value.is_object() {
        return Err(DecodeError::MalformedEnvelope(
            "envelope is not a JSON object".to_string(),
        ));
    }

    let envelope: RawEnvelope = serde_json::from_value(value)
        .map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))?;

    let kind = EventKind::from_name(&envelope.event)
        .ok_or_else(|| DecodeError::UnknownEvent(envelope.event.clone()))?;

    let event = match kind {
        EventKind::StampToCustomer => {
            Event::StampToCustomer(payload::<StampToCustomerNotify>(envelope.data))
        }
        EventKind::StampSuccess => Event::StampSuccess(payload::<StampSuccessNotify>(envelope.data)),
    };

    Ok(event)
}

/// Decodes a text frame. Convenience wrapper over [`decode`].
pub fn decode_str(frame: &str) -> Result<Event, DecodeError> {
    decode(frame.as_bytes())
}

/// Encodes an event into an outbound text frame.
pub fn encode(event: &Event) -> Result<String, EncodeError> {
    serde_json::to_string(event).map_err(|e| EncodeError {
        kind: event.kind(),
        reason: e.to_string(),
    })
}

/// Decodes `data` into a payload record, zero-filling anything unusable.
fn payload<T>(data: Value) -> T
where
    T: DeserializeOwned + Default,
{
    match data {
        Value::Object(_) => T::deserialize(data).unwrap_or_default(),
        _ => T::default(),
    }
}
