//! Relay Protocol - Wire envelope and event codec
//!
//! This crate provides the typed events exchanged over relay connections
//! and the codec that converts them to and from JSON text frames.

pub mod codec;
pub mod event;
mod lenient;

pub use codec::{decode, decode_str, encode, DecodeError, EncodeError};
pub use event::{
    Event, EventKind, StampSuccessNotify, StampToCustomerNotify, STAMP_SUCCESS_NOTIFY,
    STAMP_TO_CUSTOMER_NOTIFY,
};
