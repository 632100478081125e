//! Relay Core - Shared identifier types for the stamp relay
//!
//! This crate provides the small value types shared between the
//! codec (relay-protocol) and the daemon (relayd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod id;

// Re-exports for convenience
pub use id::{ConnectionId, CorrelationId, Role};
