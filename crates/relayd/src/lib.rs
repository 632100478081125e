//! Relay Daemon - Connection registry and event router
//!
//! This crate provides the core infrastructure for the relay daemon:
//! - `registry` - Set of live connections keyed by connection id
//! - `router` - Single event router that delivers events by correlation id
//! - `server` - HTTP/WebSocket front end and per-connection ingress loops
//! - `config` - Daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        relayd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   RelayServer   │────▶│          Registry           │    │
//! │  │ (axum, /ws)     │     │ (connection id -> writer)   │    │
//! │  └────────┬────────┘     └──────────────▲──────────────┘    │
//! │           │                             │                   │
//! │           │ connections                 │ matching scan     │
//! │           ▼                             │                   │
//! │  ┌─────────────────┐     ┌──────────────┴──────────────┐    │
//! │  │ConnectionHandler│────▶│        Event router         │    │
//! │  │  (per client)   │     │   (one FIFO mpsc channel)   │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod registry;
pub mod router;
pub mod server;
