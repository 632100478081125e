//! HTTP/WebSocket front end of the relay daemon.
//!
//! The server:
//! - Accepts WebSocket upgrades on `/ws?role=<role>&cid=<correlation id>`
//! - Registers each upgraded connection and spawns its ingress loop
//! - Answers liveness checks on `/ping`
//! - Serves plaintext or TLS depending on configuration
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │  axum::Router   │
//! └───────┬─────────┘
//!         │ GET /ws (upgrade)
//!         ▼
//! ┌─────────────────┐  register  ┌─────────────────┐
//! │ socket handler  │───────────▶│    Registry     │
//! └───────┬─────────┘            └────────▲────────┘
//!         │ read half                     │ for_each_matching
//!         ▼                               │
//! ┌─────────────────┐   submit   ┌────────┴────────┐
//! │ConnectionHandler│───────────▶│  Event router   │
//! │   (per client)  │            │ (one per proc)  │
//! └─────────────────┘            └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Startup failures are returned as `ServerError`

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::future::join_all;
use futures::StreamExt;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use relay_core::{CorrelationId, Role};

use crate::config::{ConfigError, RelayConfig, ServeMode};
use crate::registry::{Connection, Registry};
use crate::router::{spawn_router, RouterHandle};

/// Longest a TLS listener waits for open connections after shutdown
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Query parameters of a connection request.
///
/// Both are optional; a missing value is the empty string. An empty
/// correlation id never matches any event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectParams {
    pub role: String,
    pub cid: String,
}

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub router: RouterHandle,
    pub max_frame_size: usize,
    pub cancel_token: CancellationToken,
}

/// Builds the axum application for the given state.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ping", get(ping_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let max_frame_size = state.max_frame_size;
    ws.max_message_size(max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Registers an upgraded socket and runs its ingress loop to completion.
async fn handle_socket(socket: WebSocket, params: ConnectParams, state: AppState) {
    let (writer, reader) = socket.split();

    let connection = Connection::new(Role::new(params.role), CorrelationId::new(params.cid), writer);
    let role = connection.role().clone();
    let cid = connection.cid().clone();
    let connection_id = state.registry.register(connection).await;

    info!(
        connection_id = %connection_id,
        role = %role,
        cid = %cid,
        "Client connected"
    );

    let handler = ConnectionHandler::new(
        connection_id,
        reader,
        Arc::clone(&state.registry),
        state.router.clone(),
        state.max_frame_size,
        state.cancel_token.clone(),
    );

    if let Err(e) = handler.run().await {
        debug!(error = %e, "Ingress loop ended with error");
    }
}

async fn ping_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "pong" }))
}

/// The relay daemon: registry, router and HTTP front end.
pub struct RelayServer {
    config: RelayConfig,
    state: AppState,
    router_task: JoinHandle<()>,
}

impl RelayServer {
    /// Creates the server and starts its event router.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RelayConfig, cancel_token: CancellationToken) -> Self {
        let registry = Arc::new(Registry::with_close_timeout(config.write_timeout()));
        let (router, router_task) = spawn_router(
            Arc::clone(&registry),
            config.router_config(),
            cancel_token.clone(),
        );

        let state = AppState {
            registry,
            router,
            max_frame_size: config.max_frame_size,
            cancel_token,
        };

        Self {
            config,
            state,
            router_task,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the shared connection registry.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Returns a submission handle of the router.
    pub fn router_handle(&self) -> RouterHandle {
        self.state.router.clone()
    }

    /// Returns the axum application.
    pub fn app(&self) -> Router {
        build_app(self.state.clone())
    }

    /// Binds the configured address and serves until cancelled.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if the configuration is invalid
    /// - `ServerError::Bind` if the listen address is unavailable
    /// - `ServerError::Tls` if the certificate or key cannot be loaded
    pub async fn run(self) -> Result<(), ServerError> {
        if let Err(e) = self.config.validate() {
            self.shutdown().await;
            return Err(e.into());
        }
        let addr = self.config.listen_addr();
        let mode = self.config.mode;

        match mode {
            ServeMode::Plain => match TcpListener::bind(addr).await {
                Ok(listener) => self.serve(listener).await,
                Err(e) => {
                    self.shutdown().await;
                    Err(ServerError::Bind {
                        addr,
                        error: e.to_string(),
                    })
                }
            },
            ServeMode::Tls => self.serve_tls(addr).await,
        }
    }

    /// Serves plaintext HTTP on an already bound listener until cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, mode = %ServeMode::Plain, "Relay server listening");

        let app = self.app();
        let shutdown_token = self.state.cancel_token.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await;

        self.shutdown().await;
        result.map_err(ServerError::from)
    }

    async fn serve_tls(self, addr: SocketAddr) -> Result<(), ServerError> {
        let tls_config = match load_tls_config(&self.config).await {
            Ok(tls_config) => tls_config,
            Err(e) => {
                self.shutdown().await;
                return Err(e);
            }
        };

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let shutdown_token = self.state.cancel_token.clone();
        tokio::spawn(async move {
            shutdown_token.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
        });

        info!(addr = %addr, mode = %ServeMode::Tls, "Relay server listening");

        let app = self.app();
        let result = axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await;

        self.shutdown().await;
        result.map_err(|e| ServerError::Bind {
            addr,
            error: e.to_string(),
        })
    }

    /// Stops the router and closes every remaining connection.
    async fn shutdown(self) {
        self.state.cancel_token.cancel();

        if let Err(e) = self.router_task.await {
            error!(error = %e, "Event router task failed");
        }

        // Each close is bounded by the registry's close timeout
        let registry = &self.state.registry;
        let ids = registry.connection_ids().await;
        let closed = ids.len();
        join_all(ids.iter().map(|id| registry.evict(id))).await;
        debug!(closed, "Closed remaining connections");

        info!("Relay server stopped");
    }
}

async fn load_tls_config(
    config: &RelayConfig,
) -> Result<axum_server::tls_rustls::RustlsConfig, ServerError> {
    let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) else {
        return Err(ConfigError::MissingTlsPath { which: "certificate" }.into());
    };

    axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| ServerError::Tls(e.to_string()))
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Failed to load TLS certificate or key: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
