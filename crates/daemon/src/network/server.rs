//! HTTP/WebSocket server.
//!
//! Routes:
//! - `GET /ws` upgrades to the terminal session channel
//! - `GET /health` answers `{"status":"healthy"}`
//! - anything else is served from the optional static directory, falling
//!   back to its `index.html` for client-side routing

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use super::connection::handle_socket;
use super::ConnectionEvent;
use crate::router::MessageRouter;

/// Shared state handed to every request.
#[derive(Clone)]
pub struct AppState {
    /// Router applying client events to the registry.
    pub router: MessageRouter,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Cancelled when the daemon shuts down.
    pub shutdown: CancellationToken,
    /// Connection lifecycle notifications.
    pub events: broadcast::Sender<ConnectionEvent>,
    /// Number of open WebSockets.
    pub connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Build state around `router`.
    pub fn new(router: MessageRouter, outbound_queue: usize, shutdown: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            router,
            outbound_queue,
            shutdown,
            events,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of open WebSockets.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// Build the application router.
pub fn create_router(state: AppState, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state);

    if let Some(dir) = static_dir {
        tracing::info!("Serving static files from: {}", dir.display());
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).fallback(index));
    }

    app.layer(TraceLayer::new_for_http())
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening on http://{}", addr);
        tracing::info!("WebSocket endpoint: ws://{}/ws", addr);
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}
