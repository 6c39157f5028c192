//! Network module for client connections.
//!
//! This module provides the HTTP/WebSocket side of the daemon:
//! - `server`: the `axum` router (`/ws`, `/health`, static front-end) and
//!   the listener loop with graceful shutdown
//! - `connection`: one task pair per WebSocket (inbound router loop and
//!   outbound writer) bound to a server-assigned transport id

pub mod connection;
pub mod server;

use std::net::SocketAddr;

use crate::session::TransportId;

/// Events emitted as clients come and go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A WebSocket was accepted.
    Opened {
        /// Server-assigned id of the connection.
        transport_id: TransportId,
        /// Remote address.
        peer: SocketAddr,
    },
    /// A WebSocket closed and its sessions were cleaned up.
    Closed {
        /// Server-assigned id of the connection.
        transport_id: TransportId,
        /// Sessions closed because of the disconnect.
        sessions_closed: usize,
    },
}

pub use connection::handle_socket;
pub use server::{create_router, serve, AppState, HealthResponse};
