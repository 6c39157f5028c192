//! Message router for dispatching incoming packets to the session registry.
//!
//! This module provides the `MessageRouter` struct that receives decoded
//! packets from one connection and applies the terminal session contract:
//!
//! | Event             | Effect                         | Reply                      |
//! |-------------------|--------------------------------|----------------------------|
//! | `create_terminal` | spawn a PTY bound to the caller | ack `{success}`           |
//! | `terminal_input`  | queue input for the PTY        | none                       |
//! | `resize_terminal` | resize the PTY                 | none                       |
//! | `close_terminal`  | tear the session down          | ack `{success}` if asked   |
//!
//! Messages for unknown, closed, or foreign sessions are logged and dropped.

use std::sync::Arc;

use tracing::{debug, info, warn};
use webterm_protocol::messages::{CloseTerminal, CreateTerminal, ResizeTerminal, TerminalInput};
use webterm_protocol::{Ack, ClientEvent, Packet, ProtocolError};

use crate::session::{OutboundTx, SessionError, SessionRegistry, TransportId};

/// Result type for router operations.
pub type RouterResult = Result<Option<Packet>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Malformed or unknown event.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session belongs to another connection.
    #[error("session {0} is bound to another connection")]
    ForeignSession(String),
}

impl RouterError {
    /// Whether this error only means the message arrived for a session that
    /// is gone or not ready, which is routine and logged at debug level.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            RouterError::Session(SessionError::NotFound(_) | SessionError::NotActive(_))
                | RouterError::ForeignSession(_)
        )
    }
}

/// The connection a packet arrived on.
#[derive(Debug, Clone)]
pub struct Origin {
    /// Server-assigned connection id.
    pub transport: TransportId,
    /// Queue of packets bound for this connection.
    pub outbound: OutboundTx,
}

/// Message router that applies client events to the session registry.
#[derive(Clone)]
pub struct MessageRouter {
    /// Session registry.
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    /// Create a new message router over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this router drives.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Route a packet and return the reply to send back, if any.
    ///
    /// Errors never reach the client as protocol errors: they are logged,
    /// and a request that asked for an ack gets `{success: false}`.
    pub async fn route(&self, packet: Packet, origin: &Origin) -> Option<Packet> {
        let (event, data, ack_id) = match packet {
            Packet::Event { event, data, id } => (event, data, id),
            Packet::Ack { id, .. } => {
                debug!(transport_id = %origin.transport, ack_id = id, "Ignoring ack from client");
                return None;
            }
        };

        let result = match ClientEvent::from_parts(&event, data) {
            Ok(event) => self.dispatch(event, ack_id, origin).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_stale() {
                    debug!(transport_id = %origin.transport, event = %event, error = %e, "Dropped message");
                } else {
                    warn!(transport_id = %origin.transport, event = %event, error = %e, "Failed to handle message");
                }
                ack_id.and_then(|id| ack(id, Ack::failed()))
            }
        }
    }

    async fn dispatch(&self, event: ClientEvent, ack_id: Option<u64>, origin: &Origin) -> RouterResult {
        match event {
            ClientEvent::CreateTerminal(req) => self.handle_create(req, ack_id, origin).await,
            ClientEvent::TerminalInput(req) => self.handle_input(req, origin).await,
            ClientEvent::ResizeTerminal(req) => self.handle_resize(req, origin).await,
            ClientEvent::CloseTerminal(req) => self.handle_close(req, ack_id, origin).await,
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_create(
        &self,
        req: CreateTerminal,
        ack_id: Option<u64>,
        origin: &Origin,
    ) -> RouterResult {
        let created = self
            .registry
            .create(
                &req.terminal_id,
                req.cols,
                req.rows,
                &origin.transport,
                origin.outbound.clone(),
            )
            .await;

        let reply = match created {
            Ok(_) => Ack::ok(),
            Err(e) => {
                warn!(session_id = %req.terminal_id, error = %e, "create_terminal failed");
                Ack::failed()
            }
        };

        if ack_id.is_none() {
            debug!(session_id = %req.terminal_id, "create_terminal without ack request");
        }
        Ok(ack_id.and_then(|id| ack(id, reply)))
    }

    async fn handle_input(&self, req: TerminalInput, origin: &Origin) -> RouterResult {
        self.check_owner(&req.terminal_id, origin)?;
        self.registry
            .input(&req.terminal_id, req.input.into_bytes())
            .await?;
        Ok(None)
    }

    async fn handle_resize(&self, req: ResizeTerminal, origin: &Origin) -> RouterResult {
        self.check_owner(&req.terminal_id, origin)?;
        self.registry
            .resize(&req.terminal_id, req.cols, req.rows)
            .await?;
        Ok(None)
    }

    async fn handle_close(
        &self,
        req: CloseTerminal,
        ack_id: Option<u64>,
        origin: &Origin,
    ) -> RouterResult {
        self.check_owner(&req.terminal_id, origin)?;
        let closed = self.registry.close(&req.terminal_id).await;
        info!(session_id = %req.terminal_id, closed = closed, "close_terminal");

        let reply = if closed { Ack::ok() } else { Ack::failed() };
        Ok(ack_id.and_then(|id| ack(id, reply)))
    }

    fn check_owner(&self, id: &str, origin: &Origin) -> Result<(), RouterError> {
        match self.registry.owner(id) {
            Some(owner) if owner != origin.transport => {
                Err(RouterError::ForeignSession(id.to_string()))
            }
            Some(_) => Ok(()),
            None => Err(SessionError::NotFound(id.to_string()).into()),
        }
    }
}

fn ack(id: u64, reply: Ack) -> Option<Packet> {
    match Packet::ack(id, &reply) {
        Ok(packet) => Some(packet),
        Err(e) => {
            warn!(ack_id = id, error = %e, "Failed to encode ack");
            None
        }
    }
}
