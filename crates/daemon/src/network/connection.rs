//! One WebSocket connection.
//!
//! Each socket gets a fresh transport id and a bounded outbound queue. A
//! writer task owns the sink and drains the queue, so session output pumps
//! and router replies never touch the socket directly. The reader loop
//! decodes frames, routes them in arrival order, and closes every session
//! the connection owns once the socket goes away.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webterm_protocol::Packet;

use super::server::AppState;
use super::ConnectionEvent;
use crate::router::Origin;
use crate::session::TransportId;

/// Drive `socket` until the peer disconnects or the daemon shuts down.
pub async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let transport_id: TransportId = uuid::Uuid::new_v4().to_string();
    state.connections.fetch_add(1, Ordering::SeqCst);
    tracing::info!(transport_id = %transport_id, peer = %peer, "Client connected");
    let _ = state.events.send(ConnectionEvent::Opened {
        transport_id: transport_id.clone(),
        peer,
    });

    let (ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Packet>(state.outbound_queue.max(1));
    let cancel = state.shutdown.child_token();

    let writer = tokio::spawn(write_loop(
        ws_tx,
        outbound_rx,
        cancel.clone(),
        transport_id.clone(),
    ));

    let origin = Origin {
        transport: transport_id.clone(),
        outbound: outbound_tx,
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(transport_id = %transport_id, "Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(transport_id = %transport_id, error = %e, "WebSocket receive error");
                break;
            }
        };

        let packet = match Packet::decode(&text) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(transport_id = %transport_id, error = %e, "Dropping malformed packet");
                continue;
            }
        };

        if let Some(reply) = state.router.route(packet, &origin).await {
            if origin.outbound.send(reply).await.is_err() {
                break;
            }
        }
    }

    let sessions_closed = state.router.registry().close_transport(&transport_id).await;

    // Let the writer flush what is already queued, then stop it.
    drop(origin);
    cancel.cancel();
    if let Err(e) = writer.await {
        tracing::warn!(transport_id = %transport_id, error = %e, "Writer task failed");
    }

    state.connections.fetch_sub(1, Ordering::SeqCst);
    tracing::info!(
        transport_id = %transport_id,
        sessions_closed,
        "Client disconnected"
    );
    let _ = state.events.send(ConnectionEvent::Closed {
        transport_id,
        sessions_closed,
    });
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
    transport_id: TransportId,
) {
    loop {
        let packet = tokio::select! {
            biased;
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        // Output is never skipped: an unencodable packet ends the connection.
        let text = match packet.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(transport_id = %transport_id, error = %e, "Failed to encode packet, closing connection");
                cancel.cancel();
                break;
            }
        };

        if let Err(e) = ws_tx.send(Message::Text(text)).await {
            tracing::debug!(transport_id = %transport_id, error = %e, "WebSocket send failed");
            cancel.cancel();
            return;
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = ws_tx.close().await;
}
