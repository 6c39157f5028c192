//! Reconnecting WebSocket transport.
//!
//! This module provides the client half of the channel the daemon serves on
//! `/ws`:
//! - one JSON packet per text frame, sent in call order
//! - acknowledgement correlation by a monotonically increasing id
//! - per-session output listeners keyed by terminal id
//! - automatic reconnection with exponential backoff and heartbeat pings
//!
//! Lifecycle changes are broadcast as [`TransportEvent`]s. Requests still
//! waiting for an ack fail when the connection drops.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use webterm_protocol::{Ack, ClientEvent, Packet, ProtocolError, ServerEvent, TerminalId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Capacity of the outgoing frame queue.
const OUTGOING_QUEUE_SIZE: usize = 256;

/// Capacity of the lifecycle event channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Boxed future returned by [`SessionTransport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Output chunks for one terminal id.
pub type OutputReceiver = mpsc::UnboundedReceiver<String>;

/// Connection state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting to retry after a failure or disconnect.
    Reconnecting,
}

/// Lifecycle events emitted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection is open.
    Connected,
    /// An open connection was lost; a reconnect follows.
    Disconnected { reason: String },
    /// A connection attempt failed.
    ConnectError { message: String },
    /// Reconnect attempts are exhausted; the transport has stopped.
    GaveUp,
}

/// Operations the session controller needs from a transport.
///
/// This trait abstracts the channel so the controller can be driven by a
/// real WebSocket or by a mock in tests.
pub trait SessionTransport: Send + Sync {
    /// Sends an event without waiting for a reply.
    fn emit(&self, event: ClientEvent) -> BoxFuture<'_, Result<()>>;

    /// Sends an event and waits up to `timeout` for its acknowledgement.
    fn request(&self, event: ClientEvent, timeout: Duration) -> BoxFuture<'_, Result<Ack>>;

    /// Registers the output listener for `terminal_id`, replacing any
    /// previous one.
    fn subscribe_output(&self, terminal_id: &str) -> OutputReceiver;

    /// Removes the output listener for `terminal_id`.
    fn unsubscribe_output(&self, terminal_id: &str);

    /// Returns a receiver for lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Returns the current connection state.
    fn state(&self) -> ConnectionState;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// WebSocket implementation of [`SessionTransport`].
pub struct WebSocketTransport {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    /// Queue drained by the live connection, `None` while disconnected.
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    /// Requests waiting for an ack, by ack id.
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    /// Output listeners by terminal id.
    listeners: Mutex<HashMap<TerminalId, mpsc::UnboundedSender<String>>>,
    next_ack_id: AtomicU64,
    event_tx: broadcast::Sender<TransportEvent>,
    shutdown: CancellationToken,
    /// Cancelled once the connection loop has exited.
    stopped: CancellationToken,
}

impl WebSocketTransport {
    /// Creates a transport for `config`. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_ack_id: AtomicU64::new(1),
            event_tx,
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }))
    }

    /// Starts the connection loop in the background.
    pub fn start(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.run_connection_loop().await;
        });
    }

    /// Closes the connection and stops reconnecting.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the connection loop has stopped, after [`close`](Self::close)
    /// or after giving up.
    pub async fn closed(&self) {
        self.stopped.cancelled().await;
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn emit_event(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn run_connection_loop(self: Arc<Self>) {
        let mut failures = 0u32;
        let mut backoff = self.config.reconnect_delay;
        let mut first = true;

        loop {
            self.set_state(if first {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });
            first = false;

            tracing::info!("Connecting to {}", self.config.url);
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                connect_async(self.config.url.as_str()),
            );
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = attempt => result,
            };

            let failed = match result {
                Ok(Ok((ws, _))) => {
                    failures = 0;
                    backoff = self.config.reconnect_delay;

                    let reason = self.drive(ws).await;
                    self.on_connection_lost();
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    tracing::warn!("Connection lost: {}", reason);
                    self.emit_event(TransportEvent::Disconnected { reason });
                    false
                }
                Ok(Err(e)) => {
                    let message = ClientError::Connect(e.to_string()).to_string();
                    tracing::warn!("{}", message);
                    self.emit_event(TransportEvent::ConnectError { message });
                    true
                }
                Err(_) => {
                    let message = ClientError::Connect(format!(
                        "timed out after {:?}",
                        self.config.connect_timeout
                    ))
                    .to_string();
                    tracing::warn!("{}", message);
                    self.emit_event(TransportEvent::ConnectError { message });
                    true
                }
            };

            if failed {
                failures += 1;
                if failures > self.config.reconnect_attempts {
                    tracing::error!("Giving up after {} failed attempts", failures);
                    self.set_state(ConnectionState::Disconnected);
                    self.emit_event(TransportEvent::GaveUp);
                    break;
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            tracing::info!("Reconnecting in {:?}", backoff);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            if failed {
                backoff = self.config.next_backoff(backoff);
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.stopped.cancel();
        tracing::debug!("Transport stopped");
    }

    /// Pumps one open connection until it ends, returning why it ended.
    async fn drive(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> String {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTGOING_QUEUE_SIZE);
        *lock(&self.outgoing) = Some(tx);

        self.set_state(ConnectionState::Connected);
        self.emit_event(TransportEvent::Connected);
        tracing::info!("Connected to {}", self.config.url);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // Deliver what was queued before close, e.g. a final close_terminal
                    while let Ok(text) = rx.try_recv() {
                        let _ = sink.send(WsMessage::Text(text)).await;
                    }
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return "client closed".to_string();
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        return format!("send failed: {e}");
                    }
                }
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.config.heartbeat_interval + self.config.heartbeat_timeout {
                        return "heartbeat timeout".to_string();
                    }
                    if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                        return format!("ping failed: {e}");
                    }
                    tracing::trace!("Sent heartbeat ping");
                }
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text),
                    Some(Ok(WsMessage::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return "server closed connection".to_string();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return e.to_string(),
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match Packet::decode(text) {
            Ok(Packet::Ack { id, data }) => {
                let ack = serde_json::from_value::<Ack>(data).unwrap_or_else(|e| {
                    tracing::warn!(ack_id = id, error = %e, "Malformed ack payload");
                    Ack::failed()
                });
                match lock(&self.pending).remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(ack);
                    }
                    None => tracing::debug!(ack_id = id, "Ack for unknown request"),
                }
            }
            Ok(Packet::Event { event, data, .. }) => match ServerEvent::from_parts(&event, data) {
                Ok(ServerEvent::TerminalOutput {
                    terminal_id,
                    output,
                }) => {
                    let listeners = lock(&self.listeners);
                    match listeners.get(&terminal_id) {
                        Some(listener) => {
                            let _ = listener.send(output);
                        }
                        None => tracing::debug!(terminal_id = %terminal_id, "Output with no listener"),
                    }
                }
                Err(e) => tracing::debug!(event = %event, error = %e, "Ignoring server event"),
            },
            Err(e) => tracing::warn!(error = %e, "Dropping malformed frame"),
        }
    }

    fn on_connection_lost(&self) {
        *lock(&self.outgoing) = None;
        // Dropping the waiters fails every outstanding request.
        lock(&self.pending).clear();
    }

    /// Encodes before queueing so an oversized packet fails its sender.
    async fn send_packet(&self, packet: Packet) -> Result<()> {
        let text = packet.encode()?;
        let tx = lock(&self.outgoing).clone().ok_or(ClientError::NotConnected)?;
        tx.send(text)
            .await
            .map_err(|_| ClientError::connection_closed("outgoing queue closed"))
    }
}

impl SessionTransport for WebSocketTransport {
    fn emit(&self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let packet = event.to_packet(None)?;
            self.send_packet(packet).await
        })
    }

    fn request(&self, event: ClientEvent, timeout: Duration) -> BoxFuture<'_, Result<Ack>> {
        Box::pin(async move {
            let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
            let packet = event.to_packet(Some(id))?;

            let (tx, rx) = oneshot::channel();
            lock(&self.pending).insert(id, tx);

            if let Err(e) = self.send_packet(packet).await {
                lock(&self.pending).remove(&id);
                return Err(e);
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(_)) => Err(ClientError::connection_closed(
                    "connection lost before acknowledgement",
                )),
                Err(_) => {
                    lock(&self.pending).remove(&id);
                    Err(ProtocolError::Timeout(format!(
                        "{} not acknowledged within {:?}",
                        event.name(),
                        timeout
                    ))
                    .into())
                }
            }
        })
    }

    fn subscribe_output(&self, terminal_id: &str) -> OutputReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners).insert(terminal_id.to_string(), tx);
        rx
    }

    fn unsubscribe_output(&self, terminal_id: &str) {
        lock(&self.listeners).remove(terminal_id);
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }
}
