//! Client session controller.
//!
//! One controller owns one terminal session on behalf of one widget:
//!
//! 1. when the transport connects it sends `create_terminal` with the
//!    widget's size and a session id, and subscribes to that id's output;
//! 2. input typed before the ack is queued and flushed in order once the
//!    session is `Active`;
//! 3. resizes are debounced and always deliver the final size;
//! 4. on teardown it sends `close_terminal` and unsubscribes.
//!
//! A failed or timed-out create moves the controller to `Error` and closes
//! the abandoned id. Every later create (retry or reconnect) uses a fresh id.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use webterm_protocol::messages::{CloseTerminal, CreateTerminal, ResizeTerminal, TerminalInput};
use webterm_protocol::{
    chunk_text, Ack, ClientEvent, ProtocolError, TerminalId, CREATE_TERMINAL, MAX_TEXT_CHUNK,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transport::{BoxFuture, ConnectionState, OutputReceiver, SessionTransport, TransportEvent};
use crate::widget::{Notice, TerminalWidget};

type CreateFuture = BoxFuture<'static, (TerminalId, Result<Ack>)>;

/// Generate a session id of the form `term-<unix millis>-<8 hex digits>`.
pub fn generate_terminal_id() -> TerminalId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("term-{millis}-{}", &suffix[..8])
}

/// Where the controller is in the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// No connection, or the session was torn down.
    Disconnected,
    /// `create_terminal` sent, waiting for the ack.
    Pending { id: TerminalId },
    /// The session accepts input.
    Active { id: TerminalId },
    /// The last create attempt failed.
    Error { message: String },
}

impl ControllerState {
    /// The session id while one is pending or active.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ControllerState::Pending { id } | ControllerState::Active { id } => Some(id),
            _ => None,
        }
    }
}

/// Commands from the local side of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Keystrokes or pasted text.
    Input(String),
    /// The widget changed size.
    Resize { cols: u16, rows: u16 },
    /// Try creating a session again after an error.
    Retry,
    /// Close the session and stop.
    Detach,
}

/// Why [`SessionController::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The user detached.
    Detached,
    /// The transport gave up reconnecting.
    GaveUp,
    /// The control channel closed.
    InputClosed,
}

/// Drives one terminal session over a [`SessionTransport`].
pub struct SessionController<T: SessionTransport + 'static, W: TerminalWidget> {
    transport: Arc<T>,
    events: broadcast::Receiver<TransportEvent>,
    widget: W,
    config: ClientConfig,
    id: TerminalId,
    /// Whether `id` has been sent in a create already.
    id_used: bool,
    state_tx: watch::Sender<ControllerState>,
    queued: VecDeque<String>,
    output: Option<OutputReceiver>,
    /// Size sent with the last create or resize.
    sent_size: (u16, u16),
    pending_resize: Option<(u16, u16)>,
    resize_deadline: Option<Instant>,
}

impl<T: SessionTransport + 'static, W: TerminalWidget> SessionController<T, W> {
    /// Creates a controller with a freshly generated session id.
    pub fn new(transport: Arc<T>, widget: W, config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Disconnected);
        let sent_size = widget.size();
        let events = transport.events();
        Self {
            transport,
            events,
            widget,
            config: config.clone(),
            id: generate_terminal_id(),
            id_used: false,
            state_tx,
            queued: VecDeque::new(),
            output: None,
            sent_size,
            pending_resize: None,
            resize_deadline: None,
        }
    }

    /// The id the next (or current) session uses.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        self.state_tx.borrow().clone()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// The widget the controller renders into.
    pub fn widget(&self) -> &W {
        &self.widget
    }

    fn set_state(&self, state: ControllerState) {
        tracing::debug!(state = ?state, "Controller state");
        self.state_tx.send_replace(state);
    }

    /// Run until detach, input close, or the transport gives up.
    pub async fn run(&mut self, mut control: mpsc::Receiver<ControlEvent>) -> Result<ExitReason> {
        let mut create: Option<CreateFuture> = None;
        // One automatic create per connection; later ones need a Retry.
        let mut started_on_connection = false;

        if self.transport.state() == ConnectionState::Connected {
            self.widget.notice(&Notice::Connected)?;
            create = Some(self.start_session());
            started_on_connection = true;
        }

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(TransportEvent::Connected) => {
                        // Buffered before run() when the initial check already started
                        if !started_on_connection {
                            self.widget.notice(&Notice::Connected)?;
                            create = Some(self.start_session());
                            started_on_connection = true;
                        }
                    }
                    Ok(TransportEvent::Disconnected { reason }) => {
                        create = None;
                        started_on_connection = false;
                        self.on_disconnected(&reason)?;
                    }
                    Ok(TransportEvent::ConnectError { message }) => {
                        self.widget.notice(&Notice::ConnectionError(message))?;
                    }
                    Ok(TransportEvent::GaveUp) => {
                        self.drop_session();
                        self.widget.notice(&Notice::GaveUp)?;
                        return Ok(ExitReason::GaveUp);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} transport events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.teardown().await;
                        return Ok(ExitReason::GaveUp);
                    }
                },
                (id, result) = create_result(&mut create) => {
                    create = None;
                    self.on_create_result(id, result).await?;
                }
                output = next_output(&mut self.output) => {
                    self.widget.write(&output)?;
                }
                _ = resize_timer(self.resize_deadline) => {
                    self.resize_deadline = None;
                    self.flush_resize().await;
                }
                command = control.recv() => match command {
                    Some(ControlEvent::Input(data)) => self.on_input(data).await,
                    Some(ControlEvent::Resize { cols, rows }) => self.on_resize(cols, rows),
                    Some(ControlEvent::Retry) => {
                        if matches!(self.state(), ControllerState::Error { .. })
                            && self.transport.state() == ConnectionState::Connected
                        {
                            create = Some(self.start_session());
                        }
                    }
                    Some(ControlEvent::Detach) => {
                        self.teardown().await;
                        return Ok(ExitReason::Detached);
                    }
                    None => {
                        self.teardown().await;
                        return Ok(ExitReason::InputClosed);
                    }
                },
            }
        }
    }

    fn start_session(&mut self) -> CreateFuture {
        if self.id_used {
            self.id = generate_terminal_id();
        }
        self.id_used = true;

        let id = self.id.clone();
        let (cols, rows) = self.widget.size();
        self.sent_size = (cols, rows);
        self.queued.clear();
        self.output = Some(self.transport.subscribe_output(&id));
        self.set_state(ControllerState::Pending { id: id.clone() });
        tracing::info!(terminal_id = %id, cols, rows, "Creating terminal session");

        let transport = Arc::clone(&self.transport);
        let timeout = self.config.create_timeout;
        let event = ClientEvent::CreateTerminal(CreateTerminal {
            terminal_id: id.clone(),
            cols,
            rows,
        });
        Box::pin(async move {
            let result = transport.request(event, timeout).await;
            (id, result)
        })
    }

    async fn on_create_result(&mut self, id: TerminalId, result: Result<Ack>) -> Result<()> {
        if self.state().session_id() != Some(id.as_str()) {
            tracing::debug!(terminal_id = %id, "Ignoring stale create result");
            return Ok(());
        }

        let error = match result {
            Ok(ack) if ack.success => {
                tracing::info!(terminal_id = %id, "Terminal session created");
                self.set_state(ControllerState::Active { id: id.clone() });
                while let Some(data) = self.queued.pop_front() {
                    self.send_input(&id, data).await;
                }
                let current = self.widget.size();
                if current != self.sent_size {
                    self.send_resize(&id, current).await;
                }
                return Ok(());
            }
            Ok(_) => ClientError::from(ProtocolError::AckRejected(CREATE_TERMINAL.to_string())),
            Err(e) => e,
        };

        tracing::warn!(terminal_id = %id, error = %error, "Failed to create terminal session");
        self.queued.clear();
        self.transport.unsubscribe_output(&id);
        self.output = None;
        self.set_state(ControllerState::Error {
            message: error.to_string(),
        });
        self.widget.notice(&Notice::CreateFailed)?;
        self.send_close(&id).await;
        Ok(())
    }

    fn on_disconnected(&mut self, reason: &str) -> Result<()> {
        tracing::info!(reason = %reason, "Transport disconnected");
        self.drop_session();
        self.widget.notice(&Notice::Disconnected)?;
        Ok(())
    }

    /// Forget the current session locally; the server closes it on its own.
    fn drop_session(&mut self) {
        if let Some(id) = self.state().session_id() {
            self.transport.unsubscribe_output(id);
        }
        self.output = None;
        self.queued.clear();
        self.pending_resize = None;
        self.resize_deadline = None;
        self.set_state(ControllerState::Disconnected);
    }

    async fn on_input(&mut self, data: String) {
        match self.state() {
            ControllerState::Active { id } => self.send_input(&id, data).await,
            ControllerState::Pending { id } => {
                if self.queued.len() >= self.config.pending_input_limit {
                    tracing::warn!(terminal_id = %id, "Input queue full, dropping input");
                } else {
                    self.queued.push_back(data);
                }
            }
            _ => tracing::debug!("No session, dropping input"),
        }
    }

    fn on_resize(&mut self, cols: u16, rows: u16) {
        self.pending_resize = Some((cols, rows));
        if self.resize_deadline.is_none() {
            self.resize_deadline = Some(Instant::now() + self.config.resize_debounce);
        }
    }

    async fn flush_resize(&mut self) {
        let Some(size) = self.pending_resize.take() else {
            return;
        };
        match self.state() {
            ControllerState::Active { id } => self.send_resize(&id, size).await,
            // Checked against the widget once the session is active
            _ => tracing::debug!(cols = size.0, rows = size.1, "No active session, holding resize"),
        }
    }

    /// Large pastes go out as several `terminal_input` packets.
    async fn send_input(&self, id: &str, input: String) {
        for chunk in chunk_text(&input, MAX_TEXT_CHUNK) {
            let event = ClientEvent::TerminalInput(TerminalInput {
                terminal_id: id.to_string(),
                input: chunk.to_string(),
            });
            if let Err(e) = self.transport.emit(event).await {
                tracing::warn!(terminal_id = %id, error = %e, "Failed to send input");
                return;
            }
        }
    }

    async fn send_resize(&mut self, id: &str, (cols, rows): (u16, u16)) {
        self.sent_size = (cols, rows);
        let event = ClientEvent::ResizeTerminal(ResizeTerminal {
            terminal_id: id.to_string(),
            cols,
            rows,
        });
        if let Err(e) = self.transport.emit(event).await {
            tracing::warn!(terminal_id = %id, error = %e, "Failed to send resize");
        }
    }

    async fn send_close(&self, id: &str) {
        let event = ClientEvent::CloseTerminal(CloseTerminal {
            terminal_id: id.to_string(),
        });
        if let Err(e) = self.transport.emit(event).await {
            tracing::debug!(terminal_id = %id, error = %e, "Failed to send close");
        }
    }

    /// Close the session on the server and stop listening for its output.
    pub async fn teardown(&mut self) {
        if let Some(id) = self.state().session_id().map(str::to_string) {
            self.send_close(&id).await;
            self.transport.unsubscribe_output(&id);
            tracing::info!(terminal_id = %id, "Terminal session closed");
        }
        self.output = None;
        self.queued.clear();
        self.set_state(ControllerState::Disconnected);
    }
}

async fn create_result(create: &mut Option<CreateFuture>) -> (TerminalId, Result<Ack>) {
    match create {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_output(output: &mut Option<OutputReceiver>) -> String {
    if let Some(rx) = output {
        if let Some(chunk) = rx.recv().await {
            return chunk;
        }
    }
    *output = None;
    std::future::pending().await
}

async fn resize_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
