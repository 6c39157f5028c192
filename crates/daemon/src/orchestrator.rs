//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! registry, the message router, and the HTTP/WebSocket server, and drives
//! them through start and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::network::{create_router, serve, AppState, ConnectionEvent};
use crate::router::MessageRouter;
use crate::session::{NativePtyAdapter, PtyAdapter, SessionRegistry};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client opened a WebSocket.
    ClientConnected { transport_id: String, peer: SocketAddr },
    /// A client went away; its sessions were closed.
    ClientDisconnected {
        transport_id: String,
        sessions_closed: usize,
    },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Live terminal sessions.
    registry: Arc<SessionRegistry>,
    /// Message router.
    router: MessageRouter,
    /// Address the server is listening on, once started.
    local_addr: Option<SocketAddr>,
    /// Server task.
    server_task: RwLock<Option<JoinHandle<()>>>,
    /// Shared server state, kept for connection counts.
    app_state: Option<AppState>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator spawning native PTYs.
    pub fn new(config: Config) -> Result<Self> {
        let adapter = Arc::new(NativePtyAdapter::from_config(&config.session));
        Self::with_adapter(config, adapter)
    }

    /// Creates an orchestrator around a custom PTY adapter.
    pub fn with_adapter(config: Config, adapter: Arc<dyn PtyAdapter>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let registry = SessionRegistry::new(adapter, config.session.max_sessions);
        let router = MessageRouter::new(Arc::clone(&registry));
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            router,
            local_addr: None,
            server_task: RwLock::new(None),
            app_state: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let bind_addr = self.config.bind_addr()?;
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("failed to bind {bind_addr}: {e}"),
                });
                return Err(e).with_context(|| format!("Failed to bind {bind_addr}"));
            }
        };
        self.local_addr = Some(listener.local_addr()?);

        let app_state = AppState::new(
            self.router.clone(),
            self.config.server.outbound_queue,
            self.shutdown_token.clone(),
        );
        self.spawn_event_forwarder(app_state.events.subscribe());

        let app = create_router(app_state.clone(), self.config.server.static_dir.as_deref());
        self.app_state = Some(app_state);

        let token = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = serve(listener, app, token).await {
                warn!("Server error: {}", e);
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        });
        *self.server_task.write().await = Some(handle);

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    fn spawn_event_forwarder(&self, mut events: broadcast::Receiver<ConnectionEvent>) {
        let event_tx = self.event_tx.clone();
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Ok(ConnectionEvent::Opened { transport_id, peer }) => {
                        OrchestratorEvent::ClientConnected { transport_id, peer }
                    }
                    Ok(ConnectionEvent::Closed {
                        transport_id,
                        sessions_closed,
                    }) => OrchestratorEvent::ClientDisconnected {
                        transport_id,
                        sessions_closed,
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Connection event forwarder lagged by {} events", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let _ = event_tx.send(event);
            }
        });
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Connections receive a close frame and every session is destroyed.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(handle) = self.server_task.write().await.take() {
            if let Err(e) = handle.await {
                warn!("Server task failed: {}", e);
            }
        }

        let closed = self.registry.close_all().await;
        debug!("Closed {} sessions", closed);

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the message router.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.app_state
            .as_ref()
            .map(AppState::connection_count)
            .unwrap_or(0)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
