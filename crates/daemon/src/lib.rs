//! # WebTerm Daemon Library
//!
//! This crate provides the server side of WebTerm: browser and CLI clients
//! open a WebSocket, ask for terminal sessions by id, and stream keystrokes
//! and output over it.
//!
//! ## Overview
//!
//! - **Session Registry**: owns every terminal session and its lifecycle
//!   (`Pending` → `Active` → `Closing` → `Closed`), enforces unique ids and
//!   the session limit, and cleans up on disconnect
//! - **PTY Adapter**: spawns the shell on a native pseudo-terminal
//! - **Message Router**: applies `create_terminal`, `terminal_input`,
//!   `resize_terminal`, and `close_terminal` to the registry
//! - **Network**: `axum` server with the `/ws` endpoint, `/health`, and an
//!   optional static front-end
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │        axum server  (/ws, /health, static files)       │  │
//! │  └───────────────────────────┬────────────────────────────┘  │
//! │                              │ one task pair per socket      │
//! │  ┌───────────────────────────▼────────────────────────────┐  │
//! │  │                    Message Router                      │  │
//! │  └───────────────────────────┬────────────────────────────┘  │
//! │  ┌───────────────────────────▼────────────────────────────┐  │
//! │  │   Session Registry  ──  input/output pumps  ──  PTYs   │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use webterm_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`session`]: PTY adapter, session registry, and I/O pumps
//! - [`router`]: Event dispatch to the registry
//! - [`network`]: HTTP/WebSocket server
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod logging;
pub mod network;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use webterm_protocol as protocol;

pub use config::{Config, ConfigError};

pub use session::{
    NativePtyAdapter, PtyAdapter, PtyOutput, PtyProcess, SessionError, SessionId, SessionInfo,
    SessionRegistry, SessionState, TransportId,
};

pub use router::{MessageRouter, Origin, RouterError, RouterResult};

pub use network::{AppState, ConnectionEvent};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
