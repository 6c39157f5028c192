//! # WebTerm Client Library
//!
//! Attaches a local terminal widget to a session on a WebTerm daemon.
//!
//! ## Overview
//!
//! - **Transport**: [`WebSocketTransport`] keeps one WebSocket to the daemon
//!   open, reconnecting with exponential backoff, and correlates
//!   acknowledgements with their requests.
//! - **Controller**: [`SessionController`] runs the session lifecycle on top
//!   of any [`SessionTransport`]: create, queued input, debounced resize,
//!   teardown.
//! - **Widget**: [`TerminalWidget`] is where output and status notices go;
//!   [`CrosstermWidget`] renders into the local terminal.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tokio::sync::mpsc;
//! use webterm_client::{ClientConfig, CrosstermWidget, SessionController, WebSocketTransport};
//!
//! # async fn example() -> webterm_client::Result<()> {
//! let config = ClientConfig::new("ws://127.0.0.1:8080/ws");
//! let transport = WebSocketTransport::new(config.clone())?;
//! transport.start();
//!
//! let (control_tx, control_rx) = mpsc::channel(64);
//! let mut controller = SessionController::new(transport.clone(), CrosstermWidget::new(), &config);
//! # drop(control_tx);
//! let reason = controller.run(control_rx).await?;
//! transport.close();
//! # let _ = reason;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod transport;
pub mod widget;

pub use webterm_protocol as protocol;

pub use config::ClientConfig;
pub use controller::{
    generate_terminal_id, ControlEvent, ControllerState, ExitReason, SessionController,
};
pub use error::{ClientError, Result};
pub use transport::{ConnectionState, SessionTransport, TransportEvent, WebSocketTransport};
pub use widget::{CrosstermWidget, Notice, RawModeGuard, TerminalWidget};
