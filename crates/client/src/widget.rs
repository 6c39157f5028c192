//! Terminal widget seam.
//!
//! The controller renders into anything implementing [`TerminalWidget`]. The
//! `webterm` binary uses [`CrosstermWidget`], which writes straight to the
//! local terminal in raw mode.

use std::io::{self, Write};

use crossterm::terminal;

/// Size reported when the local terminal cannot be queried.
const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Status lines shown to the user between session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The transport connected.
    Connected,
    /// The transport dropped and is reconnecting.
    Disconnected,
    /// A connection attempt failed.
    ConnectionError(String),
    /// The session could not be created.
    CreateFailed,
    /// Reconnect attempts are exhausted.
    GaveUp,
}

impl Notice {
    /// ANSI-colored text for the notice, framed by line breaks.
    pub fn render(&self) -> String {
        match self {
            Notice::Connected => "\x1b[1;32mConnected to server!\x1b[0m\r\n".to_string(),
            Notice::Disconnected => {
                "\r\n\x1b[31mDisconnected from server. Trying to reconnect...\x1b[0m\r\n"
                    .to_string()
            }
            Notice::ConnectionError(message) => format!(
                "\r\n\x1b[31mConnection error. Please check if the server is running.\x1b[0m\r\n\
                 \x1b[31mError: {message}\x1b[0m\r\n"
            ),
            Notice::CreateFailed => {
                "\r\n\x1b[31mFailed to create terminal session.\x1b[0m\r\n".to_string()
            }
            Notice::GaveUp => {
                "\r\n\x1b[31mCould not reach the server. Giving up.\x1b[0m\r\n".to_string()
            }
        }
    }
}

/// Where session output and notices are displayed.
pub trait TerminalWidget: Send {
    /// Current size as `(cols, rows)`.
    fn size(&self) -> (u16, u16);

    /// Writes session output verbatim.
    fn write(&mut self, output: &str) -> io::Result<()>;

    /// Shows a status notice.
    fn notice(&mut self, notice: &Notice) -> io::Result<()> {
        self.write(&notice.render())
    }
}

/// Widget backed by the process's own terminal.
#[derive(Debug, Default)]
pub struct CrosstermWidget;

impl CrosstermWidget {
    /// Creates a widget writing to stdout.
    pub fn new() -> Self {
        Self
    }
}

impl TerminalWidget for CrosstermWidget {
    fn size(&self) -> (u16, u16) {
        terminal_size()
    }

    fn write(&mut self, output: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(output.as_bytes())?;
        stdout.flush()
    }
}

/// Size of the local terminal, or 80x24 when it cannot be queried.
pub fn terminal_size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => FALLBACK_SIZE,
    }
}

/// Keeps the local terminal in raw mode until dropped.
#[derive(Debug)]
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Switches the terminal to raw mode.
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!("Failed to restore terminal mode: {}", e);
        }
    }
}
