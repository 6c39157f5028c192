//! PTY adapter.
//!
//! This module defines the contract the session engine needs from a
//! pseudo-terminal ([`PtyAdapter`] / [`PtyProcess`]) and the `portable-pty`
//! implementation used in production ([`NativePtyAdapter`]).
//!
//! Output is delivered on a bounded channel fed by a dedicated reader thread,
//! so a slow consumer applies backpressure to the PTY instead of dropping data.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::SessionConfig;

/// Client-chosen session identifier.
pub type SessionId = webterm_protocol::TerminalId;

/// Errors that can occur during session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A live or retired session already uses this id.
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session exists but is not accepting this operation.
    #[error("session not active: {0}")]
    NotActive(SessionId),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// The session's input queue is full because the PTY is not reading.
    #[error("input queue full for session: {0}")]
    InputQueueFull(SessionId),

    /// Failed to read from the PTY.
    #[error("failed to read from PTY: {0}")]
    ReadFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to tear the process down.
    #[error("failed to destroy session: {0}")]
    DestroyFailed(String),
}

/// One item of a PTY's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyOutput {
    /// Bytes emitted by the process, in emission order.
    Data(Vec<u8>),
    /// The process side hung up (shell exit).
    Exited,
    /// Reading failed.
    Failed(String),
}

/// Output stream returned by [`PtyAdapter::spawn`].
///
/// The stream ends after [`PtyOutput::Exited`] or [`PtyOutput::Failed`], or
/// when the process is destroyed.
pub type OutputStream = mpsc::Receiver<PtyOutput>;

/// A running PTY process.
///
/// All methods may block and are called from the blocking pool.
pub trait PtyProcess: Send + Sync {
    /// Process id of the shell, if known.
    fn pid(&self) -> Option<u32>;

    /// Write bytes to the process's input, verbatim.
    fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Change the terminal dimensions.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Terminate the process and reap it. Calling it twice is a no-op.
    fn destroy(&self) -> Result<(), SessionError>;
}

/// Factory for PTY processes.
pub trait PtyAdapter: Send + Sync {
    /// Spawn a shell sized `cols` x `rows`.
    fn spawn(
        &self,
        cols: u16,
        rows: u16,
    ) -> Result<(Arc<dyn PtyProcess>, OutputStream), SessionError>;
}

/// Capacity of the output channel between reader thread and pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Shell launch settings.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    /// Program to run.
    pub shell: String,
    /// Extra environment on top of the daemon's own.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Maximum bytes per read.
    pub read_buffer_size: usize,
}

impl From<&SessionConfig> for ShellOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: config.default_shell.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// `portable-pty` backed adapter.
#[derive(Debug, Clone)]
pub struct NativePtyAdapter {
    options: ShellOptions,
}

impl NativePtyAdapter {
    /// Create an adapter spawning shells with `options`.
    pub fn new(options: ShellOptions) -> Self {
        Self { options }
    }

    /// Create an adapter from the `[session]` configuration section.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(ShellOptions::from(config))
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.options.shell);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &self.options.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.options.cwd {
            cmd.cwd(dir);
        }
        cmd
    }
}

impl PtyAdapter for NativePtyAdapter {
    fn spawn(
        &self,
        cols: u16,
        rows: u16,
    ) -> Result<(Arc<dyn PtyProcess>, OutputStream), SessionError> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(self.command())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The master must see EOF once the shell exits.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let process = Arc::new(NativePtyProcess {
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            destroyed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let buffer_size = self.options.read_buffer_size.max(1);
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or(0)))
            .spawn(move || read_loop(reader, tx, buffer_size));

        if let Err(e) = spawned {
            let _ = process.destroy();
            return Err(SessionError::SpawnFailed(e.to_string()));
        }

        tracing::debug!(
            pid = ?pid,
            shell = %self.options.shell,
            cols = cols,
            rows = rows,
            "Spawned PTY process"
        );

        Ok((process, rx))
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Blocking read loop feeding the output channel.
fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<PtyOutput>, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let item = match reader.read(&mut buffer) {
            Ok(0) => PtyOutput::Exited,
            Ok(n) => PtyOutput::Data(buffer[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once every slave fd is closed.
            Err(e) if is_hangup(&e) => PtyOutput::Exited,
            Err(e) => PtyOutput::Failed(e.to_string()),
        };

        let last = !matches!(item, PtyOutput::Data(_));
        if tx.blocking_send(item).is_err() || last {
            break;
        }
    }
    tracing::trace!("PTY reader finished");
}

#[cfg(unix)]
fn is_hangup(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

#[cfg(not(unix))]
fn is_hangup(_err: &std::io::Error) -> bool {
    false
}

struct NativePtyProcess {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    destroyed: AtomicBool,
}

impl PtyProcess for NativePtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SessionError::WriteFailed("process destroyed".to_string()));
        }

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SessionError::WriteFailed("writer lock poisoned".to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self
            .master
            .lock()
            .map_err(|_| SessionError::ResizeFailed("master lock poisoned".to_string()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn destroy(&self) -> Result<(), SessionError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            hangup_process_group(pid);
        }

        let mut child = self
            .child
            .lock()
            .map_err(|_| SessionError::DestroyFailed("child lock poisoned".to_string()))?;

        if let Err(e) = child.kill() {
            // Already gone after the hangup.
            tracing::trace!(pid = ?self.pid, error = %e, "Kill after hangup failed");
        }

        let status = child
            .wait()
            .map_err(|e| SessionError::DestroyFailed(e.to_string()))?;

        tracing::debug!(pid = ?self.pid, exit_code = status.exit_code(), "PTY process reaped");
        Ok(())
    }
}

/// Send SIGHUP to the shell's process group, as a terminal hangup would.
#[cfg(unix)]
fn hangup_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGHUP) {
        tracing::trace!(pid = pid, error = %e, "SIGHUP to process group failed");
    }
}
