//! WebTerm Client
//!
//! Attaches the local terminal to a session on a WebTerm daemon. Press
//! Ctrl-] to detach.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use webterm_client::config::{DEFAULT_CREATE_TIMEOUT, DEFAULT_RECONNECT_ATTEMPTS};
use webterm_client::widget::terminal_size;
use webterm_client::{
    ClientConfig, ControlEvent, CrosstermWidget, ExitReason, RawModeGuard, SessionController,
    WebSocketTransport,
};
use webterm_protocol::Utf8StreamDecoder;

/// Byte sent by Ctrl-].
const DETACH_BYTE: u8 = 0x1d;

/// How long queued frames get to reach the server on exit.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebTerm - attach to a remote terminal session.
#[derive(Parser, Debug)]
#[command(name = "webterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// WebSocket URL of the daemon
    #[arg(default_value = "ws://127.0.0.1:8080/ws")]
    pub url: String,

    /// Consecutive failed connection attempts before giving up
    #[arg(long, default_value_t = DEFAULT_RECONNECT_ATTEMPTS)]
    pub reconnect_attempts: u32,

    /// Seconds to wait for the server to create the session
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_CREATE_TIMEOUT.as_secs())]
    pub create_timeout: u64,

    /// Write logs to this file (the terminal itself is left untouched)
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.url.clone())
            .with_reconnect_attempts(self.reconnect_attempts)
            .with_create_timeout(Duration::from_secs(self.create_timeout))
    }
}

fn init_logging(log_file: Option<&Path>, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    // Raw mode owns stdout, so logs only ever go to a file.
    let Some(path) = log_file else {
        return Ok(None);
    };

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "webterm_client={level},webterm_protocol={level},warn"
        ))
    });

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(Some(guard))
}

/// Reads raw stdin on a plain thread; blocking reads would otherwise pin a
/// runtime worker. Dropping the sender ends the session.
fn spawn_stdin_reader(control: mpsc::Sender<ControlEvent>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut decoder = Utf8StreamDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    break;
                }
            };

            let chunk = &buf[..n];
            let detach_at = chunk.iter().position(|&b| b == DETACH_BYTE);
            let text = decoder.decode(&chunk[..detach_at.unwrap_or(n)]);
            if !text.is_empty() && control.blocking_send(ControlEvent::Input(text)).is_err() {
                return;
            }
            if detach_at.is_some() {
                let _ = control.blocking_send(ControlEvent::Detach);
                return;
            }
        }
    });
}

/// Forwards SIGWINCH as resize events. Holds only a weak sender so the
/// control channel closes when stdin does.
async fn watch_resizes(control: mpsc::WeakSender<ControlEvent>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = signal(SignalKind::window_change()).context("Failed to watch SIGWINCH")?;
    while winch.recv().await.is_some() {
        let Some(control) = control.upgrade() else {
            break;
        };
        let (cols, rows) = terminal_size();
        if control.send(ControlEvent::Resize { cols, rows }).await.is_err() {
            break;
        }
    }
    std::future::pending().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_deref(), cli.verbose)?;

    let config = cli.client_config();
    let transport = WebSocketTransport::new(config.clone()).context("Invalid client options")?;
    tracing::info!("WebTerm client starting for {}", config.url);

    let (control_tx, control_rx) = mpsc::channel(256);
    let mut controller =
        SessionController::new(transport.clone(), CrosstermWidget::new(), &config);

    let raw_mode = RawModeGuard::enable().context("Failed to enable raw mode")?;
    transport.start();
    let resize_tx = control_tx.downgrade();
    spawn_stdin_reader(control_tx);

    let result = tokio::select! {
        result = controller.run(control_rx) => result.map_err(anyhow::Error::from),
        Err(e) = watch_resizes(resize_tx) => Err(e),
    };

    transport.close();
    if tokio::time::timeout(CLOSE_GRACE, transport.closed()).await.is_err() {
        tracing::debug!("Transport did not stop within {:?}", CLOSE_GRACE);
    }
    drop(raw_mode);

    match result? {
        ExitReason::Detached => eprintln!("Detached."),
        ExitReason::GaveUp => anyhow::bail!("could not reach {}", config.url),
        ExitReason::InputClosed => {}
    }
    Ok(())
}
