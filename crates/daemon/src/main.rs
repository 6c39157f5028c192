//! WebTerm Daemon
//!
//! Serves terminal sessions to browser and CLI clients over WebSocket.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use webterm_daemon::config::{default_config_path, Config};
use webterm_daemon::logging::{effective_level, init_logging};
use webterm_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};

/// WebTerm Daemon - terminal sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "webterm-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving terminal sessions
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Directory with the web front-end to serve
        #[arg(long, value_name = "DIR")]
        static_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve { bind, static_dir } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(dir) = static_dir {
                config.server.static_dir = Some(dir);
            }
            config.validate().context("Invalid configuration")?;

            let level = effective_level(&config.daemon.log_level, cli.verbose).to_string();
            let _guard = init_logging(&level, config.daemon.log_dir.as_deref())?;

            tracing::info!("WebTerm daemon starting...");
            tracing::info!("Using config file: {}", config_path.display());

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run(&mut orchestrator).await
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Run until SIGTERM or SIGINT, then shut down gracefully.
async fn run(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected { transport_id, peer } => {
                    tracing::debug!("Client {} connected from {}", transport_id, peer);
                }
                OrchestratorEvent::ClientDisconnected {
                    transport_id,
                    sessions_closed,
                } => {
                    tracing::debug!(
                        "Client {} disconnected ({} sessions closed)",
                        transport_id,
                        sessions_closed
                    );
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
