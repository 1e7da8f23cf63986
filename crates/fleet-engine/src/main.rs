//! Fleet Engine Daemon
//!
//! Accepts agent channels on `/agent` and serves the admin routes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_core::config::{self, EngineConfig};
use fleet_core::traits::CredentialStore;
use fleet_engine::auth::KeyStore;
use fleet_engine::{EngineServer, EngineState};
use fleet_protocol::AgentId;

#[derive(Parser)]
#[command(name = "fleet-engine")]
#[command(about = "Fleet engine daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine
    Serve {
        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Run in foreground with verbose output
        #[arg(short, long)]
        foreground: bool,
    },

    /// Issue a new agent identity and print its secret
    ///
    /// Edits the keys file directly. A running engine only sees the change
    /// after a restart; use `POST /keys` against it instead.
    IssueKey {
        /// Keys file (overrides config)
        #[arg(long)]
        keys_file: Option<PathBuf>,
    },

    /// Revoke an agent identity
    ///
    /// Edits the keys file directly. Use `DELETE /keys/{id}` to revoke on a
    /// running engine.
    RevokeKey {
        /// Agent to revoke
        agent_id: String,

        /// Keys file (overrides config)
        #[arg(long)]
        keys_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let foreground = matches!(args.command, Command::Serve { foreground: true, .. });
    let log_level = if foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Serve { bind, .. } => serve(config, bind).await,
        Command::IssueKey { keys_file } => {
            let store = KeyStore::open(keys_file.unwrap_or(config.credentials_path))?;
            let identity = store.issue().await?;
            println!("agent_id: {}", identity.id);
            println!("agent_key: {}", identity.secret_key);
            eprintln!("The key is not stored and cannot be shown again.");
            Ok(())
        }
        Command::RevokeKey {
            agent_id,
            keys_file,
        } => {
            let store = KeyStore::open(keys_file.unwrap_or(config.credentials_path))?;
            if store.revoke(&AgentId::new(&agent_id)).await? {
                println!("Revoked {}", agent_id);
            } else {
                anyhow::bail!("Unknown agent: {}", agent_id);
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_engine_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            EngineConfig::default()
        }))
    } else {
        tracing::info!("No engine config found, using defaults");
        Ok(EngineConfig::default())
    }
}

async fn serve(mut config: EngineConfig, bind: Option<String>) -> Result<()> {
    tracing::info!("Fleet engine starting...");

    if let Some(bind) = bind {
        config.bind_address = bind;
    }

    let keys = KeyStore::open(&config.credentials_path)?;
    if keys.is_empty() {
        tracing::warn!("No agent keys configured - all connections will be rejected");
    } else {
        tracing::info!("Loaded {} agent keys", keys.len());
    }

    let state = Arc::new(EngineState::with_credentials(config, Arc::new(keys)));
    spawn_signal_handler(state.shutdown.clone());

    EngineServer::new(Arc::clone(&state)).run().await?;

    tracing::info!("Engine shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Ctrl+C received, stopping");
            }
            _ = terminate => {
                tracing::info!("SIGTERM received, stopping");
            }
        }

        cancel.cancel();
    });
}
