//! Fleet Agent Daemon
//!
//! Keeps an authenticated channel open to the engine, reports heartbeats
//! and runs commands pushed by the engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_agent::{executor, loadtest, AgentSession, WsConnector};
use fleet_core::config::{self, AgentConfig, ExecutorKind};
use fleet_core::traits::Connector;
use fleet_core::AgentIdentity;
use fleet_protocol::AgentId;

#[derive(Clone, Copy, ValueEnum)]
enum ExecutorArg {
    Shell,
    Echo,
}

#[derive(Parser)]
#[command(name = "fleet-agent")]
#[command(about = "Fleet agent - keeps a channel open to the engine")]
#[command(version)]
struct Args {
    /// Engine endpoint (e.g. ws://engine:7420/agent)
    #[arg(short, long)]
    engine: Option<String>,

    /// Agent identity
    #[arg(long)]
    agent_id: Option<String>,

    /// Agent secret key
    #[arg(long, env = "FLEET_AGENT_KEY", hide_env_values = true)]
    agent_key: Option<String>,

    /// Executor for remote commands
    #[arg(long, value_enum)]
    executor: Option<ExecutorArg>,

    /// Emulate a fleet: one session per `agent_id secret` line in this file
    #[arg(long, value_name = "CREDENTIALS_FILE")]
    load_test: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Fleet agent starting...");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_agent_config_path);

    let mut config: AgentConfig = config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    if let Some(engine) = args.engine {
        config.engine_url = engine;
    }
    if let Some(agent_id) = args.agent_id {
        config.agent_id = Some(AgentId::new(agent_id));
    }
    if let Some(agent_key) = args.agent_key {
        config.agent_key = Some(agent_key);
    }
    if let Some(executor) = args.executor {
        config.executor = match executor {
            ExecutorArg::Shell => ExecutorKind::Shell,
            ExecutorArg::Echo => ExecutorKind::Echo,
        };
    }

    let identities = match &args.load_test {
        Some(path) => {
            let identities = loadtest::load_identities(path)?;
            if identities.is_empty() {
                anyhow::bail!("No credentials found in {:?}", path);
            }
            tracing::info!("Load test: emulating {} agents", identities.len());
            identities
        }
        None => vec![config
            .identity()
            .context("Agent identity not configured (use --agent-id and FLEET_AGENT_KEY)")?],
    };

    run(config, identities).await
}

async fn run(config: AgentConfig, identities: Vec<AgentIdentity>) -> Result<()> {
    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(config.engine_url.clone()));
    let executor = executor::from_config(&config);
    let timings = config.session_timings();
    let single = identities.len() == 1;

    tracing::info!("Connecting to engine at {}", config.engine_url);

    let mut sessions = Vec::with_capacity(identities.len());
    for identity in identities {
        let session = AgentSession::new(
            identity,
            Arc::clone(&connector),
            Arc::clone(&executor),
            timings,
        );
        match session.start().await {
            Ok(()) => sessions.push(session),
            Err(e) if single => {
                return Err(e).context("Failed to connect to engine");
            }
            Err(e) => tracing::error!("Agent {} not started: {}", session.agent_id(), e),
        }
    }

    if sessions.is_empty() {
        anyhow::bail!("No agent session could be started");
    }
    tracing::info!("{} session(s) running", sessions.len());

    shutdown_signal().await;

    tracing::info!("Stopping {} session(s)...", sessions.len());
    futures::future::join_all(sessions.iter().map(|s| s.stop())).await;

    tracing::info!("Agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
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
}
