use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quorate::config::{QuorateConfig, StoreBackend};
use quorate::error::RateLimitError;
use quorate::ratelimit::{RateLimitGate, Subject};
use quorate::store::{CounterStore, MemoryStore, RedisStore, RedisStoreConfig};

#[derive(Debug, Parser)]
#[command(name = "quorate", version, about = "Distributed request quota enforcement")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume one point for a subject and print the decision
    Check(SubjectArgs),
    /// Clear the counter of a subject's current tier
    Reset(SubjectArgs),
    /// Check the counter store is reachable
    Ping,
}

#[derive(Debug, clap::Args)]
struct SubjectArgs {
    /// Client IP address
    #[arg(long)]
    ip: IpAddr,

    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,
}

impl SubjectArgs {
    fn subject(&self) -> Subject {
        Subject {
            ip: self.ip,
            user_id: self.user.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = QuorateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    tokio::select! {
        result = run(cli.command, config) => result,
        _ = shutdown_signal() => {
            info!("Interrupted before the command completed");
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn connect_store(config: &QuorateConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => {
            let redis_config = RedisStoreConfig {
                key_prefix: config.store.key_prefix.clone(),
            };
            let store = RedisStore::connect_with_config(&config.store.url, redis_config)
                .await
                .with_context(|| format!("connecting to {}", config.store.url))?;
            Arc::new(store)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

async fn run(command: Command, config: QuorateConfig) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    store.ping().await.context("counter store health check")?;

    match command {
        Command::Ping => {
            println!("{}", json!({ "store": "ok" }));
        }
        Command::Check(args) => {
            let gate = RateLimitGate::from_config(&config, store)?;
            let report = match gate.check(&args.subject()).await {
                Ok(admission) => json!({
                    "allowed": true,
                    "tier": admission.tier,
                    "key": admission.key.to_string(),
                    "headers": header_map(admission.headers.to_headers()),
                }),
                Err(RateLimitError::QuotaExceeded(rejection)) => json!({
                    "allowed": false,
                    "status": rejection.status_code(),
                    "headers": header_map(rejection.to_headers()),
                    "body": rejection.body(),
                }),
                Err(e @ RateLimitError::Store(_)) => {
                    error!(error = %e, "Rate limit check failed");
                    return Err(e).context("rate limit check");
                }
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reset(args) => {
            let gate = RateLimitGate::from_config(&config, store)?;
            let selection = gate.reset(&args.subject()).await?;
            println!(
                "{}",
                json!({ "tier": selection.tier, "key": selection.key.to_string() })
            );
        }
    }
    Ok(())
}

fn header_map(headers: Vec<(&'static str, String)>) -> Value {
    let map: Map<String, Value> = headers
        .into_iter()
        .map(|(name, value)| (name.to_string(), Value::String(value)))
        .collect();
    Value::Object(map)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
