//! LLMGate proxy server binary.
//!
//! Loads configuration (YAML file, environment overrides, CLI flags),
//! wires up the pipeline, and serves the proxy plus its observability
//! surface. Background loops publish monitoring snapshots every five
//! seconds and sweep idle rate-limit buckets and expired cache entries
//! hourly.

use anyhow::Context;
use clap::{Parser, Subcommand};
use llmgate_core::{Clock, ProxyConfig, SystemClock};
use llmgate_proxy::classifier::HttpCompletionClient;
use llmgate_proxy::shutdown::{shutdown_signal, ShutdownCoordinator};
use llmgate_proxy::{build_router, config, events, AppState};
use llmgate_storage::StorageProfile;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Interval between resource sweeps (rate-limit buckets, cache entries).
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3_600);

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Transparent security proxy for LLM provider APIs.
#[derive(Parser)]
#[command(name = "llmgate-proxy", version, about, long_about = None)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(short, long, global = true, env = "LLMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override log output format (text, json).
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Subcommand to run. If omitted, starts the proxy server.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print resolved settings.
    Validate,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_and_merge_config(&cli)?;

    match cli.command {
        Some(Commands::Validate) => run_validate(&config),
        None => {
            init_logging(&config);
            config::validate_config(&config)?;
            run_proxy(config).await
        }
    }
}

/// Load configuration from file/defaults, then apply env and CLI overrides.
///
/// Precedence (highest wins): CLI flags, environment variables, config
/// file values, built-in defaults.
fn load_and_merge_config(cli: &Cli) -> anyhow::Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            // Logging isn't initialised yet — use eprintln for early diagnostics.
            eprintln!("Loading configuration from {}", path.display());
            config::load_config(path)?
        }
        None => ProxyConfig::default(),
    };

    config::apply_env_overrides(&mut config);

    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = &cli.log_format {
        config.logging.format.clone_from(format);
    }

    Ok(config)
}

fn run_validate(config: &ProxyConfig) -> anyhow::Result<()> {
    config::validate_config(config)?;
    println!("Configuration is valid.\n");
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Initialise structured logging. `RUST_LOG` wins over the config level.
fn init_logging(config: &ProxyConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

async fn run_proxy(config: ProxyConfig) -> anyhow::Result<()> {
    info!(
        port = config.port,
        storage_profile = %config.storage.profile,
        sanitize_mode = ?config.sanitize_mode,
        "Starting LLMGate proxy"
    );

    let profile = match config.storage.profile.as_str() {
        "memory" => StorageProfile::Memory,
        _ => StorageProfile::Lite {
            database_path: config.storage.database_path.clone(),
        },
    };
    let store = profile
        .build()
        .await
        .context("failed to initialise audit storage")?;

    let llm = Arc::new(HttpCompletionClient::new(&config.classifier)?);
    if !config.classifier.api_key.is_empty() {
        info!(model = %config.classifier.model, "Classification model configured");
    } else {
        warn!("No classifier credential configured; detection stages fail open");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let host = config.host.clone();
    let port = config.port;
    let shutdown_timeout = config.shutdown_timeout_seconds;

    let state = Arc::new(AppState::build(config, clock, llm, store)?);
    let app = build_router(state.clone());

    let listener = bind_with_probing(&host, port).await?;
    info!(addr = %listener.local_addr()?, "Proxy listening");

    // Background loops: snapshot publisher and resource sweeper.
    let coordinator = ShutdownCoordinator::new(shutdown_timeout);
    {
        let guard = coordinator.track_task();
        let state = state.clone();
        let token = coordinator.token();
        tokio::spawn(async move {
            events::run_monitor(state, token).await;
            drop(guard);
        });
    }
    {
        let guard = coordinator.track_task();
        let state = state.clone();
        let token = coordinator.token();
        tokio::spawn(async move {
            run_sweeper(state, token).await;
            drop(guard);
        });
    }
    tokio::spawn(shutdown_signal(coordinator.clone()));

    let serve_token = coordinator.token();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_token.cancelled().await })
    .await?;

    // Drain what's left: queued audit writes, then the background loops.
    state.audit.flush().await;
    if !coordinator.wait_for_tasks().await {
        warn!("Exiting with background tasks still pending");
    }
    info!("Proxy stopped");
    Ok(())
}

/// Bind the configured port, probing successive ports when taken.
async fn bind_with_probing(host: &str, port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    const MAX_PROBES: u16 = 10;

    for offset in 0..MAX_PROBES {
        let candidate = port
            .checked_add(offset)
            .context("port probe range overflowed")?;
        match tokio::net::TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if offset > 0 {
                    warn!(requested = port, bound = candidate, "Configured port was taken");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e).context(format!("failed to bind {host}:{candidate}")),
        }
    }
    anyhow::bail!("no free port in {port}..{}", port + MAX_PROBES)
}

/// Hourly sweep of idle rate-limit buckets and expired cache entries.
async fn run_sweeper(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let buckets = state.limiter.sweep();
        let entries = state.cache.evict_expired();
        info!(buckets, entries, "Resource sweep completed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
