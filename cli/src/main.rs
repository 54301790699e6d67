//! hostgate: host-side HTTP gateway for stdio MCP servers.
//!
//! Two subcommands:
//! - `hostgate serve`: start the managed servers and the authenticated HTTP endpoint
//! - `hostgate check`: validate a config file and print what it would run

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostgate::{
    AppState, AuthGuard, GatewayConfig, GatewayMetrics, GatewayRegistry, TelemetryConfig,
    init_telemetry, router,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CONFIG_CANDIDATES: [&str; 2] = ["hostgate.json", "hostgate.toml"];

/// hostgate: expose local stdio MCP servers over one authenticated HTTP endpoint.
#[derive(Parser)]
#[command(name = "hostgate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the managed servers and serve the gateway
    Serve {
        /// Path to the config file [default: ./hostgate.json, ./hostgate.toml or <config dir>/hostgate/hostgate.json]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Bind address, overriding `bind_host`
        #[arg(long)]
        host: Option<String>,
        /// Port, overriding `bind_port`
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate a config file without starting anything
    Check {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let config_path = resolve_config(config)?;
            run_serve(config_path, host, port).await?;
        }
        Commands::Check { config } => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(std::io::stderr)
                .init();
            let config_path = resolve_config(config)?;
            run_check(&config_path).await?;
        }
    }

    Ok(())
}

async fn run_serve(config_path: PathBuf, host: Option<String>, port: Option<u16>) -> Result<()> {
    let telemetry_config = TelemetryConfig::from_env()?;
    let telemetry = init_telemetry(&telemetry_config)?;

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_opentelemetry::layer().with_tracer(telemetry.tracer()))
        .init();

    let mut config = GatewayConfig::load(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(host) = host {
        config.bind_host = host;
    }
    if let Some(port) = port {
        config.bind_port = port;
    }

    let metrics = GatewayMetrics::new();
    let auth = AuthGuard::from_config(&config, metrics.clone())?;
    let registry = Arc::new(GatewayRegistry::from_config(&config, metrics));
    registry.start_autostart().await;

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down hostgate...");
        cancel_for_signal.cancel();
    });

    let app = router(AppState::new(registry.clone(), auth));
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    tracing::info!(
        addr = %addr,
        servers = ?registry.server_ids(),
        "hostgate listening"
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await;

    registry.shutdown().await;
    if let Err(e) = telemetry.shutdown() {
        tracing::warn!(error = %e, "telemetry flush failed");
    }
    served.context("HTTP server error")?;

    tracing::info!("hostgate stopped");
    Ok(())
}

async fn run_check(config_path: &Path) -> Result<()> {
    let config = GatewayConfig::load(config_path)
        .await
        .with_context(|| format!("invalid config {}", config_path.display()))?;

    println!("config OK: {}", config_path.display());
    println!("  listen:          {}", config.bind_addr());
    println!("  allowed clients: {}", config.allowed_clients.join(", "));
    println!("  request timeout: {:.1}s", config.request_timeout_secs);
    println!("  restart backoff: {:.1}s", config.restart_backoff_secs);
    for server in &config.servers {
        println!(
            "  - {} ({}, autostart={}): {} {}",
            server.server_id,
            server.restart_policy.as_str(),
            server.autostart,
            server.command,
            server.args.join(" ")
        );
    }
    Ok(())
}

fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    for candidate in CONFIG_CANDIDATES {
        let local = Path::new(candidate);
        if local.exists() {
            return Ok(local.to_path_buf());
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join("hostgate").join("hostgate.json");
        if user.exists() {
            return Ok(user);
        }
    }

    anyhow::bail!(
        "no config file found; pass --config or create ./hostgate.json \
         (or <config dir>/hostgate/hostgate.json)"
    )
}
