//! mcp-gate -- policy gateway in front of an HTTP application exposed to MCP.
//!
//! This is the application entry point. It wires together:
//!   - Configuration loading
//!   - Gateway lifecycle (request gate + usage ledger)
//!   - Optional SQLite usage audit log and record retention
//!   - Upstream forwarding
//!   - Graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use mcp_gate::build_gateway;
use mcp_gate::config::Config;
use mcp_gate::db::Database;
use mcp_gate::exposure::RouteManifest;
use mcp_gate::ledger::{spawn_audit_logger, spawn_retention_sweeper};
use mcp_gate::lifecycle::GatewayLifecycle;
use mcp_gate::upstream::UpstreamClient;

/// How long to wait for the audit logger to drain after the server stops.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: PathBuf,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = PathBuf::from("mcp-gate.toml");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = PathBuf::from(path);
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("mcp-gate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
mcp-gate {version} -- MCP route policy gateway

USAGE:
    mcp-gate [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: mcp-gate.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    MCP_GATE_CONFIG        Alternative to --config flag
    MCP_GATE_*             Override individual settings
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();

    let config_path = std::env::var("MCP_GATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or(cli.config_path);

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting mcp-gate"
    );
    for (key, var) in config.env_overrides.all() {
        tracing::debug!(setting = %key, env = %var, "Setting overridden by environment");
    }

    // 4. Gateway lifecycle, with the audit log if configured
    let mut lifecycle = GatewayLifecycle::from_config(&config)?;

    let audit_handle = match &config.ledger.audit_db_path {
        Some(path) => {
            let db = Database::open(path)?;
            tracing::info!(path = %path.display(), "Usage audit database opened");
            let (audit_tx, audit_rx) = tokio::sync::mpsc::unbounded_channel();
            lifecycle = lifecycle.with_audit_sink(audit_tx);
            Some(spawn_audit_logger(db, audit_rx))
        }
        None => None,
    };

    // 5. Upstream client
    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
    tracing::info!(upstream = %upstream.base(), "Forwarding admitted requests upstream");

    // 6. Build and mount the application
    let manifest = RouteManifest::new(env!("CARGO_PKG_NAME"));
    let app = with_transport_layers(build_gateway(&lifecycle, upstream, &manifest), &config);

    // 7. Record retention
    let sweeper = match config.ledger.retention() {
        Some(window) => {
            let every = config.ledger.sweep_interval();
            tracing::info!(
                retention_secs = window.as_secs(),
                sweep_interval_secs = every.as_secs(),
                "Usage record retention enabled"
            );
            Some(spawn_retention_sweeper(lifecycle.ledger()?, window, every))
        }
        None => None,
    };

    // 8. Bind and serve
    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    println!();
    println!("  mcp-gate v{} is running", env!("CARGO_PKG_VERSION"));
    println!("  Gateway:  http://{listen_addr}/");
    println!("  Manifest: http://{listen_addr}{}", RouteManifest::PATH);
    println!("  Health:   http://{listen_addr}/health");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 9. Cleanup
    tracing::info!("Shutting down gracefully");
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    let summary = lifecycle.ledger()?.summary();
    tracing::info!(
        requests = summary.total_requests,
        cost_usd = %format!("${:.6}", summary.total_cost_usd),
        "Final usage"
    );

    // Dropping the lifecycle drops the ledger and with it the last audit
    // sender, so the logger drains and exits.
    drop(lifecycle);
    if let Some(handle) = audit_handle {
        if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, handle).await.is_err() {
            tracing::warn!("Audit logger did not drain before timeout");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Global middleware stack applied outside the request gate.
fn with_transport_layers(app: Router, config: &Config) -> Router {
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    app.layer(propagate_id)
        .layer(request_id)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(config))
}

/// Build the CORS layer from config.
fn build_cors_layer(config: &Config) -> CorsLayer {
    if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("mcp_gate={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
