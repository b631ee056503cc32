// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SQRL Authentication Server
//!
//! Entry point for the `sqrl-node` binary. Parses CLI arguments, builds the
//! protocol configuration and stores, and serves the HTTP API plus a
//! Prometheus metrics endpoint.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the authentication server
//! - `status`  — query a running server's health endpoint
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use sqrl_protocol::codec::NonceCodec;
use sqrl_protocol::storage::SqrlDb;
use sqrl_protocol::store::{MemoryStore, NutBackend};
use sqrl_protocol::SqrlConfig;

use cli::{Commands, SqrlNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SqrlNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_server(args).await,
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the authentication server: API listener and metrics listener.
async fn run_server(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "sqrl_node=info,sqrl_protocol=info,tower_http=warn",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let config = SqrlConfig {
        secure: !args.insecure,
        domain: args.domain.clone(),
        authentication_path: args.auth_path.clone(),
        anon_allowed: !args.disallow_anon,
        nonce_max_age_minutes: args.nonce_max_age,
        nonce_salt: args.nonce_salt.clone(),
        friendly_name: args.friendly_name.clone(),
        ..SqrlConfig::default()
    };

    if config.nonce_salt == "change-me" {
        tracing::warn!(
            "running with the default nonce salt — every nut this server \
             mints is predictable; set --nonce-salt before exposing this"
        );
    }

    tracing::info!(
        listen_port = args.listen_port,
        metrics_port = args.metrics_port,
        domain = %config.domain,
        stateless = args.stateless,
        ephemeral = args.ephemeral,
        "starting sqrl-node"
    );

    // --- Stores ---
    let app_state = if args.ephemeral {
        let store = Arc::new(MemoryStore::new());
        build_state(&config, store.clone(), store, args.stateless)
    } else {
        let db_path = args.data_dir.join("db");
        std::fs::create_dir_all(&db_path)
            .with_context(|| format!("failed to create data directory: {}", db_path.display()))?;
        let db = Arc::new(
            SqrlDb::open(&db_path)
                .with_context(|| format!("failed to open database at {}", db_path.display()))?,
        );
        tracing::info!(path = %db_path.display(), "database opened");
        build_state(&config, db.clone(), db, args.stateless)
    };

    // --- API server ---
    let api_router = api::create_router(app_state.clone());
    let api_addr = format!("0.0.0.0:{}", args.listen_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&app_state.metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(
            api_listener,
            api_router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        ) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    tracing::info!("sqrl-node stopped");
    Ok(())
}

/// Wires the shared application state from a pair of store handles (the
/// same object serves both capabilities for our storage engines).
fn build_state<I, S>(
    config: &SqrlConfig,
    identities: Arc<I>,
    nonce_store: Arc<S>,
    stateless: bool,
) -> api::AppState
where
    I: sqrl_protocol::store::IdentityStore + 'static,
    S: sqrl_protocol::store::NonceStore + sqrl_protocol::store::SessionStore + 'static,
{
    let backend = if stateless {
        NutBackend::Stateless(NonceCodec::new(&config.nonce_salt, nonce_store))
    } else {
        NutBackend::stateful(nonce_store)
    };
    api::AppState {
        config: config.clone(),
        identities,
        backend,
        verifier: Arc::new(sqrl_protocol::crypto::Ed25519Verifier),
        metrics: Arc::new(NodeMetrics::new()),
    }
}

/// Queries a running server's health endpoint and prints the body.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let body = http_get(&format!("{}/health", args.url.trim_end_matches('/'))).await?;
    println!("{}", body);
    Ok(())
}

/// Minimal HTTP/1.1 GET over a raw TCP stream — enough for the status
/// subcommand without pulling in an HTTP client dependency.
async fn http_get(url: &str) -> Result<String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow::anyhow!("only http:// URLs are supported: {}", url))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let addr = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    };

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, authority,
    );
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    // Everything after the first blank line is the body.
    Ok(response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_else(|| response.to_string()))
}

/// Prints version information to stdout.
fn print_version() {
    println!("sqrl-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol  {}",
        sqrl_protocol::config::PROTOCOL_VERSION
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
