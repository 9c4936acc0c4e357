mod archive;
mod auth;
mod config;
mod coordination;
mod forge;
mod git;
mod health;
mod http;
mod metrics;
mod upload;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::upload::Uploader;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgedrop", about = "Publish uploaded zip archives as Gitea repositories")]
struct Cli {
    /// Path to the YAML configuration file.  Without one, settings are read
    /// from GITEA_URL, GITEA_TOKEN, GITEA_OWNER and friends.
    #[arg(short, long, env = "FORGEDROP_CONFIG")]
    config: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub uploader: Arc<Uploader>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr = state.config.server.listen.clone();
    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

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
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::config_from_env()?,
    };
    let config = Arc::new(config);

    tracing::info!(
        config_path = cli.config.as_deref().unwrap_or("<env>"),
        gitea = %config.gitea.url,
        owner = %config.gitea.owner,
        auth_enabled = config.credentials.api_key.is_some(),
        "starting forgedrop"
    );

    // ---- Sandbox root ----
    tokio::fs::create_dir_all(&config.sandbox.root)
        .await
        .with_context(|| {
            format!(
                "failed to create sandbox root: {}",
                config.sandbox.root.display()
            )
        })?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Forge backend ----
    let forge: Arc<dyn forge::ForgeBackend> = Arc::from(forge::build_backend(&config)?);
    let sync: Arc<dyn git::SyncBackend> = Arc::new(git::GitCli::from_config(&config));

    // ---- App state ----
    let uploader = Uploader::new(Arc::clone(&config), forge, sync, metrics.clone());
    let state = Arc::new(AppState {
        config,
        uploader: Arc::new(uploader),
        metrics,
    });

    run_http_server(state).await?;

    tracing::info!("forgedrop shut down cleanly");
    Ok(())
}
