//! tutor-activation - Main entry point
//!
//! HTTP service for subscription activation reconciliation: payment
//! confirmations, identity provider callbacks, the user retry/banner surface
//! and the operator recovery tool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tutor_activation::config::{BindAddress, RuntimeSettings, MODULE_NAME};
use tutor_activation::pending::FilePendingStore;
use tutor_activation::{build_router, AppState};
use tutor_common::config::{
    default_config_path, load_toml_config, write_toml_config, RootFolderInitializer,
    RootFolderResolver,
};
use tutor_common::db::init_database;
use tutor_common::EventBus;

/// Command-line arguments for tutor-activation
#[derive(Parser, Debug)]
#[command(name = "tutor-activation")]
#[command(about = "Subscription activation reconciliation service")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "TUTOR_ACTIVATION_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Root folder holding the database and pending intents
    #[arg(short, long, env = "TUTOR_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Bootstrap TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(MODULE_NAME));
    let toml_config = load_toml_config(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    // Initialize tracing
    let level = toml_config.logging.level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "tutor_activation={level},tutor_common={level},tower_http={level}"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting {} (version {}, built {} profile)",
        MODULE_NAME,
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" }
    );

    if !config_path.exists() {
        match write_toml_config(&toml_config, &config_path) {
            Ok(()) => info!("Wrote default config to {}", config_path.display()),
            Err(e) => tracing::warn!("Could not write default config {}: {}", config_path.display(), e),
        }
    }

    // Resolve root folder: CLI > env > TOML > OS default
    let bind = BindAddress::resolve(args.host.clone(), args.port, &toml_config);
    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone())
        .with_toml(toml_config)
        .resolve();

    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to create root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let db_path = initializer.database_path();
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    info!("Database: {}", db_path.display());

    let settings = RuntimeSettings::load(&pool)
        .await
        .context("Failed to load runtime settings")?;

    let pending = FilePendingStore::open(initializer.root_folder().join(FilePendingStore::FILE_NAME))
        .await
        .context("Failed to open pending activation store")?;
    info!("Pending activations: {}", pending.path().display());

    let state = AppState::new(pool, Arc::new(pending), EventBus::new(256), settings);
    let shutdown = state.shutdown.clone();

    // Pick up intents stalled by an outage or a previous shutdown
    let reconciler = state.reconciler.clone();
    let sweep_cancel = shutdown.child_token();
    tokio::spawn(async move {
        if let Err(e) = reconciler.resume_outstanding(&sweep_cancel).await {
            tracing::warn!("Startup activation sweep failed: {}", e);
        }
    });

    let app = build_router(state);

    let addr = bind.as_socket_string();
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Stop retry loops between attempts; in-flight writes finish
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
