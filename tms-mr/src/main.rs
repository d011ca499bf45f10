//! tms-mr (Matching & Reconciliation) - HTTP service around the Matching Engine

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tms_common::config::{load_toml_config, DatabasePathResolver, DATABASE_ENV_VAR};
use tms_common::db::init_database;
use tms_mr::{build_router, AppState, MatchingEngine};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tms-mr")]
#[command(about = "TMS invoice matching and reconciliation service")]
#[command(version)]
struct Args {
    /// Shared database file
    #[arg(short, long, env = DATABASE_ENV_VAR)]
    database: Option<PathBuf>,

    /// Listen address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(short, long, default_value_t = 5780)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = load_toml_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&toml_config.logging.level)),
        )
        .init();

    info!("Starting TMS Matching & Reconciliation (tms-mr) v{}", env!("CARGO_PKG_VERSION"));

    let db_path = DatabasePathResolver::new("tms-mr", toml_config.clone())
        .with_cli_arg(args.database)
        .resolve();
    info!("Database path: {}", db_path.display());

    let pool = match init_database(&db_path).await {
        Ok(pool) => {
            info!("✓ Database ready");
            pool
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return Err(e.into());
        }
    };

    let engine = MatchingEngine::from_settings(pool).await?;
    let state = AppState::new(engine, toml_config.matching);
    let app = build_router(state);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("tms-mr listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("tms-mr stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
