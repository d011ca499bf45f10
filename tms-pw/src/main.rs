//! tms-pw (Payroll Worker) - long-lived polling process

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tms_common::config::{load_toml_config, DatabasePathResolver, DATABASE_ENV_VAR};
use tms_common::db::init_database;
use tms_pw::config::WorkerConfig;
use tms_pw::probe::SystemProbe;
use tms_pw::{DbTicketSource, PayrollController, PayrollWorker};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tms-pw")]
#[command(about = "TMS payroll worker")]
#[command(version)]
struct Args {
    /// Shared database file
    #[arg(short, long, env = DATABASE_ENV_VAR)]
    database: Option<PathBuf>,

    /// Polling interval; overrides the TOML file and settings table
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
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

    info!("Starting TMS Payroll Worker (tms-pw) v{}", env!("CARGO_PKG_VERSION"));

    let db_path = DatabasePathResolver::new("tms-pw", toml_config.clone())
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

    let mut config = WorkerConfig::load(&pool, &toml_config.payroll).await?;
    if let Some(secs) = args.interval_secs {
        config.poll_interval_secs = secs;
        config.validate()?;
    }

    let controller = PayrollController::from_settings(pool.clone(), Arc::new(SystemProbe)).await?;
    if let Some(max) = toml_config.payroll.max_concurrent_jobs {
        controller.set_max_concurrent(max).await?;
    }

    let shutdown = CancellationToken::new();
    let worker = PayrollWorker::new(controller, Arc::new(DbTicketSource::new(pool)), config)
        .with_shutdown(shutdown.clone());

    if args.once {
        let outcome = worker.tick().await?;
        info!(?outcome, "Single tick finished");
        return Ok(());
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    worker.run().await?;

    info!("tms-pw stopped");
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
