//! Database initialization
//!
//! Opens (or creates) the shared SQLite database and brings the schema up to date:
//! tables are created with `CREATE TABLE IF NOT EXISTS`, versioned migrations run
//! afterwards, then default settings and the payroll lock singleton are ensured.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

use super::settings::{ensure_setting, get_setting_or};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL lets the matching service read while a payroll worker writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    init_schema(&pool).await?;

    let max_wait_ms: i64 = get_setting_or(&pool, "db_max_lock_wait_ms", 5000).await?;
    info!("Database lock wait budget: {} ms", max_wait_ms);

    Ok(pool)
}

/// Create all tables, run migrations and ensure defaults on an open pool
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;

    // Reconciliation inputs
    create_pit_data_table(pool).await?;
    create_material_receipts_table(pool).await?;
    create_po_data_table(pool).await?;
    create_supplier_invoices_table(pool).await?;

    // Reconciliation outputs
    create_matching_runs_table(pool).await?;
    create_matched_records_table(pool).await?;
    create_matching_exceptions_table(pool).await?;
    create_exception_queue_table(pool).await?;
    create_workflow_tickets_table(pool).await?;

    // Payroll control
    create_payroll_global_lock_table(pool).await?;
    create_payroll_jobs_table(pool).await?;
    create_payroll_job_events_table(pool).await?;
    create_incident_tables(pool).await?;
    create_tickets_table(pool).await?;
    create_payroll_line_items_table(pool).await?;

    crate::db::migrations::run_migrations(pool).await?;

    init_default_settings(pool).await?;
    ensure_payroll_global_lock(pool).await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores tunable thresholds and intervals as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or repair default settings
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Matching engine thresholds
    ensure_setting(pool, "matching_quantity_variance_pct", "5.0").await?;
    ensure_setting(pool, "matching_price_variance_pct", "5.0").await?;
    ensure_setting(pool, "matching_delivery_window_days", "7").await?;
    ensure_setting(pool, "matching_stale_run_minutes", "60").await?;

    // Payroll worker
    ensure_setting(pool, "payroll_poll_interval_secs", "5").await?;
    ensure_setting(pool, "payroll_batch_size", "100").await?;
    ensure_setting(pool, "payroll_checkpoint_every", "10").await?;
    ensure_setting(pool, "payroll_default_max_retries", "2").await?;
    ensure_setting(pool, "payroll_backoff_base_secs", "60").await?;
    ensure_setting(pool, "payroll_stale_job_minutes", "30").await?;
    ensure_setting(pool, "payroll_memory_limit_pct", "85").await?;
    ensure_setting(pool, "payroll_disk_limit_pct", "80").await?;

    ensure_setting(pool, "db_max_lock_wait_ms", "5000").await?;

    Ok(())
}

async fn create_pit_data_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pit_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            material_number TEXT NOT NULL,
            batch_lot TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_of_measure TEXT NOT NULL,
            production_date TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pit_data_org ON pit_data(organization_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_material_receipts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS material_receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            receipt_number TEXT,
            material_number TEXT NOT NULL,
            batch_lot TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_of_measure TEXT NOT NULL,
            receipt_date TEXT,
            quality_hold INTEGER NOT NULL DEFAULT 0,
            quality_notes TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_material_receipts_org ON material_receipts(organization_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_po_data_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS po_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            po_number TEXT,
            material_number TEXT NOT NULL,
            batch_lot TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_of_measure TEXT NOT NULL,
            unit_price REAL,
            po_date TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_po_data_org ON po_data(organization_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_supplier_invoices_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS supplier_invoices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            invoice_number TEXT,
            material_number TEXT NOT NULL,
            batch_lot TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_of_measure TEXT NOT NULL,
            unit_price REAL,
            invoice_date TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_supplier_invoices_org ON supplier_invoices(organization_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_matching_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matching_runs (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('running', 'completed')),
            pit_count INTEGER NOT NULL DEFAULT 0,
            receipt_count INTEGER NOT NULL DEFAULT 0,
            po_count INTEGER NOT NULL DEFAULT 0,
            invoice_count INTEGER NOT NULL DEFAULT 0,
            matched_count INTEGER NOT NULL DEFAULT 0,
            exception_count INTEGER NOT NULL DEFAULT 0,
            unconsumed_count INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_matching_runs_org_status ON matching_runs(organization_id, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_matched_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matched_records (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            run_id TEXT NOT NULL REFERENCES matching_runs(id),
            material_number TEXT NOT NULL,
            batch_lot TEXT NOT NULL,
            pit_id INTEGER,
            receipt_id INTEGER,
            po_id INTEGER,
            invoice_id INTEGER,
            quantity_received REAL,
            quantity_billed REAL,
            unit_of_measure TEXT,
            po_unit_price REAL,
            invoice_unit_price REAL,
            delivery_date TEXT,
            status TEXT NOT NULL CHECK (status IN ('matched', 'exception')),
            quantity_variance_pct REAL,
            price_variance_pct REAL,
            date_variance_days INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_matched_records_run ON matched_records(run_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_matching_exceptions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matching_exceptions (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            run_id TEXT NOT NULL REFERENCES matching_runs(id),
            matched_record_id TEXT NOT NULL REFERENCES matched_records(id),
            exception_type TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high')),
            explanation TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_matching_exceptions_run ON matching_exceptions(run_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_exception_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exception_queue (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            exception_id TEXT NOT NULL REFERENCES matching_exceptions(id),
            exception_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            impact_score REAL NOT NULL CHECK (impact_score >= 0 AND impact_score <= 100),
            confidence REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_exception_queue_priority ON exception_queue(organization_id, impact_score DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_workflow_tickets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_tickets (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            exception_id TEXT REFERENCES matching_exceptions(id),
            department TEXT NOT NULL CHECK (department IN ('procurement', 'accounting', 'warehouse')),
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_workflow_tickets_source ON workflow_tickets(source_type, source_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_payroll_global_lock_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payroll_global_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            is_paused INTEGER NOT NULL DEFAULT 0,
            pause_reason TEXT,
            max_concurrent_jobs INTEGER NOT NULL DEFAULT 2 CHECK (max_concurrent_jobs > 0),
            running_count INTEGER NOT NULL DEFAULT 0 CHECK (running_count >= 0),
            updated_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert the singleton lock row (id = 1) if missing
async fn ensure_payroll_global_lock(pool: &SqlitePool) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO payroll_global_lock (id, is_paused, max_concurrent_jobs, running_count)
        VALUES (1, 0, 2, 0)
        "#,
    )
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        info!("Initialized payroll global lock (max_concurrent_jobs = 2)");
    }

    Ok(())
}

async fn create_payroll_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payroll_jobs (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            pay_period_start TEXT,
            pay_period_end TEXT,
            status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'completed', 'failed', 'paused')),
            priority INTEGER NOT NULL DEFAULT 0,
            requested_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            progress_percent REAL NOT NULL DEFAULT 0,
            checkpoint_data TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 2,
            failure_reason TEXT,
            not_before TEXT,
            claim_token TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_payroll_jobs_status ON payroll_jobs(status, priority DESC, requested_at ASC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_payroll_jobs_org ON payroll_jobs(organization_id, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_payroll_job_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payroll_job_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES payroll_jobs(id),
            event_type TEXT NOT NULL,
            message TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_incident_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tms_incidents (
            id TEXT PRIMARY KEY,
            incident_type TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'critical')),
            status TEXT NOT NULL CHECK (status IN ('open', 'resolved')),
            title TEXT NOT NULL,
            opened_at TEXT NOT NULL,
            resolved_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tms_incident_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            incident_id TEXT NOT NULL REFERENCES tms_incidents(id),
            event_type TEXT NOT NULL,
            message TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_tickets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            driver_id TEXT NOT NULL,
            quantity REAL NOT NULL,
            pay_rate REAL NOT NULL,
            ticket_date TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tickets_org_id ON tickets(organization_id, id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_payroll_line_items_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payroll_line_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES payroll_jobs(id),
            ticket_id INTEGER NOT NULL REFERENCES tickets(id),
            driver_id TEXT NOT NULL,
            amount REAL NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (job_id, ticket_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
