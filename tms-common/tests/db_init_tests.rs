//! Tests for database initialization
//!
//! - Automatic database creation on first run
//! - Idempotent re-open of an existing database
//! - Default settings and the payroll lock singleton
//! - Schema version bookkeeping

use tempfile::TempDir;
use tms_common::db::init::{init_database, init_schema};
use tms_common::db::migrations::{get_schema_version, CURRENT_SCHEMA_VERSION};
use tms_common::db::settings::{get_setting, get_setting_or, set_setting};

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("tms.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("tms.db");

    let pool1 = init_database(&db_path).await.unwrap();
    set_setting(&pool1, "matching_price_variance_pct", "3.5").await.unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
    let pool2 = pool2.unwrap();

    // Re-initialization must not clobber operator-edited settings
    let price: f64 = get_setting_or(&pool2, "matching_price_variance_pct", 0.0).await.unwrap();
    assert_eq!(price, 3.5);
}

#[tokio::test]
async fn test_default_settings_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("tms.db")).await.unwrap();

    let qty = get_setting(&pool, "matching_quantity_variance_pct").await.unwrap();
    assert_eq!(qty.as_deref(), Some("5.0"));

    let interval: u64 = get_setting_or(&pool, "payroll_poll_interval_secs", 0).await.unwrap();
    assert_eq!(interval, 5);

    let batch: i64 = get_setting_or(&pool, "payroll_batch_size", 0).await.unwrap();
    assert_eq!(batch, 100);
}

#[tokio::test]
async fn test_null_setting_reset_to_default() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("tms.db");
    let pool = init_database(&db_path).await.unwrap();

    sqlx::query("UPDATE settings SET value = NULL WHERE key = 'payroll_disk_limit_pct'")
        .execute(&pool)
        .await
        .unwrap();

    init_schema(&pool).await.unwrap();

    let disk = get_setting(&pool, "payroll_disk_limit_pct").await.unwrap();
    assert_eq!(disk.as_deref(), Some("80"));
}

#[tokio::test]
async fn test_unparsable_setting_falls_back() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("tms.db")).await.unwrap();

    set_setting(&pool, "payroll_batch_size", "lots").await.unwrap();
    let batch: i64 = get_setting_or(&pool, "payroll_batch_size", 100).await.unwrap();
    assert_eq!(batch, 100);
}

#[tokio::test]
async fn test_payroll_lock_singleton_created_once() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("tms.db");
    let pool = init_database(&db_path).await.unwrap();
    init_schema(&pool).await.unwrap();

    let rows: Vec<(i64, i64, i64, i64)> = sqlx::query_as(
        "SELECT id, is_paused, max_concurrent_jobs, running_count FROM payroll_global_lock",
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(rows, vec![(1, 0, 2, 0)]);

    // The CHECK constraint keeps the table a singleton
    let second = sqlx::query("INSERT INTO payroll_global_lock (id) VALUES (2)")
        .execute(&pool)
        .await;
    assert!(second.is_err());
}

#[tokio::test]
async fn test_schema_version_recorded_once() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("tms.db");

    let pool = init_database(&db_path).await.unwrap();
    assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);

    init_schema(&pool).await.unwrap();
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Columns the payroll worker relies on come from init itself
    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM pragma_table_info('payroll_jobs') WHERE name IN ('not_before', 'claim_token') ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(columns, vec!["claim_token", "not_before"]);
}
