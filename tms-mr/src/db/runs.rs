//! Matching run rows
//!
//! Admission is a single conditional INSERT, so two services starting a run for
//! the same organization at the same moment cannot both succeed.

use chrono::Duration;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tms_common::time::{now, now_db_string, to_db_string};
use tms_common::{uuid_utils, Result};

use crate::models::{InputCounts, MatchingRun, RunStatus};

/// Insert a `running` run unless the organization already has a live one
///
/// A `running` row older than `stale_after_minutes` is treated as abandoned
/// and no longer blocks admission. Returns the new run id, or `None` when
/// refused.
pub async fn try_begin_run(
    pool: &SqlitePool,
    organization_id: &str,
    stale_after_minutes: i64,
) -> Result<Option<String>> {
    let run_id = uuid_utils::generate_string();
    let started_at = now_db_string();
    let stale_before = to_db_string(now() - Duration::minutes(stale_after_minutes));

    let result = sqlx::query(
        r#"
        INSERT INTO matching_runs (id, organization_id, status, started_at)
        SELECT ?, ?, 'running', ?
        WHERE NOT EXISTS (
            SELECT 1 FROM matching_runs
            WHERE organization_id = ? AND status = 'running' AND started_at > ?
        )
        "#,
    )
    .bind(&run_id)
    .bind(organization_id)
    .bind(&started_at)
    .bind(organization_id)
    .bind(&stale_before)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(run_id))
}

pub async fn record_input_counts(pool: &SqlitePool, run_id: &str, counts: &InputCounts) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE matching_runs
        SET pit_count = ?, receipt_count = ?, po_count = ?, invoice_count = ?
        WHERE id = ?
        "#,
    )
    .bind(counts.pit as i64)
    .bind(counts.receipts as i64)
    .bind(counts.purchase_orders as i64)
    .bind(counts.invoices as i64)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn complete_run(
    pool: &SqlitePool,
    run_id: &str,
    matched_count: usize,
    exception_count: usize,
    unconsumed_count: usize,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE matching_runs
        SET status = 'completed', matched_count = ?, exception_count = ?,
            unconsumed_count = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(matched_count as i64)
    .bind(exception_count as i64)
    .bind(unconsumed_count as i64)
    .bind(now_db_string())
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

const RUN_COLUMNS: &str = r#"
    id, organization_id, status, pit_count, receipt_count, po_count, invoice_count,
    matched_count, exception_count, unconsumed_count, started_at, completed_at
"#;

fn run_from_row(row: &SqliteRow) -> Result<MatchingRun> {
    let status: String = row.try_get("status")?;
    Ok(MatchingRun {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        status: status.parse::<RunStatus>()?,
        input_counts: InputCounts {
            pit: row.try_get::<i64, _>("pit_count")? as usize,
            receipts: row.try_get::<i64, _>("receipt_count")? as usize,
            purchase_orders: row.try_get::<i64, _>("po_count")? as usize,
            invoices: row.try_get::<i64, _>("invoice_count")? as usize,
        },
        matched_count: row.try_get("matched_count")?,
        exception_count: row.try_get("exception_count")?,
        unconsumed_count: row.try_get("unconsumed_count")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<MatchingRun>> {
    let sql = format!("SELECT {} FROM matching_runs WHERE id = ?", RUN_COLUMNS);
    let row = sqlx::query(&sql).bind(run_id).fetch_optional(pool).await?;

    row.as_ref().map(run_from_row).transpose()
}

/// Most recent runs first
pub async fn list_runs(pool: &SqlitePool, organization_id: &str, limit: i64) -> Result<Vec<MatchingRun>> {
    let sql = format!(
        "SELECT {} FROM matching_runs WHERE organization_id = ? ORDER BY started_at DESC LIMIT ?",
        RUN_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(organization_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(run_from_row).collect()
}
