//! Payroll job rows and their event log
//!
//! Every status change goes through a conditional UPDATE on the expected
//! current status and writes one `payroll_job_events` row. A claimed job also
//! carries a `claim_token`: checkpoints and transitions out of `running` only
//! apply while the token still matches, so a worker whose claim was taken away
//! (orphan recovery) can no longer write to the job.
//!
//! Leaving `running` and giving back the slot happen in one transaction, which
//! keeps `running_count` equal to the number of `running` jobs.

use chrono::Duration;
use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite, SqlitePool, Transaction};
use tms_common::time::{now, now_db_string, parse_db_timestamp, to_db_string};
use tms_common::{uuid_utils, Result};
use tracing::{debug, error, info, warn};

use crate::config::backoff_delay_secs;
use crate::controller::RELEASE_SLOT_SQL;
use crate::models::{Checkpoint, JobEvent, JobRequest, JobStatus, PayrollJob};

const JOB_COLUMNS: &str = r#"
    id, organization_id, pay_period_start, pay_period_end, status, priority,
    requested_at, started_at, completed_at, progress_percent, checkpoint_data,
    retry_count, max_retries, failure_reason, not_before, updated_at
"#;

fn job_from_row(row: &SqliteRow) -> Result<PayrollJob> {
    let status: String = row.try_get("status")?;
    let checkpoint_data: Option<String> = row.try_get("checkpoint_data")?;
    let checkpoint = match checkpoint_data {
        Some(raw) if !raw.trim().is_empty() => Some(serde_json::from_str::<Checkpoint>(&raw).map_err(
            |e| tms_common::Error::Internal(format!("Corrupt checkpoint_data: {}", e)),
        )?),
        _ => None,
    };

    Ok(PayrollJob {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        pay_period_start: row.try_get("pay_period_start")?,
        pay_period_end: row.try_get("pay_period_end")?,
        status: status.parse::<JobStatus>()?,
        priority: row.try_get("priority")?,
        requested_at: row.try_get("requested_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        progress_percent: row.try_get("progress_percent")?,
        checkpoint,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        failure_reason: row.try_get("failure_reason")?,
        not_before: row.try_get("not_before")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn checkpoint_json(checkpoint: &Checkpoint) -> Result<String> {
    serde_json::to_string(checkpoint)
        .map_err(|e| tms_common::Error::Internal(format!("Checkpoint serialization failed: {}", e)))
}

/// Append one entry to a job's event log
pub async fn log_event<'e, E>(executor: E, job_id: &str, event_type: &str, message: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO payroll_job_events (job_id, event_type, message, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(event_type)
    .bind(message)
    .bind(now_db_string())
    .execute(executor)
    .await?;

    debug!(job_id, event_type, message, "Payroll job event");
    Ok(())
}

/// Event log of a job, oldest first
pub async fn list_events(pool: &SqlitePool, job_id: &str) -> Result<Vec<JobEvent>> {
    let events = sqlx::query_as::<_, JobEvent>(
        "SELECT id, job_id, event_type, message, created_at FROM payroll_job_events WHERE job_id = ? ORDER BY id",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Insert a queued job unless the organization already has an active one
///
/// Returns the new job id, or `None` when refused.
pub async fn insert_job_if_none_active(
    pool: &SqlitePool,
    request: &JobRequest,
    max_retries: i64,
) -> Result<Option<String>> {
    let job_id = uuid_utils::generate_string();
    let now_str = now_db_string();

    let result = sqlx::query(
        r#"
        INSERT INTO payroll_jobs (
            id, organization_id, pay_period_start, pay_period_end, status, priority,
            requested_at, max_retries, updated_at
        )
        SELECT ?, ?, ?, ?, 'queued', ?, ?, ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM payroll_jobs
            WHERE organization_id = ? AND status IN ('queued', 'running', 'paused')
        )
        "#,
    )
    .bind(&job_id)
    .bind(&request.organization_id)
    .bind(request.pay_period_start)
    .bind(request.pay_period_end)
    .bind(request.priority)
    .bind(&now_str)
    .bind(max_retries)
    .bind(&now_str)
    .bind(&request.organization_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    log_event(pool, &job_id, "queued", &format!("Queued with priority {}", request.priority)).await?;
    Ok(Some(job_id))
}

pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Option<PayrollJob>> {
    let sql = format!("SELECT {} FROM payroll_jobs WHERE id = ?", JOB_COLUMNS);
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Number of active jobs (queued, running or paused) of an organization
pub async fn count_active_jobs(pool: &SqlitePool, organization_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM payroll_jobs WHERE organization_id = ? AND status IN ('queued', 'running', 'paused')",
    )
    .bind(organization_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

pub async fn count_jobs_by_status(pool: &SqlitePool, status: JobStatus) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payroll_jobs WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;

    Ok(count)
}

/// Highest priority, then oldest, runnable job
///
/// Considers `queued` and `paused` jobs whose backoff (`not_before`) has elapsed.
pub async fn next_job<'e, E>(executor: E) -> Result<Option<PayrollJob>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        SELECT {} FROM payroll_jobs
        WHERE status IN ('queued', 'paused')
          AND (not_before IS NULL OR not_before <= ?)
        ORDER BY priority DESC, requested_at ASC
        LIMIT 1
        "#,
        JOB_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(now_db_string())
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// A job moved to `running` together with the token that proves ownership
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: PayrollJob,
    pub token: String,
}

impl ClaimedJob {
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

/// Claim a queued or paused job inside the slot transaction
///
/// Returns `None` when another worker got it first.
pub(crate) async fn mark_running(
    tx: &mut Transaction<'_, Sqlite>,
    job: &PayrollJob,
) -> Result<Option<ClaimedJob>> {
    let token = uuid_utils::generate_string();
    let now_str = now_db_string();
    let result = sqlx::query(
        r#"
        UPDATE payroll_jobs
        SET status = 'running', claim_token = ?, started_at = COALESCE(started_at, ?),
            not_before = NULL, updated_at = ?
        WHERE id = ? AND status IN ('queued', 'paused')
        "#,
    )
    .bind(&token)
    .bind(&now_str)
    .bind(&now_str)
    .bind(&job.id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let message = match job.checkpoint {
        Some(cp) => format!(
            "Resumed after ticket {} ({} processed)",
            cp.last_processed_ticket_id, cp.processed_count
        ),
        None => "Started".to_string(),
    };
    log_event(&mut **tx, &job.id, "running", &message).await?;
    info!(job_id = %job.id, organization_id = %job.organization_id, "{}", message);

    Ok(Some(ClaimedJob {
        job: job.clone(),
        token,
    }))
}

/// Persist the resume cursor and progress; also refreshes the heartbeat
///
/// Returns false when the claim is no longer held.
pub async fn save_checkpoint(
    pool: &SqlitePool,
    claim: &ClaimedJob,
    checkpoint: &Checkpoint,
    progress_percent: f64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE payroll_jobs SET checkpoint_data = ?, progress_percent = ?, updated_at = ?
        WHERE id = ? AND status = 'running' AND claim_token = ?
        "#,
    )
    .bind(checkpoint_json(checkpoint)?)
    .bind(progress_percent.clamp(0.0, 100.0))
    .bind(now_db_string())
    .bind(claim.id())
    .bind(&claim.token)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        warn!(job_id = claim.id(), "Checkpoint rejected; claim no longer held");
        return Ok(false);
    }

    debug!(
        job_id = claim.id(),
        last_processed_ticket_id = checkpoint.last_processed_ticket_id,
        processed_count = checkpoint.processed_count,
        progress_percent,
        "Checkpoint saved"
    );
    Ok(true)
}

/// Run `update` (already bound except for id and token) against the claimed
/// row and, when it applied, release the slot and log the event in the same
/// transaction
async fn leave_running<'q>(
    pool: &SqlitePool,
    claim: &ClaimedJob,
    update: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    event_type: &str,
    message: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let result = update
        .bind(claim.id().to_string())
        .bind(claim.token.clone())
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        tx.rollback().await?;
        warn!(job_id = claim.id(), event_type, "Transition skipped; claim no longer held");
        return Ok(false);
    }

    sqlx::query(RELEASE_SLOT_SQL)
        .bind(now_db_string())
        .execute(&mut *tx)
        .await?;
    log_event(&mut *tx, claim.id(), event_type, message).await?;
    tx.commit().await?;

    debug!(job_id = claim.id(), event_type, "Payroll slot released");
    Ok(true)
}

pub async fn mark_completed(pool: &SqlitePool, claim: &ClaimedJob, checkpoint: &Checkpoint) -> Result<bool> {
    let now_str = now_db_string();
    let update = sqlx::query(
        r#"
        UPDATE payroll_jobs
        SET status = 'completed', claim_token = NULL, progress_percent = 100, checkpoint_data = ?,
            completed_at = ?, failure_reason = NULL, updated_at = ?
        WHERE id = ? AND status = 'running' AND claim_token = ?
        "#,
    )
    .bind(checkpoint_json(checkpoint)?)
    .bind(now_str.clone())
    .bind(now_str);

    leave_running(
        pool,
        claim,
        update,
        "completed",
        &format!("Processed {} tickets", checkpoint.processed_count),
    )
    .await
}

/// Stop a running job at its last checkpoint and leave it `paused`
pub async fn mark_paused(pool: &SqlitePool, claim: &ClaimedJob, reason: &str) -> Result<bool> {
    let update = sqlx::query(
        r#"
        UPDATE payroll_jobs SET status = 'paused', claim_token = NULL, updated_at = ?
        WHERE id = ? AND status = 'running' AND claim_token = ?
        "#,
    )
    .bind(now_db_string());

    leave_running(pool, claim, update, "paused", reason).await
}

/// Return a running job to `queued` without consuming a retry
pub async fn requeue(pool: &SqlitePool, claim: &ClaimedJob, reason: &str) -> Result<bool> {
    let update = sqlx::query(
        r#"
        UPDATE payroll_jobs SET status = 'queued', claim_token = NULL, updated_at = ?
        WHERE id = ? AND status = 'running' AND claim_token = ?
        "#,
    )
    .bind(now_db_string());

    leave_running(pool, claim, update, "requeued", reason).await
}

/// What happened to a job after a processing error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `queued`, not picked up before `not_before`
    Retrying { retry_count: i64, not_before: String },
    /// Retries exhausted
    Failed,
}

/// Requeue with exponential backoff, or fail permanently once `max_retries` is used up
///
/// `None` when the claim was lost before the failure could be recorded.
pub async fn record_failure(
    pool: &SqlitePool,
    claim: &ClaimedJob,
    reason: &str,
    backoff_base_secs: i64,
) -> Result<Option<FailureOutcome>> {
    let job = &claim.job;
    let now_ts = now();
    let now_str = to_db_string(now_ts);

    if job.retry_count < job.max_retries {
        let delay = backoff_delay_secs(job.retry_count, backoff_base_secs);
        let not_before = to_db_string(now_ts + Duration::seconds(delay));
        let retry_count = job.retry_count + 1;

        let update = sqlx::query(
            r#"
            UPDATE payroll_jobs
            SET status = 'queued', claim_token = NULL, retry_count = ?, failure_reason = ?,
                not_before = ?, updated_at = ?
            WHERE id = ? AND status = 'running' AND claim_token = ?
            "#,
        )
        .bind(retry_count)
        .bind(reason.to_string())
        .bind(not_before.clone())
        .bind(now_str);

        let message = format!(
            "Attempt {} of {} failed: {}; retry not before {}",
            retry_count,
            job.max_retries + 1,
            reason,
            not_before
        );
        if !leave_running(pool, claim, update, "retry_scheduled", &message).await? {
            return Ok(None);
        }

        warn!(
            job_id = %job.id,
            retry_count,
            max_retries = job.max_retries,
            delay_secs = delay,
            error = reason,
            "Payroll job failed; requeued with backoff"
        );
        return Ok(Some(FailureOutcome::Retrying {
            retry_count,
            not_before,
        }));
    }

    let update = sqlx::query(
        r#"
        UPDATE payroll_jobs
        SET status = 'failed', claim_token = NULL, failure_reason = ?, completed_at = ?, updated_at = ?
        WHERE id = ? AND status = 'running' AND claim_token = ?
        "#,
    )
    .bind(reason.to_string())
    .bind(now_str.clone())
    .bind(now_str);

    if !leave_running(pool, claim, update, "failed", reason).await? {
        return Ok(None);
    }

    error!(
        job_id = %job.id,
        organization_id = %job.organization_id,
        retry_count = job.retry_count,
        error = reason,
        "Payroll job failed permanently"
    );
    Ok(Some(FailureOutcome::Failed))
}

/// Move every queued job to `paused`; returns the affected ids
///
/// Running jobs are left to their worker, which pauses them itself at the next
/// batch boundary.
pub async fn pause_queued_jobs(pool: &SqlitePool, reason: &str) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE payroll_jobs SET status = 'paused', updated_at = ?
        WHERE status = 'queued'
        RETURNING id
        "#,
    )
    .bind(now_db_string())
    .fetch_all(pool)
    .await?;

    for id in &ids {
        log_event(pool, id, "paused", reason).await?;
    }
    Ok(ids)
}

/// Move every paused job back to `queued`; returns the affected ids
pub async fn requeue_paused_jobs(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE payroll_jobs SET status = 'queued', updated_at = ?
        WHERE status = 'paused'
        RETURNING id
        "#,
    )
    .bind(now_db_string())
    .fetch_all(pool)
    .await?;

    for id in &ids {
        log_event(pool, id, "resumed", "Payroll queue resumed").await?;
    }
    Ok(ids)
}

/// Requeue `running` jobs whose heartbeat is older than `stale_after_minutes`
///
/// Clears the claim token, so the lost worker's later writes are rejected. The
/// checkpoint is kept and the next claim resumes where that worker stopped.
pub(crate) async fn requeue_stale_running(
    tx: &mut Transaction<'_, Sqlite>,
    stale_after_minutes: i64,
) -> Result<Vec<String>> {
    let now_ts = now();
    let cutoff = to_db_string(now_ts - Duration::minutes(stale_after_minutes));

    let stale: Vec<(String, String)> = sqlx::query_as(
        "SELECT id, updated_at FROM payroll_jobs WHERE status = 'running' AND updated_at < ?",
    )
    .bind(&cutoff)
    .fetch_all(&mut **tx)
    .await?;

    let mut ids = Vec::with_capacity(stale.len());
    for (id, heartbeat) in stale {
        let result = sqlx::query(
            r#"
            UPDATE payroll_jobs SET status = 'queued', claim_token = NULL, updated_at = ?
            WHERE id = ? AND status = 'running' AND updated_at < ?
            "#,
        )
        .bind(to_db_string(now_ts))
        .bind(&id)
        .bind(&cutoff)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            continue;
        }

        let silent_minutes = (now_ts - parse_db_timestamp(&heartbeat)?).num_minutes();
        log_event(
            &mut **tx,
            &id,
            "orphan_recovered",
            &format!(
                "No heartbeat for {} minutes (since {}); requeued from last checkpoint",
                silent_minutes, heartbeat
            ),
        )
        .await?;
        ids.push(id);
    }
    Ok(ids)
}
