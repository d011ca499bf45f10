//! Payroll Concurrency Controller
//!
//! Admission control for payroll work. The singleton `payroll_global_lock` row
//! is the only synchronization point between worker processes; every change to
//! it is a single conditional UPDATE, never a read followed by a write.
//!
//! Workers take a slot and claim a job in one transaction (`claim_next_job`),
//! and give the slot back in the same transaction that moves the job out of
//! `running`. `running_count` therefore matches the number of running jobs, and
//! `recover_orphaned_jobs` can reconcile the two after a crash.

use std::sync::Arc;

use sqlx::SqlitePool;
use tms_common::db::retry_on_lock;
use tms_common::time::now_db_string;
use tms_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::config::ControllerLimits;
use crate::jobs::{self, ClaimedJob};
use crate::models::{
    GlobalLock, HealthStatus, JobRequest, JobStatus, QueueDecision, QueueStatus, RecoveryReport,
    SlotAcquisition,
};
use crate::probe::ResourceProbe;

const ACQUIRE_SLOT_SQL: &str = r#"
    UPDATE payroll_global_lock
    SET running_count = running_count + 1, updated_at = ?
    WHERE id = 1 AND is_paused = 0 AND running_count < max_concurrent_jobs
"#;

pub(crate) const RELEASE_SLOT_SQL: &str = r#"
    UPDATE payroll_global_lock
    SET running_count = running_count - 1, updated_at = ?
    WHERE id = 1 AND running_count > 0
"#;

/// Lower `running_count` to the number of running jobs; never raises it
const RECONCILE_SLOTS_SQL: &str = r#"
    UPDATE payroll_global_lock
    SET running_count = (SELECT COUNT(*) FROM payroll_jobs WHERE status = 'running'), updated_at = ?
    WHERE id = 1 AND running_count > (SELECT COUNT(*) FROM payroll_jobs WHERE status = 'running')
    RETURNING running_count
"#;

/// Answer of `claim_next_job`
#[derive(Debug)]
pub enum Claim {
    /// Slot taken and job moved to `running`
    Claimed(ClaimedJob),
    /// No slot free; nothing was changed
    NoSlot { reason: String },
    /// A slot was free but no job is runnable; the slot was not kept
    Idle,
}

enum ClaimAttempt {
    Refused,
    Nothing,
    Claimed(ClaimedJob),
}

#[derive(Clone)]
pub struct PayrollController {
    pub(crate) db: SqlitePool,
    probe: Arc<dyn ResourceProbe>,
    limits: ControllerLimits,
}

impl PayrollController {
    pub fn new(db: SqlitePool, probe: Arc<dyn ResourceProbe>, limits: ControllerLimits) -> Self {
        Self { db, probe, limits }
    }

    /// Controller with limits read from the settings table
    pub async fn from_settings(db: SqlitePool, probe: Arc<dyn ResourceProbe>) -> Result<Self> {
        let limits = ControllerLimits::load(&db).await?;
        Ok(Self::new(db, probe, limits))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub fn limits(&self) -> &ControllerLimits {
        &self.limits
    }

    /// At most one active (queued, running or paused) job per organization
    pub async fn can_queue_job(&self, organization_id: &str) -> Result<QueueDecision> {
        let active = jobs::count_active_jobs(&self.db, organization_id).await?;
        if active > 0 {
            return Ok(QueueDecision {
                allowed: false,
                reason: Some(format!(
                    "Organization {} already has an active payroll job",
                    organization_id
                )),
            });
        }
        Ok(QueueDecision {
            allowed: true,
            reason: None,
        })
    }

    /// Queue a payroll job; `Error::Conflict` while the organization has an active one
    pub async fn enqueue_job(&self, request: &JobRequest) -> Result<String> {
        if request.organization_id.trim().is_empty() {
            return Err(Error::InvalidInput("organization_id must not be empty".to_string()));
        }
        let max_retries = request.max_retries.unwrap_or(self.limits.default_max_retries);
        if max_retries < 0 {
            return Err(Error::InvalidInput(format!(
                "max_retries must not be negative, got {}",
                max_retries
            )));
        }

        let decision = self.can_queue_job(&request.organization_id).await?;
        if !decision.allowed {
            return Err(Error::Conflict(decision.reason.unwrap_or_default()));
        }

        // The insert re-checks atomically; the decision above only supplies the message
        let job_id = retry_on_lock("enqueue_payroll_job", self.limits.max_lock_wait_ms, || {
            jobs::insert_job_if_none_active(&self.db, request, max_retries)
        })
        .await?
        .ok_or_else(|| {
            Error::Conflict(format!(
                "Organization {} already has an active payroll job",
                request.organization_id
            ))
        })?;

        info!(
            job_id = %job_id,
            organization_id = %request.organization_id,
            priority = request.priority,
            max_retries,
            "Payroll job queued"
        );
        Ok(job_id)
    }

    pub async fn global_lock(&self) -> Result<GlobalLock> {
        let lock = sqlx::query_as::<_, GlobalLock>(
            "SELECT is_paused, pause_reason, max_concurrent_jobs, running_count FROM payroll_global_lock WHERE id = 1",
        )
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| Error::Internal("payroll_global_lock row is missing".to_string()))?;

        Ok(lock)
    }

    pub async fn is_paused(&self) -> Result<bool> {
        Ok(self.global_lock().await?.is_paused)
    }

    /// Take one running slot if payroll is not paused and below capacity
    ///
    /// A slot taken here without a running job behind it is reclaimed by the
    /// next `recover_orphaned_jobs`; workers use `claim_next_job`.
    pub async fn acquire_slot(&self) -> Result<SlotAcquisition> {
        let updated = retry_on_lock("acquire_payroll_slot", self.limits.max_lock_wait_ms, || async {
            let result = sqlx::query(ACQUIRE_SLOT_SQL)
                .bind(now_db_string())
                .execute(&self.db)
                .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if updated == 1 {
            debug!("Payroll slot acquired");
            return Ok(SlotAcquisition {
                acquired: true,
                reason: None,
            });
        }

        let reason = self.slot_refusal_reason().await?;
        Ok(SlotAcquisition {
            acquired: false,
            reason: Some(reason),
        })
    }

    /// Read the lock row only to explain a refused slot
    async fn slot_refusal_reason(&self) -> Result<String> {
        let lock = self.global_lock().await?;
        let reason = if lock.is_paused {
            format!(
                "Payroll paused: {}",
                lock.pause_reason.as_deref().unwrap_or("no reason recorded")
            )
        } else {
            format!(
                "At capacity: {}/{} payroll jobs running",
                lock.running_count, lock.max_concurrent_jobs
            )
        };
        debug!(reason = %reason, "Payroll slot not available");
        Ok(reason)
    }

    /// Take a slot and claim the next runnable job, atomically
    ///
    /// When no job is runnable the slot is not kept.
    pub async fn claim_next_job(&self) -> Result<Claim> {
        let attempt = retry_on_lock("claim_payroll_job", self.limits.max_lock_wait_ms, || {
            self.try_claim()
        })
        .await?;

        match attempt {
            ClaimAttempt::Claimed(claim) => Ok(Claim::Claimed(claim)),
            ClaimAttempt::Nothing => {
                debug!("No runnable payroll job");
                Ok(Claim::Idle)
            }
            ClaimAttempt::Refused => Ok(Claim::NoSlot {
                reason: self.slot_refusal_reason().await?,
            }),
        }
    }

    async fn try_claim(&self) -> Result<ClaimAttempt> {
        let mut tx = self.db.begin().await?;

        let acquired = sqlx::query(ACQUIRE_SLOT_SQL)
            .bind(now_db_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if acquired == 0 {
            tx.rollback().await?;
            return Ok(ClaimAttempt::Refused);
        }

        let Some(job) = jobs::next_job(&mut *tx).await? else {
            tx.rollback().await?;
            return Ok(ClaimAttempt::Nothing);
        };

        match jobs::mark_running(&mut tx, &job).await? {
            Some(claim) => {
                tx.commit().await?;
                Ok(ClaimAttempt::Claimed(claim))
            }
            None => {
                tx.rollback().await?;
                Ok(ClaimAttempt::Nothing)
            }
        }
    }

    /// Give back one slot; never drops the count below zero
    ///
    /// Returns false when no slot was held.
    pub async fn release_slot(&self) -> Result<bool> {
        let updated = retry_on_lock("release_payroll_slot", self.limits.max_lock_wait_ms, || async {
            let result = sqlx::query(RELEASE_SLOT_SQL)
                .bind(now_db_string())
                .execute(&self.db)
                .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            warn!("Payroll slot release with no slot held");
            return Ok(false);
        }
        debug!("Payroll slot released");
        Ok(true)
    }

    /// Composite gate: open critical incidents, then memory and disk usage
    pub async fn check_system_health(&self) -> Result<HealthStatus> {
        let critical: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, title FROM tms_incidents
            WHERE status = 'open' AND severity = 'critical'
            ORDER BY opened_at
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.db)
        .await?;

        if let Some((id, title)) = critical {
            return Ok(HealthStatus::unhealthy(format!(
                "Critical incident {} open: {}",
                id, title
            )));
        }

        let usage = self.probe.sample();
        if usage.memory_pct > self.limits.memory_limit_pct {
            return Ok(HealthStatus::unhealthy(format!(
                "Memory usage {:.1}% exceeds {:.1}%",
                usage.memory_pct, self.limits.memory_limit_pct
            )));
        }
        if usage.disk_pct > self.limits.disk_limit_pct {
            return Ok(HealthStatus::unhealthy(format!(
                "Disk usage {:.1}% exceeds {:.1}%",
                usage.disk_pct, self.limits.disk_limit_pct
            )));
        }

        Ok(HealthStatus::healthy())
    }

    /// Pause payroll globally and move queued jobs to `paused`
    ///
    /// Running jobs stay `running` until their worker reaches the next batch
    /// boundary and pauses them itself.
    pub async fn pause_queue(&self, reason: &str) -> Result<()> {
        retry_on_lock("pause_payroll_queue", self.limits.max_lock_wait_ms, || async {
            sqlx::query(
                "UPDATE payroll_global_lock SET is_paused = 1, pause_reason = ?, updated_at = ? WHERE id = 1",
            )
            .bind(reason)
            .bind(now_db_string())
            .execute(&self.db)
            .await?;
            Ok::<_, Error>(())
        })
        .await?;

        let paused = jobs::pause_queued_jobs(&self.db, reason).await?;
        warn!(reason, paused_jobs = paused.len(), "Payroll queue paused");
        Ok(())
    }

    /// Lift the global pause and requeue paused jobs
    ///
    /// Callers bridging incidents must first make sure nothing else still
    /// requires the pause (see `resume_after_incident`).
    pub async fn resume_queue(&self) -> Result<()> {
        retry_on_lock("resume_payroll_queue", self.limits.max_lock_wait_ms, || async {
            sqlx::query(
                "UPDATE payroll_global_lock SET is_paused = 0, pause_reason = NULL, updated_at = ? WHERE id = 1",
            )
            .bind(now_db_string())
            .execute(&self.db)
            .await?;
            Ok::<_, Error>(())
        })
        .await?;

        let resumed = jobs::requeue_paused_jobs(&self.db).await?;
        info!(resumed_jobs = resumed.len(), "Payroll queue resumed");
        Ok(())
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus> {
        let lock = self.global_lock().await?;
        Ok(QueueStatus {
            running: lock.running_count,
            queued: jobs::count_jobs_by_status(&self.db, JobStatus::Queued).await?,
            paused: jobs::count_jobs_by_status(&self.db, JobStatus::Paused).await?,
            max_concurrent: lock.max_concurrent_jobs,
            is_paused: lock.is_paused,
            pause_reason: lock.pause_reason,
        })
    }

    /// Change the global concurrency bound; slots already held are kept
    pub async fn set_max_concurrent(&self, max_concurrent_jobs: i64) -> Result<()> {
        if max_concurrent_jobs < 1 {
            return Err(Error::InvalidInput(format!(
                "max_concurrent_jobs must be at least 1, got {}",
                max_concurrent_jobs
            )));
        }

        sqlx::query(
            "UPDATE payroll_global_lock SET max_concurrent_jobs = ?, updated_at = ? WHERE id = 1",
        )
        .bind(max_concurrent_jobs)
        .bind(now_db_string())
        .execute(&self.db)
        .await?;

        info!(max_concurrent_jobs, "Payroll concurrency bound updated");
        Ok(())
    }

    /// Requeue running jobs with a stale heartbeat and take back every slot
    /// not held by a running job
    pub async fn recover_orphaned_jobs(&self, stale_after_minutes: i64) -> Result<RecoveryReport> {
        let report = retry_on_lock("recover_orphaned_jobs", self.limits.max_lock_wait_ms, || {
            self.try_recover(stale_after_minutes)
        })
        .await?;

        for job_id in &report.requeued {
            warn!(job_id = %job_id, "Orphaned payroll job requeued");
        }
        if report.slots_reclaimed > 0 {
            warn!(slots = report.slots_reclaimed, "Reclaimed leaked payroll slots");
        }
        Ok(report)
    }

    async fn try_recover(&self, stale_after_minutes: i64) -> Result<RecoveryReport> {
        let mut tx = self.db.begin().await?;

        let requeued = jobs::requeue_stale_running(&mut tx, stale_after_minutes).await?;

        let before: i64 =
            sqlx::query_scalar("SELECT running_count FROM payroll_global_lock WHERE id = 1")
                .fetch_one(&mut *tx)
                .await?;
        let after: Option<i64> = sqlx::query_scalar(RECONCILE_SLOTS_SQL)
            .bind(now_db_string())
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(RecoveryReport {
            requeued,
            slots_reclaimed: after.map_or(0, |after| before - after),
        })
    }
}
