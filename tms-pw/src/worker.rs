//! Payroll Worker
//!
//! A polling loop. Each tick:
//! 1. Re-check incidents and system health; pause payroll and skip when either fails
//! 2. Take a slot and claim the next job (`priority DESC, requested_at ASC`)
//!    in one transaction; skip the tick when no slot is free
//! 3. Run the job in batches, resuming after the checkpointed ticket id
//! 4. Complete, pause, requeue with backoff, or fail the job, releasing the
//!    slot in the same transaction
//!
//! If the tick panics or its future is dropped while holding a claim, a
//! `ClaimGuard` hands the job and its slot back. Orphan recovery runs once a
//! minute for workers that died outright.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tms_common::db::retry_on_lock;
use tms_common::Result;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::controller::{Claim, PayrollController};
use crate::jobs::{self, ClaimedJob, FailureOutcome};
use crate::models::Checkpoint;
use crate::tickets::TicketSource;

const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Prefix of pause reasons set by the worker's own health gate
///
/// Only pauses carrying it are lifted automatically once checks pass; manual
/// and incident pauses are lifted by their owners.
pub const AUTO_PAUSE_PREFIX: &str = "Health gate: ";

/// Result of one worker tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Incidents, resources or a pause kept the worker from taking work
    Held { reason: String },
    /// No slot free
    NoSlot { reason: String },
    /// Slot taken but nothing runnable
    Idle,
    Completed { job_id: String, processed: i64 },
    /// Stopped at the last checkpoint because payroll was paused
    Paused { job_id: String, checkpoint: Checkpoint },
    /// Stopped at the last checkpoint because the worker is shutting down
    Interrupted { job_id: String, checkpoint: Checkpoint },
    Retrying { job_id: String, retry_count: i64, not_before: String },
    Failed { job_id: String, reason: String },
    /// The job was taken away (orphan recovery) while this worker ran it;
    /// nothing was written after that point
    ClaimLost { job_id: String },
}

enum JobRun {
    Finished(Checkpoint),
    Paused(Checkpoint),
    ShutDown(Checkpoint),
    ClaimLost,
}

/// Hands a claimed job and its slot back unless disarmed
///
/// Armed for the whole of a job run; disarmed once a transition out of
/// `running` was recorded or the claim turned out to be lost.
struct ClaimGuard {
    pool: SqlitePool,
    claim: Option<ClaimedJob>,
}

impl ClaimGuard {
    fn new(pool: SqlitePool, claim: ClaimedJob) -> Self {
        Self {
            pool,
            claim: Some(claim),
        }
    }

    fn disarm(&mut self) {
        self.claim = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    match jobs::requeue(&pool, &claim, "Worker stopped mid-run; job returned to queue").await {
                        Ok(true) => warn!(job_id = claim.id(), "Abandoned payroll job requeued"),
                        Ok(false) => {}
                        Err(e) => error!(
                            job_id = claim.id(),
                            error = %e,
                            "Failed to hand back abandoned payroll job"
                        ),
                    }
                });
            }
            Err(_) => error!(
                job_id = claim.id(),
                "No runtime to hand back payroll job; orphan recovery will requeue it"
            ),
        }
    }
}

pub struct PayrollWorker {
    controller: PayrollController,
    source: Arc<dyn TicketSource>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl PayrollWorker {
    pub fn new(controller: PayrollController, source: Arc<dyn TicketSource>, config: WorkerConfig) -> Self {
        Self {
            controller,
            source,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop between batches when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn controller(&self) -> &PayrollController {
        &self.controller
    }

    /// Poll until the shutdown token is cancelled
    pub async fn run(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recovery = tokio::time::interval(RECOVERY_INTERVAL);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "Payroll worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Payroll worker stopping");
                    break;
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.controller.recover_orphaned_jobs(self.config.stale_job_minutes).await {
                        error!(error = %e, "Orphaned payroll job recovery failed");
                    }
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(outcome) => log_outcome(&outcome),
                        Err(e) => error!(error = %e, "Payroll worker tick failed"),
                    }
                }
            }
        }

        Ok(())
    }

    /// One polling cycle
    pub async fn tick(&self) -> Result<TickOutcome> {
        let incidents = self.controller.check_incident_status().await?;
        if incidents.must_pause {
            let reason = incidents.reason.unwrap_or_else(|| "open incident".to_string());
            return self.hold(reason).await;
        }

        let health = self.controller.check_system_health().await?;
        if !health.healthy {
            let reason = health.reason.unwrap_or_else(|| "system unhealthy".to_string());
            return self.hold(reason).await;
        }

        let lock = self.controller.global_lock().await?;
        if lock.is_paused {
            let reason = lock.pause_reason.unwrap_or_default();
            if reason.starts_with(AUTO_PAUSE_PREFIX) {
                info!(previous = %reason, "Health checks pass again; lifting automatic pause");
                self.controller.resume_queue().await?;
            } else {
                return Ok(TickOutcome::Held { reason });
            }
        }

        let claim = match self.controller.claim_next_job().await? {
            Claim::Claimed(claim) => claim,
            Claim::NoSlot { reason } => return Ok(TickOutcome::NoSlot { reason }),
            Claim::Idle => return Ok(TickOutcome::Idle),
        };

        let mut guard = ClaimGuard::new(self.controller.pool().clone(), claim.clone());
        let outcome = self.run_claimed(claim).await;
        if outcome.is_ok() {
            guard.disarm();
        }
        outcome
    }

    /// Pause payroll (once) for a failed gate check
    async fn hold(&self, reason: String) -> Result<TickOutcome> {
        if !self.controller.is_paused().await? {
            self.controller
                .pause_queue(&format!("{}{}", AUTO_PAUSE_PREFIX, reason))
                .await?;
        }
        Ok(TickOutcome::Held { reason })
    }

    async fn run_claimed(&self, claim: ClaimedJob) -> Result<TickOutcome> {
        let pool = self.controller.pool();
        let wait_ms = self.controller.limits().max_lock_wait_ms;
        let job_id = claim.id().to_string();

        let recorded = match self.process_job(&claim).await {
            Ok(JobRun::Finished(checkpoint)) => {
                let done = retry_on_lock("complete_payroll_job", wait_ms, || {
                    jobs::mark_completed(pool, &claim, &checkpoint)
                })
                .await?;
                done.then(|| {
                    info!(
                        job_id = %job_id,
                        organization_id = %claim.job.organization_id,
                        processed = checkpoint.processed_count,
                        "Payroll job completed"
                    );
                    TickOutcome::Completed {
                        job_id: job_id.clone(),
                        processed: checkpoint.processed_count,
                    }
                })
            }
            Ok(JobRun::Paused(checkpoint)) => retry_on_lock("pause_payroll_job", wait_ms, || {
                jobs::mark_paused(pool, &claim, "Stopped at checkpoint: payroll paused")
            })
            .await?
            .then(|| TickOutcome::Paused {
                job_id: job_id.clone(),
                checkpoint,
            }),
            Ok(JobRun::ShutDown(checkpoint)) => retry_on_lock("requeue_payroll_job", wait_ms, || {
                jobs::requeue(pool, &claim, "Stopped at checkpoint: worker shutting down")
            })
            .await?
            .then(|| TickOutcome::Interrupted {
                job_id: job_id.clone(),
                checkpoint,
            }),
            Ok(JobRun::ClaimLost) => None,
            Err(e) => {
                let reason = e.to_string();
                let failure = retry_on_lock("record_payroll_failure", wait_ms, || {
                    jobs::record_failure(pool, &claim, &reason, self.config.backoff_base_secs)
                })
                .await?;
                failure.map(|failure| match failure {
                    FailureOutcome::Retrying {
                        retry_count,
                        not_before,
                    } => TickOutcome::Retrying {
                        job_id: job_id.clone(),
                        retry_count,
                        not_before,
                    },
                    FailureOutcome::Failed => TickOutcome::Failed {
                        job_id: job_id.clone(),
                        reason,
                    },
                })
            }
        };

        Ok(recorded.unwrap_or_else(|| TickOutcome::ClaimLost { job_id }))
    }

    /// Process tickets after the checkpoint cursor until input runs out
    async fn process_job(&self, claim: &ClaimedJob) -> Result<JobRun> {
        let job = &claim.job;
        let mut checkpoint = job.checkpoint.unwrap_or_default();
        let mut last_saved = checkpoint;

        let remaining = self
            .source
            .count_remaining(&job.organization_id, checkpoint.last_processed_ticket_id)
            .await?;
        let total = checkpoint.processed_count + remaining;

        loop {
            if self.shutdown.is_cancelled() {
                if !self.checkpoint_if_advanced(claim, &checkpoint, &mut last_saved, total).await? {
                    return Ok(JobRun::ClaimLost);
                }
                return Ok(JobRun::ShutDown(checkpoint));
            }
            if self.controller.is_paused().await? {
                if !self.checkpoint_if_advanced(claim, &checkpoint, &mut last_saved, total).await? {
                    return Ok(JobRun::ClaimLost);
                }
                return Ok(JobRun::Paused(checkpoint));
            }

            let batch = self
                .source
                .fetch_batch(
                    &job.organization_id,
                    checkpoint.last_processed_ticket_id,
                    self.config.batch_size,
                )
                .await?;
            let batch_len = batch.len() as i64;

            debug!(
                job_id = %job.id,
                after_id = checkpoint.last_processed_ticket_id,
                batch_len,
                "Processing payroll batch"
            );

            for ticket in &batch {
                self.source.process(&job.id, ticket).await?;
                checkpoint.last_processed_ticket_id = ticket.id;
                checkpoint.processed_count += 1;

                if checkpoint.processed_count % self.config.checkpoint_every == 0 {
                    if !self.save_checkpoint(claim, &checkpoint, total).await? {
                        return Ok(JobRun::ClaimLost);
                    }
                    last_saved = checkpoint;
                }
            }

            if batch_len < self.config.batch_size {
                return Ok(JobRun::Finished(checkpoint));
            }
        }
    }

    /// False when the claim is gone
    async fn checkpoint_if_advanced(
        &self,
        claim: &ClaimedJob,
        checkpoint: &Checkpoint,
        last_saved: &mut Checkpoint,
        total: i64,
    ) -> Result<bool> {
        if *checkpoint == *last_saved {
            return Ok(true);
        }
        let saved = self.save_checkpoint(claim, checkpoint, total).await?;
        if saved {
            *last_saved = *checkpoint;
        }
        Ok(saved)
    }

    async fn save_checkpoint(&self, claim: &ClaimedJob, checkpoint: &Checkpoint, total: i64) -> Result<bool> {
        retry_on_lock(
            "save_payroll_checkpoint",
            self.controller.limits().max_lock_wait_ms,
            || jobs::save_checkpoint(self.controller.pool(), claim, checkpoint, progress(checkpoint, total)),
        )
        .await
    }
}

fn progress(checkpoint: &Checkpoint, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    (checkpoint.processed_count as f64 * 100.0 / total as f64).min(100.0)
}

fn log_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Held { reason } => warn!(reason = %reason, "Payroll held"),
        TickOutcome::NoSlot { reason } => debug!(reason = %reason, "No payroll slot"),
        TickOutcome::Idle => debug!("Payroll queue idle"),
        TickOutcome::Completed { job_id, processed } => {
            info!(job_id = %job_id, processed, "Tick completed a job")
        }
        TickOutcome::Paused { job_id, checkpoint } => warn!(
            job_id = %job_id,
            last_processed_ticket_id = checkpoint.last_processed_ticket_id,
            "Job paused at checkpoint"
        ),
        TickOutcome::Interrupted { job_id, .. } => info!(job_id = %job_id, "Job interrupted by shutdown"),
        TickOutcome::Retrying {
            job_id,
            retry_count,
            not_before,
        } => warn!(job_id = %job_id, retry_count, not_before = %not_before, "Job will retry"),
        TickOutcome::Failed { job_id, reason } => {
            error!(job_id = %job_id, reason = %reason, "Job failed")
        }
        TickOutcome::ClaimLost { job_id } => warn!(job_id = %job_id, "Job claim lost mid-run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress() {
        let cp = Checkpoint {
            last_processed_ticket_id: 40,
            processed_count: 25,
        };
        assert_eq!(progress(&cp, 100), 25.0);
        assert_eq!(progress(&cp, 0), 100.0);
        assert_eq!(progress(&cp, 20), 100.0);
    }
}
