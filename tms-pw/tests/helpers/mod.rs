//! Test Helper Utilities
//!
//! Shared setup and ticket sources for tms-pw integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tms_common::db::init_database;
use tms_common::{Error, Result};
use tms_pw::config::{ControllerLimits, WorkerConfig};
use tms_pw::models::Ticket;
use tms_pw::probe::FixedProbe;
use tms_pw::{DbTicketSource, PayrollController, PayrollWorker, TickOutcome, TicketSource};

pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("tms.db")).await.unwrap();
    (temp_dir, pool)
}

pub fn controller_with_probe(pool: &SqlitePool, probe: FixedProbe) -> PayrollController {
    PayrollController::new(pool.clone(), Arc::new(probe), ControllerLimits::default())
}

pub fn healthy_controller(pool: &SqlitePool) -> PayrollController {
    controller_with_probe(pool, FixedProbe::idle())
}

pub fn worker_with_source(controller: PayrollController, source: Arc<dyn TicketSource>) -> PayrollWorker {
    PayrollWorker::new(controller, source, WorkerConfig::default())
}

pub fn db_worker(pool: &SqlitePool) -> PayrollWorker {
    worker_with_source(healthy_controller(pool), Arc::new(DbTicketSource::new(pool.clone())))
}

/// Insert `count` tickets for `org`; returns their ids in order
pub async fn seed_tickets(pool: &SqlitePool, org: &str, count: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = sqlx::query(
            "INSERT INTO tickets (organization_id, driver_id, quantity, pay_rate) VALUES (?, ?, ?, ?)",
        )
        .bind(org)
        .bind(format!("driver-{}", i % 3))
        .bind(10.0)
        .bind(2.5)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();
        ids.push(id);
    }
    ids
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

pub async fn running_count(pool: &SqlitePool) -> i64 {
    count(pool, "SELECT running_count FROM payroll_global_lock WHERE id = 1").await
}

/// Database source that records every `after_id` the worker asks for
pub struct RecordingSource {
    inner: DbTicketSource,
    pub after_ids: Mutex<Vec<i64>>,
}

impl RecordingSource {
    pub fn new(pool: &SqlitePool) -> Self {
        Self {
            inner: DbTicketSource::new(pool.clone()),
            after_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn after_ids(&self) -> Vec<i64> {
        self.after_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl TicketSource for RecordingSource {
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        self.after_ids.lock().unwrap().push(after_id);
        self.inner.fetch_batch(organization_id, after_id, limit).await
    }

    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()> {
        self.inner.process(job_id, ticket).await
    }

    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64> {
        self.inner.count_remaining(organization_id, after_id).await
    }
}

/// Database source whose `process` fails on one ticket id
pub struct FailingSource {
    inner: DbTicketSource,
    fail_on: i64,
}

impl FailingSource {
    pub fn new(pool: &SqlitePool, fail_on: i64) -> Self {
        Self {
            inner: DbTicketSource::new(pool.clone()),
            fail_on,
        }
    }
}

#[async_trait]
impl TicketSource for FailingSource {
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        self.inner.fetch_batch(organization_id, after_id, limit).await
    }

    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()> {
        if ticket.id == self.fail_on {
            return Err(Error::Internal(format!("pay rate lookup failed for ticket {}", ticket.id)));
        }
        self.inner.process(job_id, ticket).await
    }

    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64> {
        self.inner.count_remaining(organization_id, after_id).await
    }
}

/// Database source that pauses payroll while processing one ticket id
pub struct PausingSource {
    inner: DbTicketSource,
    controller: PayrollController,
    pause_on: i64,
}

impl PausingSource {
    pub fn new(pool: &SqlitePool, controller: PayrollController, pause_on: i64) -> Self {
        Self {
            inner: DbTicketSource::new(pool.clone()),
            controller,
            pause_on,
        }
    }
}

#[async_trait]
impl TicketSource for PausingSource {
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        self.inner.fetch_batch(organization_id, after_id, limit).await
    }

    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()> {
        self.inner.process(job_id, ticket).await?;
        if ticket.id == self.pause_on {
            self.controller.pause_queue("Scheduled maintenance").await?;
        }
        Ok(())
    }

    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64> {
        self.inner.count_remaining(organization_id, after_id).await
    }
}

/// What a `MidBatchSource` does while processing its trigger ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidBatch {
    /// Pause then immediately resume payroll, then let a second worker tick
    PauseResumeThenTick,
    /// Age the job's heartbeat, run orphan recovery, then let a second worker tick
    RecoverThenTick,
}

/// Database source that interleaves a second worker while one ticket is processed
pub struct MidBatchSource {
    inner: DbTicketSource,
    pool: SqlitePool,
    controller: PayrollController,
    trigger_on: i64,
    action: MidBatch,
    pub second_tick: Mutex<Option<TickOutcome>>,
}

impl MidBatchSource {
    pub fn new(pool: &SqlitePool, controller: PayrollController, trigger_on: i64, action: MidBatch) -> Self {
        Self {
            inner: DbTicketSource::new(pool.clone()),
            pool: pool.clone(),
            controller,
            trigger_on,
            action,
            second_tick: Mutex::new(None),
        }
    }

    pub fn second_tick(&self) -> Option<TickOutcome> {
        self.second_tick.lock().unwrap().clone()
    }
}

#[async_trait]
impl TicketSource for MidBatchSource {
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        self.inner.fetch_batch(organization_id, after_id, limit).await
    }

    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()> {
        self.inner.process(job_id, ticket).await?;
        if ticket.id != self.trigger_on {
            return Ok(());
        }

        match self.action {
            MidBatch::PauseResumeThenTick => {
                self.controller.pause_queue("maintenance").await?;
                self.controller.resume_queue().await?;
            }
            MidBatch::RecoverThenTick => {
                sqlx::query("UPDATE payroll_jobs SET updated_at = '2000-01-01T00:00:00.000000Z' WHERE id = ?")
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
                self.controller.recover_orphaned_jobs(30).await?;
            }
        }

        let outcome = db_worker(&self.pool).tick().await?;
        *self.second_tick.lock().unwrap() = Some(outcome);
        Ok(())
    }

    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64> {
        self.inner.count_remaining(organization_id, after_id).await
    }
}

/// Database source that never returns from `process` for one ticket id
pub struct StallingSource {
    inner: DbTicketSource,
    stall_on: i64,
}

impl StallingSource {
    pub fn new(pool: &SqlitePool, stall_on: i64) -> Self {
        Self {
            inner: DbTicketSource::new(pool.clone()),
            stall_on,
        }
    }
}

#[async_trait]
impl TicketSource for StallingSource {
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        self.inner.fetch_batch(organization_id, after_id, limit).await
    }

    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()> {
        if ticket.id == self.stall_on {
            std::future::pending::<()>().await;
        }
        self.inner.process(job_id, ticket).await
    }

    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64> {
        self.inner.count_remaining(organization_id, after_id).await
    }
}

/// Database source that panics while processing one ticket id
pub struct PanickingSource {
    inner: DbTicketSource,
    panic_on: i64,
}

impl PanickingSource {
    pub fn new(pool: &SqlitePool, panic_on: i64) -> Self {
        Self {
            inner: DbTicketSource::new(pool.clone()),
            panic_on,
        }
    }
}

#[async_trait]
impl TicketSource for PanickingSource {
    async fn fetch_batch(&self, organization_id: &str, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        self.inner.fetch_batch(organization_id, after_id, limit).await
    }

    async fn process(&self, job_id: &str, ticket: &Ticket) -> Result<()> {
        if ticket.id == self.panic_on {
            panic!("pay calculation bug on ticket {}", ticket.id);
        }
        self.inner.process(job_id, ticket).await
    }

    async fn count_remaining(&self, organization_id: &str, after_id: i64) -> Result<i64> {
        self.inner.count_remaining(organization_id, after_id).await
    }
}

/// Poll until the global running count drops to zero, or give up after a second
pub async fn wait_for_slots_released(pool: &SqlitePool) -> i64 {
    for _ in 0..100 {
        let running = running_count(pool).await;
        if running == 0 {
            return 0;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    running_count(pool).await
}
