//! Matching Engine
//!
//! One call reconciles the whole current backlog of an organization:
//! admit run → load sources → pair and classify → persist groups → complete run.
//!
//! A storage error aborts the run and leaves its row `running`; groups already
//! written stay written. The stuck row stops blocking new runs once it is older
//! than the stale-run window.

use sqlx::SqlitePool;
use tms_common::db::{get_setting_or, retry_on_lock};
use tms_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::config::{MatchingConfig, DEFAULT_STALE_RUN_MINUTES};
use crate::db::{complete_run, load_sources, persist_group, record_input_counts, try_begin_run};
use crate::models::MatchingSummary;
use crate::reconcile::reconcile;

pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

pub struct MatchingEngine {
    db: SqlitePool,
    stale_run_minutes: i64,
    max_lock_wait_ms: u64,
}

impl MatchingEngine {
    pub fn new(db: SqlitePool, stale_run_minutes: i64, max_lock_wait_ms: u64) -> Self {
        Self {
            db,
            stale_run_minutes,
            max_lock_wait_ms,
        }
    }

    /// Engine with run-admission and lock-wait limits read from the settings table
    pub async fn from_settings(db: SqlitePool) -> Result<Self> {
        let stale_run_minutes =
            get_setting_or(&db, "matching_stale_run_minutes", DEFAULT_STALE_RUN_MINUTES).await?;
        let max_lock_wait_ms =
            get_setting_or(&db, "db_max_lock_wait_ms", DEFAULT_MAX_LOCK_WAIT_MS).await?;
        Ok(Self::new(db, stale_run_minutes, max_lock_wait_ms))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Run one reconciliation pass for `config.organization_id`
    ///
    /// Returns `Error::InvalidInput` for unusable thresholds and
    /// `Error::Conflict` while another run of the organization is active.
    pub async fn run_matching(&self, config: &MatchingConfig) -> Result<MatchingSummary> {
        config.validate()?;
        let organization_id = config.organization_id.as_str();

        let run_id = try_begin_run(&self.db, organization_id, self.stale_run_minutes)
            .await?
            .ok_or_else(|| {
                warn!(organization_id, "Matching run refused: another run is active");
                Error::Conflict(format!(
                    "A matching run is already active for organization {}",
                    organization_id
                ))
            })?;

        info!(
            run_id = %run_id,
            organization_id,
            quantity_variance_pct = config.quantity_variance_pct,
            price_variance_pct = config.price_variance_pct,
            delivery_window_days = config.delivery_window_days,
            "Matching run started"
        );

        let sources = load_sources(&self.db, organization_id).await?;
        let input_counts = sources.counts();
        record_input_counts(&self.db, &run_id, &input_counts).await?;

        debug!(run_id = %run_id, ?input_counts, "Source records loaded");

        let reconciliation = reconcile(&sources, &config.thresholds());

        for group in &reconciliation.groups {
            let record_id = retry_on_lock("persist_matched_group", self.max_lock_wait_ms, || {
                persist_group(&self.db, organization_id, &run_id, group)
            })
            .await?;

            if !group.evaluation.findings.is_empty() {
                warn!(
                    run_id = %run_id,
                    matched_record_id = %record_id,
                    invoice_id = group.invoice_id,
                    key = %group.group_key,
                    exceptions = group.evaluation.findings.len(),
                    "Invoice reconciled with exceptions"
                );
            }
        }

        let matched_count = reconciliation.matched_count();
        let exception_count = reconciliation.exception_count();
        let unconsumed = reconciliation.unconsumed;

        complete_run(
            &self.db,
            &run_id,
            matched_count,
            exception_count,
            unconsumed.total(),
        )
        .await?;

        info!(
            run_id = %run_id,
            organization_id,
            invoices = input_counts.invoices,
            matched_count,
            exception_count,
            unconsumed = unconsumed.total(),
            "Matching run completed"
        );

        Ok(MatchingSummary {
            run_id,
            organization_id: organization_id.to_string(),
            input_counts,
            matched_count,
            exception_count,
            unconsumed,
        })
    }
}
