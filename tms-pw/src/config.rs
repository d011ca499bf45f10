//! Payroll worker configuration
//!
//! **Priority per value:** `[payroll]` TOML section (where it has a key) →
//! settings table → compiled default.

use std::time::Duration;

use sqlx::SqlitePool;
use tms_common::config::PayrollToml;
use tms_common::db::get_setting_or;
use tms_common::{Error, Result};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BATCH_SIZE: i64 = 100;
pub const DEFAULT_CHECKPOINT_EVERY: i64 = 10;
pub const DEFAULT_MAX_RETRIES: i64 = 2;
pub const DEFAULT_BACKOFF_BASE_SECS: i64 = 60;
pub const DEFAULT_STALE_JOB_MINUTES: i64 = 30;
pub const DEFAULT_MEMORY_LIMIT_PCT: f64 = 85.0;
pub const DEFAULT_DISK_LIMIT_PCT: f64 = 80.0;
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Worker loop settings
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
    pub batch_size: i64,
    pub checkpoint_every: i64,
    pub backoff_base_secs: i64,
    pub stale_job_minutes: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            stale_job_minutes: DEFAULT_STALE_JOB_MINUTES,
        }
    }
}

impl WorkerConfig {
    pub async fn load(pool: &SqlitePool, toml: &PayrollToml) -> Result<Self> {
        let poll_interval_secs = match toml.poll_interval_secs {
            Some(v) => v,
            None => {
                get_setting_or(pool, "payroll_poll_interval_secs", DEFAULT_POLL_INTERVAL_SECS)
                    .await?
            }
        };
        let batch_size = match toml.batch_size {
            Some(v) => v,
            None => get_setting_or(pool, "payroll_batch_size", DEFAULT_BATCH_SIZE).await?,
        };

        let config = Self {
            poll_interval_secs,
            batch_size,
            checkpoint_every: get_setting_or(pool, "payroll_checkpoint_every", DEFAULT_CHECKPOINT_EVERY)
                .await?,
            backoff_base_secs: get_setting_or(
                pool,
                "payroll_backoff_base_secs",
                DEFAULT_BACKOFF_BASE_SECS,
            )
            .await?,
            stale_job_minutes: get_setting_or(
                pool,
                "payroll_stale_job_minutes",
                DEFAULT_STALE_JOB_MINUTES,
            )
            .await?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("payroll poll interval must be at least 1 second".to_string()));
        }
        if self.batch_size < 1 {
            return Err(Error::Config(format!(
                "payroll batch size must be positive, got {}",
                self.batch_size
            )));
        }
        if self.checkpoint_every < 1 {
            return Err(Error::Config(format!(
                "payroll checkpoint interval must be positive, got {}",
                self.checkpoint_every
            )));
        }
        if self.backoff_base_secs < 0 || self.stale_job_minutes < 1 {
            return Err(Error::Config(
                "payroll backoff must be non-negative and stale window at least 1 minute".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Limits for the resource part of `check_system_health`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerLimits {
    pub memory_limit_pct: f64,
    pub disk_limit_pct: f64,
    pub default_max_retries: i64,
    pub max_lock_wait_ms: u64,
}

impl Default for ControllerLimits {
    fn default() -> Self {
        Self {
            memory_limit_pct: DEFAULT_MEMORY_LIMIT_PCT,
            disk_limit_pct: DEFAULT_DISK_LIMIT_PCT,
            default_max_retries: DEFAULT_MAX_RETRIES,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }
}

impl ControllerLimits {
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        Ok(Self {
            memory_limit_pct: get_setting_or(pool, "payroll_memory_limit_pct", DEFAULT_MEMORY_LIMIT_PCT)
                .await?,
            disk_limit_pct: get_setting_or(pool, "payroll_disk_limit_pct", DEFAULT_DISK_LIMIT_PCT)
                .await?,
            default_max_retries: get_setting_or(
                pool,
                "payroll_default_max_retries",
                DEFAULT_MAX_RETRIES,
            )
            .await?,
            max_lock_wait_ms: get_setting_or(pool, "db_max_lock_wait_ms", DEFAULT_MAX_LOCK_WAIT_MS)
                .await?,
        })
    }
}

/// Delay before a job that has failed `retry_count` times may run again
///
/// `2^retry_count * base_secs`: 60 s, 120 s, 240 s … for the default base.
pub fn backoff_delay_secs(retry_count: i64, base_secs: i64) -> i64 {
    let exponent = retry_count.clamp(0, 20) as u32;
    base_secs.saturating_mul(1i64 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_retry() {
        assert_eq!(backoff_delay_secs(0, 60), 60);
        assert_eq!(backoff_delay_secs(1, 60), 120);
        assert_eq!(backoff_delay_secs(2, 60), 240);
        assert_eq!(backoff_delay_secs(-1, 60), 60);
        assert_eq!(backoff_delay_secs(3, 0), 0);
    }

    #[test]
    fn test_validate() {
        assert!(WorkerConfig::default().validate().is_ok());

        let config = WorkerConfig {
            batch_size: 0,
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = WorkerConfig {
            checkpoint_every: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
