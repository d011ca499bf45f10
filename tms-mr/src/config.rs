//! Matching run configuration
//!
//! **Priority per threshold:** request override → `[matching]` TOML section →
//! settings table → compiled default. The settings rows always exist once the
//! database is initialised, so TOML values act as a deployment-level pin.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tms_common::config::MatchingToml;
use tms_common::db::settings::get_setting_or;
use tms_common::{Error, Result};

use crate::classify::Thresholds;

pub const DEFAULT_QUANTITY_VARIANCE_PCT: f64 = 5.0;
pub const DEFAULT_PRICE_VARIANCE_PCT: f64 = 5.0;
pub const DEFAULT_DELIVERY_WINDOW_DAYS: i64 = 7;
pub const DEFAULT_STALE_RUN_MINUTES: i64 = 60;

/// Inputs of one matching run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub organization_id: String,
    pub quantity_variance_pct: f64,
    pub price_variance_pct: f64,
    pub delivery_window_days: i64,
}

/// Per-request threshold overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverrides {
    pub quantity_variance_pct: Option<f64>,
    pub price_variance_pct: Option<f64>,
    pub delivery_window_days: Option<i64>,
}

impl MatchingConfig {
    /// Config with compiled default thresholds
    pub fn with_defaults(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            quantity_variance_pct: DEFAULT_QUANTITY_VARIANCE_PCT,
            price_variance_pct: DEFAULT_PRICE_VARIANCE_PCT,
            delivery_window_days: DEFAULT_DELIVERY_WINDOW_DAYS,
        }
    }

    /// Resolve thresholds for `organization_id` from overrides, TOML and settings
    pub async fn resolve(
        pool: &SqlitePool,
        organization_id: &str,
        overrides: &ThresholdOverrides,
        toml: &MatchingToml,
    ) -> Result<Self> {
        let quantity_variance_pct = match overrides
            .quantity_variance_pct
            .or(toml.quantity_variance_pct)
        {
            Some(v) => v,
            None => {
                get_setting_or(pool, "matching_quantity_variance_pct", DEFAULT_QUANTITY_VARIANCE_PCT)
                    .await?
            }
        };
        let price_variance_pct = match overrides.price_variance_pct.or(toml.price_variance_pct) {
            Some(v) => v,
            None => {
                get_setting_or(pool, "matching_price_variance_pct", DEFAULT_PRICE_VARIANCE_PCT).await?
            }
        };
        let delivery_window_days = match overrides
            .delivery_window_days
            .or(toml.delivery_window_days)
        {
            Some(v) => v,
            None => {
                get_setting_or(pool, "matching_delivery_window_days", DEFAULT_DELIVERY_WINDOW_DAYS)
                    .await?
            }
        };

        Ok(Self {
            organization_id: organization_id.to_string(),
            quantity_variance_pct,
            price_variance_pct,
            delivery_window_days,
        })
    }

    /// Reject configs a run cannot be started with
    pub fn validate(&self) -> Result<()> {
        if self.organization_id.trim().is_empty() {
            return Err(Error::InvalidInput("organization_id must not be empty".to_string()));
        }
        for (name, value) in [
            ("quantity_variance_pct", self.quantity_variance_pct),
            ("price_variance_pct", self.price_variance_pct),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.delivery_window_days < 0 {
            return Err(Error::InvalidInput(format!(
                "delivery_window_days must not be negative, got {}",
                self.delivery_window_days
            )));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            quantity_variance_pct: self.quantity_variance_pct,
            price_variance_pct: self.price_variance_pct,
            delivery_window_days: self.delivery_window_days,
        }
    }
}
