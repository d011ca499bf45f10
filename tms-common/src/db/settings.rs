//! Settings table access
//!
//! Values are stored as text and parsed on read; a missing or unparsable value
//! falls back to the caller's default.

use crate::{Error, Result};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{info, warn};

/// Ensure a setting exists with the specified default value
///
/// A missing row is created; a NULL value is reset to the default. Existing
/// values are left untouched.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // INSERT OR IGNORE handles concurrent initialization by several processes
    let inserted = sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(default_value)
        .execute(pool)
        .await?;

    if inserted.rows_affected() > 0 {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let reset = sqlx::query("UPDATE settings SET value = ? WHERE key = ? AND value IS NULL")
        .bind(default_value)
        .bind(key)
        .execute(pool)
        .await?;

    if reset.rows_affected() > 0 {
        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

/// Read a raw setting value
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(value.flatten())
}

/// Read and parse a setting, using `default` when absent or unparsable
pub async fn get_setting_or<T>(pool: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: FromStr + std::fmt::Display,
{
    match get_setting(pool, key).await? {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!("Setting '{}' has unparsable value '{}', using {}", key, raw, default);
                Ok(default)
            }
        },
        None => Ok(default),
    }
}

/// Write a setting value
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::InvalidInput("Setting key must not be empty".to_string()));
    }

    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}
