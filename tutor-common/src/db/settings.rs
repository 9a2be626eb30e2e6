//! Runtime settings stored in the `settings` table
//!
//! Missing or NULL values are replaced by the caller-supplied default, which is
//! written back so the table always documents the effective configuration.

use crate::{Error, Result};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Read a raw setting value
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value.flatten())
}

/// Insert or replace a setting value
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

/// Read and parse a setting, writing `default` back if it is missing
pub async fn get_setting_or_default<T>(pool: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
    T::Err: std::fmt::Display,
{
    match get_setting(pool, key).await? {
        Some(value) => value.trim().parse::<T>().map_err(|e| {
            Error::Config(format!("Invalid value '{}' for setting '{}': {}", value, key, e))
        }),
        None => {
            let default_str = default.to_string();
            info!("Setting '{}' not found in database, using default: {}", key, default_str);
            set_setting(pool, key, &default_str).await?;
            Ok(default)
        }
    }
}
