//! Database initialization
//!
//! Creates the shared SQLite database on first run and brings the schema up to
//! date on every start. All statements are idempotent.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How long a writer waits on a locked database before failing
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // WAL allows concurrent readers with one writer. Writers racing on the
    // entitlements unique index wait instead of failing.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Open an in-memory database with the full schema
///
/// Limited to a single connection so every query sees the same memory database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(
            SqliteConnectOptions::from_str("sqlite::memory:")?
                .foreign_keys(true)
                .busy_timeout(BUSY_TIMEOUT),
        )
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables
///
/// Connection pragmas are set on the connect options, not here.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_accounts_table(pool).await?;
    create_entitlements_table(pool).await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the accounts table
///
/// Local mirror of identity-provider accounts, populated from `account_created`
/// callbacks. Email is stored normalized (trimmed, lowercase).
async fn create_accounts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the entitlements table
///
/// The UNIQUE constraint on `external_payment_reference` is what guarantees one
/// entitlement per payment; application-level checks are only a shortcut.
async fn create_entitlements_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entitlements (
            entitlement_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            external_payment_reference TEXT NOT NULL UNIQUE,
            plan TEXT NOT NULL CHECK (plan IN ('standard', 'premium')),
            status TEXT NOT NULL CHECK (status IN ('active', 'expired', 'canceled')),
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entitlements_account ON entitlements(account_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn table_names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_database_creation_when_missing() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sub").join("tutor.db");

        let pool = init_database(&db_path).await.unwrap();

        assert!(db_path.exists(), "Database file was not created");
        assert_eq!(
            table_names(&pool).await,
            vec!["accounts", "entitlements", "settings"]
        );
    }

    #[tokio::test]
    async fn test_pragmas_apply_to_every_pooled_connection() {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database(&temp_dir.path().join("tutor.db")).await.unwrap();

        // Hold several connections at once so the pool must open new ones
        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(pool.acquire().await.unwrap());
        }

        for conn in conns.iter_mut() {
            let timeout: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
                .fetch_one(&mut **conn)
                .await
                .unwrap();
            let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
                .fetch_one(&mut **conn)
                .await
                .unwrap();
            let journal: String = sqlx::query_scalar("PRAGMA journal_mode")
                .fetch_one(&mut **conn)
                .await
                .unwrap();

            assert_eq!(timeout, BUSY_TIMEOUT.as_millis() as i64);
            assert_eq!(foreign_keys, 1);
            assert_eq!(journal.to_lowercase(), "wal");
        }
    }

    #[tokio::test]
    async fn test_database_opens_existing() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("tutor.db");

        let pool1 = init_database(&db_path).await.unwrap();
        drop(pool1);

        let pool2 = init_database(&db_path).await;
        assert!(pool2.is_ok(), "Failed to reopen database: {:?}", pool2.err());
    }

    #[tokio::test]
    async fn test_entitlement_reference_is_unique() {
        let pool = init_memory_database().await.unwrap();

        let insert = |id: &'static str, account: &'static str| {
            sqlx::query(
                r#"
                INSERT INTO entitlements (
                    entitlement_id, account_id, external_payment_reference, plan, status,
                    period_start, period_end, source, created_at
                ) VALUES (?, ?, 'PAY-1', 'standard', 'active', 'x', 'y', 'automatic', 'z')
                "#,
            )
            .bind(id)
            .bind(account)
        };

        insert("e1", "acct-1").execute(&pool).await.unwrap();
        let second = insert("e2", "acct-2").execute(&pool).await;

        let err = second.expect_err("duplicate reference must be rejected");
        let db_err = err.as_database_error().expect("database error");
        assert!(db_err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_plan_check_constraint() {
        let pool = init_memory_database().await.unwrap();

        let result = sqlx::query(
            r#"
            INSERT INTO entitlements (
                entitlement_id, account_id, external_payment_reference, plan, status,
                period_start, period_end, source, created_at
            ) VALUES ('e1', 'a', 'PAY-1', 'gold', 'active', 'x', 'y', 'automatic', 'z')
            "#,
        )
        .execute(&pool)
        .await;

        assert!(result.is_err());
    }
}
