//! SQLite-backed entitlement store
//!
//! Uniqueness comes from the `UNIQUE` constraint on
//! `entitlements.external_payment_reference` (see `tutor_common::db::init`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::EntitlementStore;
use crate::error::StoreError;
use crate::models::EntitlementRecord;

const SELECT_COLUMNS: &str = r#"
    SELECT entitlement_id, account_id, external_payment_reference, plan, status,
           period_start, period_end, source, created_at
    FROM entitlements
"#;

#[derive(Clone)]
pub struct SqliteEntitlementStore {
    pool: SqlitePool,
}

impl SqliteEntitlementStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementStore for SqliteEntitlementStore {
    async fn find_by_external_ref(
        &self,
        reference: &str,
    ) -> Result<Option<EntitlementRecord>, StoreError> {
        let query = format!("{} WHERE external_payment_reference = ?", SELECT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, reference))?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn create(&self, record: &EntitlementRecord) -> Result<EntitlementRecord, StoreError> {
        let reference = record.external_payment_reference.as_str();

        sqlx::query(
            r#"
            INSERT INTO entitlements (
                entitlement_id, account_id, external_payment_reference, plan, status,
                period_start, period_end, source, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.entitlement_id.to_string())
        .bind(&record.account_id)
        .bind(reference)
        .bind(record.plan.as_str())
        .bind(record.status.as_str())
        .bind(record.period_start.to_rfc3339())
        .bind(record.period_end.to_rfc3339())
        .bind(record.source.as_str())
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, reference))?;

        tracing::debug!(reference, account_id = %record.account_id, "Entitlement row inserted");

        Ok(record.clone())
    }
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = row
        .try_get(column)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", column, e)))
}

fn parse_text<T>(row: &SqliteRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row
        .try_get(column)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    raw.parse::<T>()
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", column, e)))
}

fn row_to_record(row: &SqliteRow) -> Result<EntitlementRecord, StoreError> {
    let entitlement_id: Uuid = parse_text(row, "entitlement_id")?;

    Ok(EntitlementRecord {
        entitlement_id,
        account_id: row
            .try_get("account_id")
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        external_payment_reference: row
            .try_get("external_payment_reference")
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        plan: parse_text(row, "plan")?,
        status: parse_text(row, "status")?,
        period_start: parse_timestamp(row, "period_start")?,
        period_end: parse_timestamp(row, "period_end")?,
        source: parse_text(row, "source")?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntitlementSource, EntitlementStatus, Plan};
    use tutor_common::db::init_memory_database;

    fn record(account: &str, reference: &str) -> EntitlementRecord {
        EntitlementRecord::new_active(
            account,
            reference,
            Plan::Standard,
            Utc::now(),
            30,
            EntitlementSource::Automatic,
        )
    }

    #[tokio::test]
    async fn test_create_then_find() {
        let store = SqliteEntitlementStore::new(init_memory_database().await.unwrap());
        let created = store.create(&record("acct-1", "PAY-1")).await.unwrap();

        let found = store.find_by_external_ref("PAY-1").await.unwrap().unwrap();
        assert_eq!(found.entitlement_id, created.entitlement_id);
        assert_eq!(found.plan, Plan::Standard);
        assert_eq!(found.status, EntitlementStatus::Active);
        assert_eq!(found.period_start.timestamp(), created.period_start.timestamp());
    }

    #[tokio::test]
    async fn test_find_filters_by_account() {
        let store = SqliteEntitlementStore::new(init_memory_database().await.unwrap());
        store.create(&record("acct-1", "PAY-1")).await.unwrap();

        assert!(store.find("acct-1", "PAY-1").await.unwrap().is_some());
        assert!(store.find("acct-2", "PAY-1").await.unwrap().is_none());
        assert!(store.find_by_external_ref("PAY-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected_across_accounts() {
        let store = SqliteEntitlementStore::new(init_memory_database().await.unwrap());
        store.create(&record("acct-1", "PAY-1")).await.unwrap();

        let err = store.create(&record("acct-2", "PAY-1")).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Duplicate {
                reference: "PAY-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_closed_pool_is_unavailable() {
        let pool = init_memory_database().await.unwrap();
        let store = SqliteEntitlementStore::new(pool.clone());
        pool.close().await;

        let err = store.find_by_external_ref("PAY-1").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_corrupt_row_reported() {
        let pool = init_memory_database().await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO entitlements (
                entitlement_id, account_id, external_payment_reference, plan, status,
                period_start, period_end, source, created_at
            ) VALUES ('not-a-uuid', 'a', 'PAY-1', 'standard', 'active', 'x', 'y', 'automatic', 'z')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let store = SqliteEntitlementStore::new(pool);
        let err = store.find_by_external_ref("PAY-1").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
