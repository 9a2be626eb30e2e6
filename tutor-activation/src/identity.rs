//! Identity provider seam
//!
//! Sign-up and sign-in belong to the external identity provider. This crate
//! only needs `resolve(email) -> account_id`. The SQLite directory mirrors
//! accounts reported through the `account_created` callback.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::IdentityError;
use crate::models::normalize_email;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Account id for `email`, or `None` if no account exists yet
    async fn resolve(&self, email: &str) -> Result<Option<String>, IdentityError>;
}

/// Account directory backed by the `accounts` table
#[derive(Clone)]
pub struct SqliteAccountDirectory {
    pool: SqlitePool,
}

impl SqliteAccountDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an account reported by the identity provider
    ///
    /// Replaying the same `(account_id, email)` is a no-op. An email already
    /// bound to another account is a conflict.
    pub async fn record_account(&self, account_id: &str, email: &str) -> Result<(), IdentityError> {
        let email = normalize_email(email);

        let inserted = sqlx::query(
            "INSERT INTO accounts (account_id, email) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(account_id)
        .bind(&email)
        .execute(&self.pool)
        .await
        .map_err(|e| IdentityError::Unavailable(e.to_string()))?
        .rows_affected();

        if inserted == 1 {
            tracing::info!(account_id, email = %email, "Account recorded");
            return Ok(());
        }

        match self.resolve(&email).await? {
            Some(existing) if existing == account_id => Ok(()),
            Some(existing) => Err(IdentityError::Conflict { email, existing }),
            // Same account_id already bound to a different email
            None => Err(IdentityError::Conflict {
                email,
                existing: account_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl IdentityProvider for SqliteAccountDirectory {
    async fn resolve(&self, email: &str) -> Result<Option<String>, IdentityError> {
        sqlx::query_scalar("SELECT account_id FROM accounts WHERE email = ?")
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))
    }
}
