//! Entitlement store seam
//!
//! The store is the final arbiter of uniqueness: `create` must reject a second
//! record for the same external payment reference atomically, at the storage
//! layer. Callers may pre-check with `find_by_external_ref`, but that check is
//! never the guard.

mod memory;
mod sqlite;

pub use memory::MemoryEntitlementStore;
pub use sqlite::SqliteEntitlementStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::EntitlementRecord;

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Look up the record for a payment reference, whatever account owns it
    async fn find_by_external_ref(
        &self,
        reference: &str,
    ) -> Result<Option<EntitlementRecord>, StoreError>;

    /// Look up the record for a payment reference owned by `account_id`
    async fn find(
        &self,
        account_id: &str,
        reference: &str,
    ) -> Result<Option<EntitlementRecord>, StoreError> {
        Ok(self
            .find_by_external_ref(reference)
            .await?
            .filter(|record| record.account_id == account_id))
    }

    /// Insert a new record
    ///
    /// Returns [`StoreError::Duplicate`] if any record already uses the same
    /// external payment reference.
    async fn create(&self, record: &EntitlementRecord) -> Result<EntitlementRecord, StoreError>;
}
