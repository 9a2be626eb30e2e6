//! Activation Service: the idempotent core
//!
//! One call is one attempt:
//! 1. Duplicate check by payment reference; an active record for the same
//!    account is returned as-is
//! 2. Otherwise `create`; the store's unique constraint is the real guard
//! 3. A uniqueness violation means another caller won: re-read and return
//!    that record
//! 4. Any other store failure is classified (transient or terminal) and
//!    returned; retrying is the caller's job ([`crate::retry`])
//!
//! No record is ever written on a failure path.

use std::sync::Arc;
use tutor_common::{EventBus, TutorEvent};

use crate::error::{ActivationError, StoreError};
use crate::models::{
    ActivationOutcome, EntitlementRecord, EntitlementSource, EntitlementStatus, Plan,
};
use crate::store::EntitlementStore;

/// Default length of an entitlement period
pub const DEFAULT_PERIOD_DAYS: u32 = 30;

/// Successful activation
#[derive(Debug, Clone, PartialEq)]
pub struct Activated {
    pub record: EntitlementRecord,
    pub outcome: ActivationOutcome,
}

#[derive(Clone)]
pub struct ActivationService {
    store: Arc<dyn EntitlementStore>,
    events: EventBus,
    period_days: u32,
}

impl ActivationService {
    pub fn new(store: Arc<dyn EntitlementStore>, events: EventBus, period_days: u32) -> Self {
        Self {
            store,
            events,
            period_days,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    /// Turn `(account_id, reference, plan)` into exactly one entitlement
    pub async fn activate(
        &self,
        account_id: &str,
        reference: &str,
        plan: Plan,
        source: EntitlementSource,
    ) -> Result<Activated, ActivationError> {
        let account_id = account_id.trim();
        let reference = reference.trim();
        validate(account_id, reference)?;

        // Step 1: duplicate check (optimization only)
        let existing = self
            .store
            .find_by_external_ref(reference)
            .await
            .map_err(|e| ActivationError::from_store(e, reference))?;

        if let Some(record) = existing {
            let record = accept_existing(record, account_id, reference)?;
            tracing::info!(
                reference,
                account_id,
                "Entitlement already active, nothing to create"
            );
            return Ok(Activated {
                record,
                outcome: ActivationOutcome::AlreadyExisted,
            });
        }

        // Step 2: create; the store rejects duplicates atomically
        let candidate = EntitlementRecord::new_active(
            account_id,
            reference,
            plan,
            tutor_common::time::now(),
            self.period_days,
            source,
        );

        match self.store.create(&candidate).await {
            Ok(record) => {
                tracing::info!(
                    reference,
                    account_id,
                    plan = %plan,
                    source = source.as_str(),
                    "Entitlement created"
                );
                self.events.emit_lossy(TutorEvent::EntitlementCreated {
                    external_payment_reference: reference.to_string(),
                    account_id: account_id.to_string(),
                    plan: plan.as_str().to_string(),
                    source: source.as_str().to_string(),
                    timestamp: record.created_at,
                });
                Ok(Activated {
                    record,
                    outcome: ActivationOutcome::Created,
                })
            }
            // Step 3: lost the race; converge on the winner's record
            Err(StoreError::Duplicate { .. }) => {
                tracing::info!(reference, account_id, "Concurrent activation won the race, re-reading");

                let winner = self
                    .store
                    .find_by_external_ref(reference)
                    .await
                    .map_err(|e| ActivationError::from_store(e, reference))?
                    .ok_or_else(|| ActivationError::Transient {
                        reference: reference.to_string(),
                        cause: "duplicate reported but record not yet visible".to_string(),
                    })?;

                Ok(Activated {
                    record: accept_existing(winner, account_id, reference)?,
                    outcome: ActivationOutcome::AlreadyExisted,
                })
            }
            // Step 4: classify
            Err(e) => Err(ActivationError::from_store(e, reference)),
        }
    }
}

fn validate(account_id: &str, reference: &str) -> Result<(), ActivationError> {
    if reference.trim().is_empty() {
        return Err(ActivationError::InvalidRequest {
            reference: reference.to_string(),
            reason: "external payment reference is empty".to_string(),
        });
    }
    if account_id.trim().is_empty() {
        return Err(ActivationError::InvalidRequest {
            reference: reference.to_string(),
            reason: "account id is empty".to_string(),
        });
    }
    Ok(())
}

/// Decide whether an existing record satisfies this activation
fn accept_existing(
    record: EntitlementRecord,
    account_id: &str,
    reference: &str,
) -> Result<EntitlementRecord, ActivationError> {
    if record.account_id != account_id {
        tracing::warn!(
            reference,
            owner = %record.account_id,
            requested = account_id,
            "Payment reference already granted to a different account"
        );
        return Err(ActivationError::ReferenceClaimed {
            reference: reference.to_string(),
            owner: record.account_id,
            requested: account_id.to_string(),
        });
    }

    if record.status != EntitlementStatus::Active {
        return Err(ActivationError::NotActive {
            reference: reference.to_string(),
            status: record.status,
        });
    }

    Ok(record)
}
