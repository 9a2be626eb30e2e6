//! Post-activation verification
//!
//! Confirms that an entitlement actually landed in the store. Only a verified
//! record clears the pending intent; anything else leaves the intent in place
//! so a later retry, reconcile, or operator recovery can still act on it.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tutor_common::{EventBus, TutorEvent};

use crate::models::{ActivationState, EntitlementRecord};
use crate::pending::PendingActivationStore;
use crate::store::EntitlementStore;

/// Result of a verification check
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    /// An active entitlement exists for the account; the intent was cleared
    Verified(EntitlementRecord),
    /// Nothing active yet; the intent is kept
    NotYetActive,
}

#[derive(Clone)]
pub struct VerificationService {
    store: Arc<dyn EntitlementStore>,
    pending: Arc<dyn PendingActivationStore>,
    events: EventBus,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        pending: Arc<dyn PendingActivationStore>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            pending,
            events,
        }
    }

    /// Check the store and clear the intent if the entitlement is active
    ///
    /// Store and pending-store failures are logged and reported as
    /// `NotYetActive`; verification never fails the caller.
    pub async fn verify(&self, account_id: &str, reference: &str) -> Verification {
        let record = match self.store.find(account_id, reference).await {
            Ok(Some(record)) if record.is_active() => record,
            Ok(_) => {
                tracing::debug!(reference, account_id, "Entitlement not active yet");
                return Verification::NotYetActive;
            }
            Err(e) => {
                tracing::warn!(reference, account_id, error = %e, "Verification read failed");
                return Verification::NotYetActive;
            }
        };

        match self.pending.clear(reference).await {
            Ok(cleared) => {
                tracing::info!(reference, account_id, intent_cleared = cleared, "Entitlement verified");
            }
            Err(e) => {
                // Record is active; a stale intent only costs one idempotent re-run
                tracing::warn!(reference, error = %e, "Failed to clear verified intent");
            }
        }

        self.events.emit_lossy(TutorEvent::ActivationStateChanged {
            external_payment_reference: reference.to_string(),
            state: ActivationState::Active.as_str().to_string(),
            timestamp: tutor_common::time::now(),
        });

        Verification::Verified(record)
    }

    /// Run [`verify`](Self::verify) once after `delay`
    pub fn schedule(&self, account_id: &str, reference: &str, delay: Duration) -> JoinHandle<Verification> {
        let service = self.clone();
        let account_id = account_id.to_string();
        let reference = reference.to_string();

        tracing::debug!(
            reference = %reference,
            delay_ms = delay.as_millis() as u64,
            "Verification scheduled"
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service.verify(&account_id, &reference).await
        })
    }
}
