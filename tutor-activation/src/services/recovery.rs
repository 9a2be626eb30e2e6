//! Operator recovery
//!
//! Manual path for payments whose automatic activation never completed. Goes
//! through the same activation core, so running it for an already-activated
//! payment is harmless and reports "already active".

use std::sync::Arc;

use super::activation::{Activated, ActivationService};
use crate::error::RecoveryError;
use crate::identity::IdentityProvider;
use crate::models::{normalize_email, EntitlementSource, Plan};

#[derive(Clone)]
pub struct RecoveryTool {
    identity: Arc<dyn IdentityProvider>,
    activation: ActivationService,
}

impl RecoveryTool {
    pub fn new(identity: Arc<dyn IdentityProvider>, activation: ActivationService) -> Self {
        Self {
            identity,
            activation,
        }
    }

    /// Activate `plan` for the account registered under `email`
    ///
    /// Single attempt; the operator decides whether to run it again.
    pub async fn recover(
        &self,
        email: &str,
        reference: &str,
        plan: Plan,
    ) -> Result<Activated, RecoveryError> {
        let email = normalize_email(email);
        let reference = reference.trim();
        tracing::info!(reference, email = %email, plan = %plan, "Operator recovery requested");

        let account_id = self
            .identity
            .resolve(&email)
            .await
            .map_err(|source| RecoveryError::Identity {
                reference: reference.to_string(),
                source,
            })?
            .ok_or_else(|| RecoveryError::AccountNotFound {
                email: email.clone(),
                reference: reference.to_string(),
            })?;

        let activated = self
            .activation
            .activate(&account_id, reference, plan, EntitlementSource::Recovery)
            .await?;

        tracing::info!(
            reference,
            account_id = %account_id,
            outcome = activated.outcome.describe(),
            "Operator recovery completed"
        );
        Ok(activated)
    }
}

/// Operator-facing summary line
pub fn recovery_message(reference: &str, activated: &Activated) -> String {
    format!(
        "Entitlement for payment {} is {} ({} plan, account {})",
        reference,
        activated.outcome.describe(),
        activated.record.plan,
        activated.record.account_id
    )
}
