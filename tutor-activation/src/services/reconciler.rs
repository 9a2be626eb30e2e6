//! Activation reconciler
//!
//! Drives one payment reference through its state machine:
//!
//! ```text
//! NoIntent -> PendingAccountCreation -> Activating -> Active
//!                                                  -> TerminalPendingFailure
//! TerminalPendingFailure -> Activating (retry) | Active (recovery, verification)
//! ```
//!
//! Entry points:
//! - [`Reconciler::on_payment_confirmed`]: payment processor confirmation
//! - [`Reconciler::on_account_created`]: identity provider callback
//! - [`Reconciler::retry`]: user-triggered retry from the banner
//! - [`Reconciler::reconcile_account`]: page-load verification and automatic retry
//! - [`Reconciler::resume_outstanding`]: startup sweep of stalled intents
//!
//! The intent is written before any activation attempt and cleared only by
//! verification, so a crash at any point leaves something to resume from.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tutor_common::{EventBus, TutorEvent};

use super::activation::{Activated, ActivationService};
use super::verification::{Verification, VerificationService};
use crate::error::ActivationError;
use crate::identity::IdentityProvider;
use crate::models::{
    normalize_email, ActivationAttempt, ActivationOutcome, ActivationState, AttemptOutcome,
    EntitlementRecord, EntitlementSource, PendingActivationIntent, Plan,
};
use crate::pending::{IntentUpdate, PendingActivationStore};
use crate::retry::{RetryController, RetryOutcome, RetryPolicy};

/// Default delay before an out-of-band verification
pub const DEFAULT_VERIFICATION_DELAY: Duration = Duration::from_secs(3);

/// Where an intent stands after an activation pass
#[derive(Debug, Clone, PartialEq)]
pub enum IntentProgress {
    /// Entitlement exists (created now or earlier)
    Activated(Activated),
    /// No account for the payer's email yet; the intent waits
    AwaitingAccount,
    /// Retry loop cancelled between attempts; the intent stays `Activating`
    Cancelled { attempts: u32 },
}

/// Result of activating one intent on behalf of a new account
#[derive(Debug, Clone)]
pub struct IntentReport {
    pub reference: String,
    pub result: Result<IntentProgress, ActivationError>,
}

/// Banner view of one payment reference
#[derive(Debug, Clone, Serialize)]
pub struct ActivationStatus {
    pub external_payment_reference: String,
    pub state: ActivationState,
    pub plan: Option<Plan>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    pub entitlement: Option<EntitlementRecord>,
}

#[derive(Clone)]
pub struct Reconciler {
    activation: ActivationService,
    verification: VerificationService,
    pending: Arc<dyn PendingActivationStore>,
    identity: Arc<dyn IdentityProvider>,
    events: EventBus,
    policy: RetryPolicy,
    verification_delay: Duration,
}

impl Reconciler {
    pub fn new(
        activation: ActivationService,
        verification: VerificationService,
        pending: Arc<dyn PendingActivationStore>,
        identity: Arc<dyn IdentityProvider>,
        events: EventBus,
    ) -> Self {
        Self {
            activation,
            verification,
            pending,
            identity,
            events,
            policy: RetryPolicy::default(),
            verification_delay: DEFAULT_VERIFICATION_DELAY,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_verification_delay(mut self, delay: Duration) -> Self {
        self.verification_delay = delay;
        self
    }

    /// Record a confirmed payment and activate it if the account exists
    ///
    /// Confirmations may be replayed; a replay overwrites the intent and the
    /// activation core dedups the write.
    pub async fn on_payment_confirmed(
        &self,
        reference: &str,
        email: &str,
        plan: Plan,
        cancel: &CancellationToken,
    ) -> Result<IntentProgress, ActivationError> {
        let intent = PendingActivationIntent::new(reference, email, plan);
        let reference = intent.external_payment_reference.clone();

        if reference.is_empty() || intent.account_email.is_empty() {
            return Err(ActivationError::InvalidRequest {
                reference,
                reason: "payment confirmation needs a reference and a payer email".to_string(),
            });
        }

        tracing::info!(
            reference = %reference,
            email = %intent.account_email,
            plan = %plan,
            "Payment confirmed, recording activation intent"
        );

        self.pending
            .put(intent)
            .await
            .map_err(|e| ActivationError::Storage {
                reference: reference.clone(),
                cause: format!("failed to persist activation intent: {}", e),
            })?;
        self.emit_state(&reference, ActivationState::PendingAccountCreation);

        match self.activate_intent(&reference, cancel).await? {
            Some(progress) => Ok(progress),
            // Cleared between put and activation: verification already saw the entitlement
            None => Ok(IntentProgress::AwaitingAccount),
        }
    }

    /// Run the bounded retry loop for a stored intent
    ///
    /// Returns `Ok(None)` if no intent exists for `reference`.
    pub async fn activate_intent(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IntentProgress>, ActivationError> {
        let Some(intent) = self.load_intent(reference).await? else {
            return Ok(None);
        };

        let account_id = self
            .identity
            .resolve(&intent.account_email)
            .await
            .map_err(|e| ActivationError::Transient {
                reference: reference.to_string(),
                cause: e.to_string(),
            })?;

        match account_id {
            Some(account_id) => self
                .activate_for_account(&intent, &account_id, cancel)
                .await
                .map(Some),
            None => {
                tracing::info!(
                    reference,
                    email = %intent.account_email,
                    "No account yet, activation deferred"
                );
                self.set_state(reference, ActivationState::PendingAccountCreation, None)
                    .await;
                Ok(Some(IntentProgress::AwaitingAccount))
            }
        }
    }

    /// User-triggered retry
    ///
    /// With no outstanding intent, an existing active entitlement is reported
    /// as already active. `Ok(None)` means nothing is known about `reference`.
    pub async fn retry(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IntentProgress>, ActivationError> {
        tracing::info!(reference, "Activation retry requested");

        if let Some(progress) = self.activate_intent(reference, cancel).await? {
            return Ok(Some(progress));
        }

        let existing = self
            .activation
            .store()
            .find_by_external_ref(reference)
            .await
            .map_err(|e| ActivationError::from_store(e, reference))?;

        Ok(existing
            .filter(EntitlementRecord::is_active)
            .map(|record| {
                IntentProgress::Activated(Activated {
                    record,
                    outcome: ActivationOutcome::AlreadyExisted,
                })
            }))
    }

    /// Activate every intent that was waiting for this account
    pub async fn on_account_created(
        &self,
        account_id: &str,
        email: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IntentReport>, ActivationError> {
        let email = normalize_email(email);
        let waiting: Vec<PendingActivationIntent> = self
            .list_intents()
            .await?
            .into_iter()
            .filter(|intent| {
                intent.account_email == email
                    && intent.state == ActivationState::PendingAccountCreation
            })
            .collect();

        tracing::info!(
            account_id,
            email = %email,
            waiting = waiting.len(),
            "Account created, resuming waiting activations"
        );

        let mut reports = Vec::with_capacity(waiting.len());
        for intent in waiting {
            let result = self.activate_for_account(&intent, account_id, cancel).await;
            reports.push(IntentReport {
                reference: intent.external_payment_reference,
                result,
            });
        }
        Ok(reports)
    }

    /// Page-load reconciliation of every outstanding intent for `email`
    ///
    /// Each intent is verified first. One that is still not active while the
    /// account exists gets another automatic activation run, so an intent left
    /// terminal-pending by a store outage heals on the next page load.
    pub async fn reconcile_account(
        &self,
        email: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Verification)>, ActivationError> {
        let email = normalize_email(email);
        let intents: Vec<PendingActivationIntent> = self
            .list_intents()
            .await?
            .into_iter()
            .filter(|intent| intent.account_email == email)
            .collect();

        if intents.is_empty() {
            return Ok(Vec::new());
        }

        let account_id = match self.identity.resolve(&email).await {
            Ok(account_id) => account_id,
            Err(e) => {
                tracing::warn!(email = %email, error = %e, "Identity lookup failed during reconcile");
                None
            }
        };

        let mut results = Vec::with_capacity(intents.len());
        for intent in intents {
            let verification = match &account_id {
                Some(account_id) => {
                    match self
                        .verification
                        .verify(account_id, &intent.external_payment_reference)
                        .await
                    {
                        Verification::NotYetActive => {
                            self.resume(&intent, account_id, cancel).await
                        }
                        verified => verified,
                    }
                }
                None => Verification::NotYetActive,
            };
            results.push((intent.external_payment_reference, verification));
        }
        Ok(results)
    }

    /// Re-run activation for every outstanding intent whose account exists
    ///
    /// Run once at startup so intents stalled by an outage or a shutdown
    /// mid-retry are picked up without waiting for the user.
    pub async fn resume_outstanding(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<IntentReport>, ActivationError> {
        let outstanding: Vec<PendingActivationIntent> = self
            .list_intents()
            .await?
            .into_iter()
            .filter(|intent| intent.state.is_outstanding())
            .collect();

        let mut reports = Vec::new();
        for intent in outstanding {
            if cancel.is_cancelled() {
                break;
            }

            let account_id = match self.identity.resolve(&intent.account_email).await {
                Ok(Some(account_id)) => account_id,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        reference = %intent.external_payment_reference,
                        error = %e,
                        "Identity lookup failed, intent left for later"
                    );
                    continue;
                }
            };

            let result = self.activate_for_account(&intent, &account_id, cancel).await;
            reports.push(IntentReport {
                reference: intent.external_payment_reference,
                result,
            });
        }

        tracing::info!(resumed = reports.len(), "Outstanding activations resumed");
        Ok(reports)
    }

    /// Automatic retry of one unverified intent
    async fn resume(
        &self,
        intent: &PendingActivationIntent,
        account_id: &str,
        cancel: &CancellationToken,
    ) -> Verification {
        if !intent.state.is_outstanding() {
            return Verification::NotYetActive;
        }

        tracing::info!(
            reference = %intent.external_payment_reference,
            state = %intent.state,
            attempts_so_far = intent.attempt_count,
            "Resuming unverified activation"
        );

        match self.activate_for_account(intent, account_id, cancel).await {
            Ok(IntentProgress::Activated(activated)) => Verification::Verified(activated.record),
            Ok(_) => Verification::NotYetActive,
            Err(e) => {
                tracing::warn!(
                    reference = %intent.external_payment_reference,
                    error = %e,
                    "Automatic retry did not activate"
                );
                Verification::NotYetActive
            }
        }
    }

    /// Current state of `reference` for the banner
    pub async fn status(&self, reference: &str) -> Result<ActivationStatus, ActivationError> {
        let intent = self.load_intent(reference).await?;
        // The banner still renders from the intent while the store is down
        let entitlement = match self.activation.store().find_by_external_ref(reference).await {
            Ok(entitlement) => entitlement,
            Err(e) => {
                tracing::warn!(reference, error = %e, "Entitlement lookup failed for status");
                None
            }
        };

        let status = match intent {
            Some(intent) => ActivationStatus {
                external_payment_reference: intent.external_payment_reference,
                state: intent.state,
                plan: Some(intent.plan),
                attempt_count: intent.attempt_count,
                last_attempt_at: intent.last_attempt_at,
                last_error: intent.last_error,
                entitlement,
            },
            None => ActivationStatus {
                external_payment_reference: reference.to_string(),
                state: match &entitlement {
                    Some(record) if record.is_active() => ActivationState::Active,
                    _ => ActivationState::NoIntent,
                },
                plan: entitlement.as_ref().map(|record| record.plan),
                attempt_count: 0,
                last_attempt_at: None,
                last_error: None,
                entitlement,
            },
        };
        Ok(status)
    }

    /// Outstanding intents, for operators
    pub async fn pending_intents(&self) -> Result<Vec<PendingActivationIntent>, ActivationError> {
        self.list_intents().await
    }

    async fn activate_for_account(
        &self,
        intent: &PendingActivationIntent,
        account_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IntentProgress, ActivationError> {
        let reference = intent.external_payment_reference.as_str();
        let plan = intent.plan;

        self.set_state(reference, ActivationState::Activating, None).await;

        let mut controller = RetryController::new(self.policy);
        let outcome = controller
            .run("activate_entitlement", cancel, |attempt| async move {
                let result = self
                    .activation
                    .activate(account_id, reference, plan, EntitlementSource::Automatic)
                    .await;
                self.record_attempt(reference, attempt, &result).await;
                result
            })
            .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                tracing::info!(
                    reference,
                    account_id,
                    attempts,
                    outcome = value.outcome.describe(),
                    "Activation succeeded"
                );
                if let Verification::NotYetActive =
                    self.verification.verify(account_id, reference).await
                {
                    // Read-back failed; try again out of band
                    self.verification
                        .schedule(account_id, reference, self.verification_delay);
                }
                Ok(IntentProgress::Activated(value))
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                let last_cause = match last_error {
                    ActivationError::Transient { cause, .. } => cause,
                    other => other.to_string(),
                };
                tracing::error!(
                    reference,
                    account_id,
                    attempts,
                    last_cause = %last_cause,
                    "Activation retries exhausted, intent kept as terminal-pending"
                );
                self.set_state(
                    reference,
                    ActivationState::TerminalPendingFailure,
                    Some(last_cause.clone()),
                )
                .await;
                // The last write may still have landed
                self.verification
                    .schedule(account_id, reference, self.verification_delay);

                Err(ActivationError::Exhausted {
                    reference: reference.to_string(),
                    attempts,
                    last_cause,
                })
            }
            RetryOutcome::Failed { error, attempts } => {
                tracing::error!(
                    reference,
                    account_id,
                    attempts,
                    error = %error,
                    "Activation failed permanently"
                );
                self.set_state(
                    reference,
                    ActivationState::TerminalPendingFailure,
                    Some(error.to_string()),
                )
                .await;
                Err(error)
            }
            RetryOutcome::Cancelled {
                last_error,
                attempts,
            } => {
                tracing::info!(
                    reference,
                    attempts,
                    last_error = %last_error,
                    "Activation cancelled, intent left for later"
                );
                Ok(IntentProgress::Cancelled { attempts })
            }
        }
    }

    /// Bookkeeping after one attempt; never fails the attempt itself
    async fn record_attempt(
        &self,
        reference: &str,
        attempt: u32,
        result: &Result<Activated, ActivationError>,
    ) {
        let outcome = match result {
            Ok(activated) => AttemptOutcome::from(activated.outcome),
            Err(e) if e.is_transient() => AttemptOutcome::TransientFailure,
            Err(_) => AttemptOutcome::TerminalFailure,
        };
        let report = ActivationAttempt::new(reference, attempt, outcome);
        tracing::debug!(reference, attempt, outcome = %report.outcome, "Activation attempt finished");
        self.events.emit_lossy(TutorEvent::ActivationAttempted {
            external_payment_reference: report.external_payment_reference.clone(),
            attempt: report.attempt,
            outcome: report.outcome.as_str().to_string(),
            timestamp: report.at,
        });

        let last_error = result.as_ref().err().map(|e| e.to_string());
        let at = report.at;

        let update: IntentUpdate = Box::new(move |intent: &mut PendingActivationIntent| {
            intent.attempt_count += 1;
            intent.last_attempt_at = Some(at);
            if last_error.is_some() {
                intent.last_error = last_error;
            }
        });

        if let Err(e) = self.pending.update(reference, update).await {
            tracing::warn!(reference, attempt, error = %e, "Failed to record activation attempt");
        }
    }

    async fn set_state(&self, reference: &str, next: ActivationState, last_error: Option<String>) {
        let update: IntentUpdate = Box::new(move |intent: &mut PendingActivationIntent| {
            if intent.state.can_transition_to(next) {
                intent.state = next;
            } else {
                tracing::warn!(
                    reference = %intent.external_payment_reference,
                    from = %intent.state,
                    to = %next,
                    "Ignoring illegal activation state transition"
                );
            }
            if last_error.is_some() {
                intent.last_error = last_error;
            }
        });

        match self.pending.update(reference, update).await {
            Ok(Some(intent)) if intent.state == next => self.emit_state(reference, next),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(reference, state = %next, error = %e, "Failed to persist activation state");
            }
        }
    }

    fn emit_state(&self, reference: &str, state: ActivationState) {
        self.events.emit_lossy(TutorEvent::ActivationStateChanged {
            external_payment_reference: reference.to_string(),
            state: state.as_str().to_string(),
            timestamp: tutor_common::time::now(),
        });
    }

    async fn load_intent(
        &self,
        reference: &str,
    ) -> Result<Option<PendingActivationIntent>, ActivationError> {
        self.pending
            .get(reference)
            .await
            .map_err(|e| ActivationError::Storage {
                reference: reference.to_string(),
                cause: format!("failed to read activation intent: {}", e),
            })
    }

    async fn list_intents(&self) -> Result<Vec<PendingActivationIntent>, ActivationError> {
        self.pending
            .list()
            .await
            .map_err(|e| ActivationError::Storage {
                reference: String::new(),
                cause: format!("failed to list activation intents: {}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IdentityError;
    use crate::pending::FilePendingStore;
    use crate::services::activation::DEFAULT_PERIOD_DAYS;
    use crate::store::{EntitlementStore, MemoryEntitlementStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct TestIdentity(Mutex<HashMap<String, String>>);

    impl TestIdentity {
        fn add(&self, email: &str, account_id: &str) {
            self.0
                .lock()
                .unwrap()
                .insert(email.to_string(), account_id.to_string());
        }
    }

    #[async_trait]
    impl IdentityProvider for TestIdentity {
        async fn resolve(&self, email: &str) -> Result<Option<String>, IdentityError> {
            Ok(self.0.lock().unwrap().get(email).cloned())
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryEntitlementStore>,
        pending: Arc<FilePendingStore>,
        identity: Arc<TestIdentity>,
        reconciler: Reconciler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let events = EventBus::new(64);
        let store = Arc::new(MemoryEntitlementStore::new());
        let pending = Arc::new(
            FilePendingStore::open(dir.path().join(FilePendingStore::FILE_NAME))
                .await
                .unwrap(),
        );
        let identity = Arc::new(TestIdentity::default());

        let activation = ActivationService::new(store.clone(), events.clone(), DEFAULT_PERIOD_DAYS);
        let verification = VerificationService::new(store.clone(), pending.clone(), events.clone());
        let reconciler = Reconciler::new(
            activation,
            verification,
            pending.clone(),
            identity.clone(),
            events,
        )
        .with_policy(RetryPolicy::new(3, Duration::from_millis(1)));

        Fixture {
            _dir: dir,
            store,
            pending,
            identity,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_payment_with_existing_account_activates_and_clears_intent() {
        let f = fixture().await;
        f.identity.add("a@x.com", "acct-1");

        let progress = f
            .reconciler
            .on_payment_confirmed("PAY-1", "A@x.com", Plan::Standard, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(progress, IntentProgress::Activated(_)));
        assert_eq!(f.store.len(), 1);
        assert!(f.pending.get("PAY-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_payment_before_account_is_deferred() {
        let f = fixture().await;

        let progress = f
            .reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Standard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(progress, IntentProgress::AwaitingAccount);
        assert!(f.store.is_empty());
        let intent = f.pending.get("PAY-1").await.unwrap().unwrap();
        assert_eq!(intent.state, ActivationState::PendingAccountCreation);
        assert_eq!(intent.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_account_created_resumes_waiting_intent() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        f.reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Premium, &cancel)
            .await
            .unwrap();

        f.identity.add("a@x.com", "acct-1");
        let reports = f
            .reconciler
            .on_account_created("acct-1", "a@x.com", &cancel)
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].result, Ok(IntentProgress::Activated(_))));
        let status = f.reconciler.status("PAY-1").await.unwrap();
        assert_eq!(status.state, ActivationState::Active);
        assert_eq!(status.entitlement.unwrap().account_id, "acct-1");
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_terminal_pending_intent() {
        let f = fixture().await;
        f.identity.add("a@x.com", "acct-1");
        f.store.set_unavailable(true);

        let err = f
            .reconciler
            .on_payment_confirmed("PAY-123", "a@x.com", Plan::Standard, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ActivationError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.reference(), "PAY-123");
        let intent = f.pending.get("PAY-123").await.unwrap().unwrap();
        assert_eq!(intent.state, ActivationState::TerminalPendingFailure);
        assert_eq!(intent.attempt_count, 3);
        assert!(intent.last_error.is_some());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_terminal_failure_activates() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        f.identity.add("a@x.com", "acct-1");
        f.store.set_unavailable(true);
        let _ = f
            .reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Standard, &cancel)
            .await;

        f.store.set_unavailable(false);
        let progress = f.reconciler.retry("PAY-1", &cancel).await.unwrap().unwrap();

        match progress {
            IntentProgress::Activated(activated) => {
                assert_eq!(activated.outcome, ActivationOutcome::Created)
            }
            other => panic!("unexpected progress {:?}", other),
        }
        assert!(f.pending.get("PAY-1").await.unwrap().is_none());

        // Nothing pending any more, the existing entitlement is reported
        let again = f.reconciler.retry("PAY-1", &cancel).await.unwrap().unwrap();
        assert!(matches!(
            again,
            IntentProgress::Activated(Activated {
                outcome: ActivationOutcome::AlreadyExisted,
                ..
            })
        ));
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_unknown_reference_is_none() {
        let f = fixture().await;
        assert!(f
            .reconciler
            .retry("PAY-404", &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancelled_loop_leaves_intent_activating() {
        let f = fixture().await;
        f.identity.add("a@x.com", "acct-1");
        f.store.set_unavailable(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let progress = f
            .reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Standard, &cancel)
            .await
            .unwrap();

        assert_eq!(progress, IntentProgress::Cancelled { attempts: 1 });
        let intent = f.pending.get("PAY-1").await.unwrap().unwrap();
        assert_eq!(intent.state, ActivationState::Activating);
        assert_eq!(intent.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_reconcile_account_verifies_landed_entitlement() {
        let f = fixture().await;
        f.reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Standard, &CancellationToken::new())
            .await
            .unwrap();

        // Entitlement written elsewhere (e.g. operator recovery)
        f.identity.add("a@x.com", "acct-1");
        f.store
            .create(&EntitlementRecord::new_active(
                "acct-1",
                "PAY-1",
                Plan::Standard,
                chrono::Utc::now(),
                30,
                EntitlementSource::Recovery,
            ))
            .await
            .unwrap();

        let results = f
            .reconciler
            .reconcile_account("a@x.com", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, Verification::Verified(_)));
        assert!(f.reconciler.pending_intents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_page_load_reconcile_retries_terminal_intent_after_outage() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        f.identity.add("a@x.com", "acct-1");
        f.store.set_unavailable(true);
        let _ = f
            .reconciler
            .on_payment_confirmed("PAY-123", "a@x.com", Plan::Standard, &cancel)
            .await;
        assert_eq!(
            f.pending.get("PAY-123").await.unwrap().unwrap().state,
            ActivationState::TerminalPendingFailure
        );

        f.store.set_unavailable(false);
        let results = f
            .reconciler
            .reconcile_account("a@x.com", &cancel)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        match &results[0].1 {
            Verification::Verified(record) => {
                assert_eq!(record.external_payment_reference, "PAY-123");
                assert_eq!(record.source, EntitlementSource::Automatic);
            }
            other => panic!("unexpected verification {:?}", other),
        }
        assert_eq!(f.store.len(), 1);
        assert!(f.pending.get("PAY-123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_outstanding_heals_stalled_intents() {
        let f = fixture().await;
        f.identity.add("a@x.com", "acct-1");
        f.store.set_unavailable(true);

        // Terminal after exhausted retries
        let _ = f
            .reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Standard, &CancellationToken::new())
            .await;
        // Left activating by a shutdown mid-retry
        let stopped = CancellationToken::new();
        stopped.cancel();
        f.reconciler
            .on_payment_confirmed("PAY-2", "a@x.com", Plan::Premium, &stopped)
            .await
            .unwrap();
        // No account yet
        f.reconciler
            .on_payment_confirmed("PAY-3", "new@x.com", Plan::Standard, &CancellationToken::new())
            .await
            .unwrap();

        f.store.set_unavailable(false);
        let reports = f
            .reconciler
            .resume_outstanding(&CancellationToken::new())
            .await
            .unwrap();

        let mut resumed: Vec<&str> = reports.iter().map(|r| r.reference.as_str()).collect();
        resumed.sort();
        assert_eq!(resumed, vec!["PAY-1", "PAY-2"]);
        assert!(reports
            .iter()
            .all(|r| matches!(r.result, Ok(IntentProgress::Activated(_)))));
        assert_eq!(f.store.len(), 2);

        let left = f.reconciler.pending_intents().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].external_payment_reference, "PAY-3");
        assert_eq!(left[0].state, ActivationState::PendingAccountCreation);
    }

    #[tokio::test]
    async fn test_each_attempt_is_published_with_its_outcome() {
        let f = fixture().await;
        f.identity.add("a@x.com", "acct-1");
        f.store.fail_next_calls(2);
        let mut rx = f.reconciler.events.subscribe();

        f.reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Standard, &CancellationToken::new())
            .await
            .unwrap();

        let mut attempts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TutorEvent::ActivationAttempted {
                attempt, outcome, ..
            } = event
            {
                attempts.push((attempt, outcome));
            }
        }
        assert_eq!(
            attempts,
            vec![
                (1, "transient_failure".to_string()),
                (2, "transient_failure".to_string()),
                (3, "created".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_replayed_confirmation_overwrites_intent() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        f.reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Standard, &cancel)
            .await
            .unwrap();
        f.reconciler
            .on_payment_confirmed("PAY-1", "a@x.com", Plan::Premium, &cancel)
            .await
            .unwrap();

        let intents = f.reconciler.pending_intents().await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].plan, Plan::Premium);
    }

    #[tokio::test]
    async fn test_blank_confirmation_rejected() {
        let f = fixture().await;
        let err = f
            .reconciler
            .on_payment_confirmed(" ", "a@x.com", Plan::Standard, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::InvalidRequest { .. }));
        assert!(f.reconciler.pending_intents().await.unwrap().is_empty());
    }
}
