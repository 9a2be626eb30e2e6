//! End-to-end reconciliation tests
//!
//! Exercises the engine through its public API: uniqueness under concurrent
//! activation against real SQLite, bounded retries on a failing store, account
//! deferral, operator recovery converging with the automatic path, and the
//! page-load pass healing a terminal-pending intent.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tutor_activation::error::{ActivationError, IdentityError, StoreError};
use tutor_activation::identity::IdentityProvider;
use tutor_activation::models::{
    ActivationOutcome, ActivationState, EntitlementRecord, EntitlementSource,
    PendingActivationIntent, Plan,
};
use tutor_activation::pending::{IntentUpdate, PendingActivationStore};
use tutor_activation::retry::RetryPolicy;
use tutor_activation::services::{
    ActivationService, IntentProgress, Reconciler, RecoveryTool, Verification,
    VerificationService, DEFAULT_PERIOD_DAYS,
};
use tutor_activation::store::{EntitlementStore, MemoryEntitlementStore, SqliteEntitlementStore};
use tutor_common::db::{init_database, init_memory_database};
use tutor_common::EventBus;

/// Pending store kept in memory (no blocking file I/O under paused time)
#[derive(Default)]
struct MemoryPendingStore {
    intents: Mutex<BTreeMap<String, PendingActivationIntent>>,
}

#[async_trait]
impl PendingActivationStore for MemoryPendingStore {
    async fn put(&self, intent: PendingActivationIntent) -> tutor_common::Result<()> {
        self.intents
            .lock()
            .await
            .insert(intent.external_payment_reference.clone(), intent);
        Ok(())
    }

    async fn get(&self, reference: &str) -> tutor_common::Result<Option<PendingActivationIntent>> {
        Ok(self.intents.lock().await.get(reference).cloned())
    }

    async fn clear(&self, reference: &str) -> tutor_common::Result<bool> {
        Ok(self.intents.lock().await.remove(reference).is_some())
    }

    async fn update(
        &self,
        reference: &str,
        update: IntentUpdate,
    ) -> tutor_common::Result<Option<PendingActivationIntent>> {
        let mut intents = self.intents.lock().await;
        Ok(intents.get_mut(reference).map(|intent| {
            update(intent);
            intent.clone()
        }))
    }

    async fn list(&self) -> tutor_common::Result<Vec<PendingActivationIntent>> {
        Ok(self.intents.lock().await.values().cloned().collect())
    }
}

/// Identity provider answering from a map
#[derive(Default)]
struct MemoryIdentity {
    accounts: std::sync::Mutex<BTreeMap<String, String>>,
}

impl MemoryIdentity {
    fn record_account(&self, account_id: &str, email: &str) {
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), account_id.to_string());
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    async fn resolve(&self, email: &str) -> Result<Option<String>, IdentityError> {
        Ok(self.accounts.lock().unwrap().get(email).cloned())
    }
}

/// Hides existing records from the duplicate pre-check until the unique
/// constraint has rejected a write, forcing every racer into `create`
struct PrecheckBypassStore {
    inner: SqliteEntitlementStore,
    duplicate_seen: AtomicBool,
}

#[async_trait]
impl EntitlementStore for PrecheckBypassStore {
    async fn find_by_external_ref(
        &self,
        reference: &str,
    ) -> Result<Option<EntitlementRecord>, StoreError> {
        if !self.duplicate_seen.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_external_ref(reference).await
    }

    async fn create(&self, record: &EntitlementRecord) -> Result<EntitlementRecord, StoreError> {
        let result = self.inner.create(record).await;
        if matches!(result, Err(StoreError::Duplicate { .. })) {
            self.duplicate_seen.store(true, Ordering::SeqCst);
        }
        result
    }
}

struct Engine {
    store: Arc<MemoryEntitlementStore>,
    pending: Arc<MemoryPendingStore>,
    directory: Arc<MemoryIdentity>,
    reconciler: Reconciler,
    recovery: RecoveryTool,
}

/// Fully in-process engine, safe to run under paused time
fn engine() -> Engine {
    let events = EventBus::new(64);
    let store = Arc::new(MemoryEntitlementStore::new());
    let pending = Arc::new(MemoryPendingStore::default());
    let directory = Arc::new(MemoryIdentity::default());
    let identity = directory.clone();

    let activation = ActivationService::new(store.clone(), events.clone(), DEFAULT_PERIOD_DAYS);
    let verification = VerificationService::new(store.clone(), pending.clone(), events.clone());
    let reconciler = Reconciler::new(
        activation.clone(),
        verification,
        pending.clone(),
        identity.clone(),
        events,
    )
    .with_policy(RetryPolicy::default());
    let recovery = RecoveryTool::new(identity, activation);

    Engine {
        store,
        pending,
        directory,
        reconciler,
        recovery,
    }
}

async fn sqlite_count(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM entitlements")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_hit_unique_constraint_once() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("tutor.db")).await.unwrap();
    let store = Arc::new(SqliteEntitlementStore::new(pool.clone()));

    let mut tasks = JoinSet::new();
    for i in 0..12 {
        let store = store.clone();
        tasks.spawn(async move {
            let record = EntitlementRecord::new_active(
                &format!("acct-{}", i % 2),
                "PAY-RACE",
                Plan::Standard,
                chrono::Utc::now(),
                30,
                EntitlementSource::Automatic,
            );
            store.create(&record).await
        });
    }

    let mut created = 0;
    let mut duplicates = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => created += 1,
            Err(StoreError::Duplicate { reference }) => {
                assert_eq!(reference, "PAY-RACE");
                duplicates += 1;
            }
            Err(other) => panic!("unexpected store error: {}", other),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(duplicates, 11);
    assert_eq!(sqlite_count(&pool).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activations_converge_on_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("tutor.db")).await.unwrap();
    let store = Arc::new(PrecheckBypassStore {
        inner: SqliteEntitlementStore::new(pool.clone()),
        duplicate_seen: AtomicBool::new(false),
    });
    let service = ActivationService::new(store, EventBus::new(64), DEFAULT_PERIOD_DAYS);

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let service = service.clone();
        tasks.spawn(async move {
            service
                .activate("acct-1", "PAY-RACE", Plan::Premium, EntitlementSource::Automatic)
                .await
        });
    }

    let mut results = Vec::new();
    while let Some(result) = tasks.join_next().await {
        results.push(result.unwrap().unwrap());
    }

    let created = results
        .iter()
        .filter(|activated| activated.outcome == ActivationOutcome::Created)
        .count();
    assert_eq!(created, 1);

    let first_id = results[0].record.entitlement_id;
    for activated in &results {
        assert_eq!(activated.record.entitlement_id, first_id);
        assert_eq!(activated.record.external_payment_reference, "PAY-RACE");
        assert_eq!(activated.record.plan, Plan::Premium);
    }
    assert_eq!(sqlite_count(&pool).await, 1);
}

#[tokio::test]
async fn test_sequential_activations_are_idempotent() {
    let pool = init_memory_database().await.unwrap();
    let service = ActivationService::new(
        Arc::new(SqliteEntitlementStore::new(pool.clone())),
        EventBus::new(16),
        DEFAULT_PERIOD_DAYS,
    );

    let first = service
        .activate("acct-1", "PAY-1", Plan::Standard, EntitlementSource::Automatic)
        .await
        .unwrap();
    let second = service
        .activate("acct-1", "PAY-1", Plan::Standard, EntitlementSource::Automatic)
        .await
        .unwrap();

    assert_eq!(first.outcome, ActivationOutcome::Created);
    assert_eq!(second.outcome, ActivationOutcome::AlreadyExisted);
    assert_eq!(first.record.entitlement_id, second.record.entitlement_id);
    assert_eq!(sqlite_count(&pool).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_store_gets_exactly_three_attempts_with_linear_backoff() {
    let e = engine();
    e.directory.record_account("acct-1", "a@x.com");
    e.store.set_unavailable(true);

    let start = tokio::time::Instant::now();
    let err = e
        .reconciler
        .on_payment_confirmed("PAY-9", "a@x.com", Plan::Standard, &CancellationToken::new())
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    match &err {
        ActivationError::Exhausted {
            reference,
            attempts,
            last_cause,
        } => {
            assert_eq!(reference, "PAY-9");
            assert_eq!(*attempts, 3);
            assert!(last_cause.contains("simulated outage"));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }

    // One failing pre-check read per attempt
    assert_eq!(e.store.call_count(), 3);
    // 1s + 2s of backoff, nothing after the final attempt
    assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3100), "elapsed {:?}", elapsed);

    let intent = e.pending.get("PAY-9").await.unwrap().unwrap();
    assert_eq!(intent.state, ActivationState::TerminalPendingFailure);
    assert_eq!(intent.attempt_count, 3);
    assert!(e.store.is_empty());
}

#[tokio::test]
async fn test_payment_before_account_never_writes() {
    let e = engine();

    let progress = e
        .reconciler
        .on_payment_confirmed("PAY-2", "late@x.com", Plan::Premium, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress, IntentProgress::AwaitingAccount);
    assert!(e.store.is_empty());
    assert_eq!(e.store.call_count(), 0);

    let status = e.reconciler.status("PAY-2").await.unwrap();
    assert_eq!(status.state, ActivationState::PendingAccountCreation);
    assert!(status.entitlement.is_none());

    // Account arrives later
    e.directory.record_account("acct-9", "late@x.com");
    let reports = e
        .reconciler
        .on_account_created("acct-9", "late@x.com", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(e.store.len(), 1);
    assert!(e.pending.get("PAY-2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_recovery_matches_automatic_activation() {
    let automatic = engine();
    automatic.directory.record_account("acct-1", "a@x.com");
    let progress = automatic
        .reconciler
        .on_payment_confirmed("PAY-7", "a@x.com", Plan::Premium, &CancellationToken::new())
        .await
        .unwrap();
    let IntentProgress::Activated(auto) = progress else {
        panic!("expected an activation");
    };

    let manual = engine();
    manual.directory.record_account("acct-1", "a@x.com");
    let recovered = manual
        .recovery
        .recover("a@x.com", "PAY-7", Plan::Premium)
        .await
        .unwrap();

    assert!(auto.record.grants_same_as(&recovered.record));
    assert_eq!(auto.record.source, EntitlementSource::Automatic);
    assert_eq!(recovered.record.source, EntitlementSource::Recovery);
}

#[tokio::test(start_paused = true)]
async fn test_pay_123_terminal_failure_then_recovery_then_automatic_pass() {
    let e = engine();
    e.directory.record_account("acct-1", "a@x.com");
    let cancel = CancellationToken::new();

    // Three store failures
    e.store.fail_next_calls(3);
    let err = e
        .reconciler
        .on_payment_confirmed("PAY-123", "a@x.com", Plan::Standard, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Exhausted { attempts: 3, .. }));
    assert_eq!(
        e.reconciler.status("PAY-123").await.unwrap().state,
        ActivationState::TerminalPendingFailure
    );

    // Operator recovers against the now healthy store
    let recovered = e
        .recovery
        .recover("a@x.com", "PAY-123", Plan::Standard)
        .await
        .unwrap();
    assert_eq!(recovered.outcome, ActivationOutcome::Created);
    assert_eq!(e.store.len(), 1);

    // Automatic page-load pass converges on the recovered record
    let results = e
        .reconciler
        .reconcile_account("a@x.com", &cancel)
        .await
        .unwrap();
    for (reference, verification) in &results {
        assert_eq!(reference, "PAY-123");
        match verification {
            Verification::Verified(record) => {
                assert_eq!(record.entitlement_id, recovered.record.entitlement_id)
            }
            other => panic!("unexpected verification {:?}", other),
        }
    }
    assert!(e.pending.get("PAY-123").await.unwrap().is_none());

    // A user retry afterwards reports the same record
    let progress = e.reconciler.retry("PAY-123", &cancel).await.unwrap().unwrap();
    let IntentProgress::Activated(retried) = progress else {
        panic!("expected an activation");
    };
    assert_eq!(retried.outcome, ActivationOutcome::AlreadyExisted);
    assert_eq!(retried.record.entitlement_id, recovered.record.entitlement_id);
    assert_eq!(e.store.len(), 1);

    let status = e.reconciler.status("PAY-123").await.unwrap();
    assert_eq!(status.state, ActivationState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_pay_123_heals_on_page_load_without_operator() {
    let e = engine();
    e.directory.record_account("acct-1", "a@x.com");
    let cancel = CancellationToken::new();

    e.store.fail_next_calls(3);
    let err = e
        .reconciler
        .on_payment_confirmed("PAY-123", "a@x.com", Plan::Standard, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Exhausted { attempts: 3, .. }));
    assert!(e.store.is_empty());

    // Store healthy again; the next page load alone creates the record
    let results = e
        .reconciler
        .reconcile_account("a@x.com", &cancel)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].1, Verification::Verified(_)));
    assert_eq!(e.store.len(), 1);
    assert!(e.pending.get("PAY-123").await.unwrap().is_none());
    assert_eq!(
        e.reconciler.status("PAY-123").await.unwrap().state,
        ActivationState::Active
    );
}
