//! tutor-activation library
//!
//! Subscription activation reconciliation: turns a confirmed payment into
//! exactly one durable entitlement, with bounded retries, independent
//! verification and an operator recovery path.

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod pending;
pub mod retry;
pub mod services;
pub mod store;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tutor_common::EventBus;

use crate::config::RuntimeSettings;
use crate::identity::SqliteAccountDirectory;
use crate::pending::PendingActivationStore;
use crate::services::{ActivationService, Reconciler, RecoveryTool, VerificationService};
use crate::store::{EntitlementStore, SqliteEntitlementStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    pub reconciler: Reconciler,
    pub recovery: RecoveryTool,
    /// Local mirror of identity provider accounts
    pub directory: SqliteAccountDirectory,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub settings: Arc<RuntimeSettings>,
    /// Cancelled on shutdown; retry loops stop between attempts
    pub shutdown: CancellationToken,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last activation failure for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// Wire the engine against the SQLite entitlement store
    pub fn new(
        db: SqlitePool,
        pending: Arc<dyn PendingActivationStore>,
        event_bus: EventBus,
        settings: RuntimeSettings,
    ) -> Self {
        let store = Arc::new(SqliteEntitlementStore::new(db.clone()));
        Self::with_store(db, store, pending, event_bus, settings)
    }

    /// Wire the engine against any entitlement store
    pub fn with_store(
        db: SqlitePool,
        store: Arc<dyn EntitlementStore>,
        pending: Arc<dyn PendingActivationStore>,
        event_bus: EventBus,
        settings: RuntimeSettings,
    ) -> Self {
        let directory = SqliteAccountDirectory::new(db.clone());
        let identity = Arc::new(directory.clone());

        let activation = ActivationService::new(
            store.clone(),
            event_bus.clone(),
            settings.entitlement_period_days,
        );
        let verification = VerificationService::new(store, pending.clone(), event_bus.clone());
        let reconciler = Reconciler::new(
            activation.clone(),
            verification,
            pending,
            identity.clone(),
            event_bus.clone(),
        )
        .with_policy(settings.retry_policy())
        .with_verification_delay(settings.verification_delay());
        let recovery = RecoveryTool::new(identity, activation);

        Self {
            db,
            reconciler,
            recovery,
            directory,
            event_bus,
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember a failure for `/health`
    pub async fn record_error(&self, message: String) {
        *self.last_error.write().await = Some(message);
    }
}

/// Build application router
///
/// Operator routes sit behind the operator token check; everything else is
/// public.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;

    let operator = api::operator_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        api::operator_auth,
    ));

    Router::new()
        .merge(api::payment_routes())
        .merge(api::account_routes())
        .merge(api::activation_routes())
        .merge(api::health_routes())
        .merge(operator)
        .layer(TraceLayer::new_for_http())
        // Banner runs in the web app's origin
        .layer(CorsLayer::permissive())
        .with_state(state)
}
