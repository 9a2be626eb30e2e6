//! Activation endpoints for the paying user
//!
//! Banner status, the retry trigger, page-load reconciliation and an SSE feed
//! of activation events. Activation work runs in a spawned task so a client
//! disconnect never drops an in-flight store write.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use crate::error::{ActivationError, ApiError, ApiResult};
use crate::models::{ActivationOutcome, ActivationState, EntitlementRecord};
use crate::services::{ActivationStatus, IntentProgress, Verification};
use crate::AppState;

/// Result of an activation pass, as shown to the user
#[derive(Debug, Serialize)]
pub struct ActivationResponse {
    pub external_payment_reference: String,
    pub state: ActivationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActivationOutcome>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlement: Option<EntitlementRecord>,
}

impl ActivationResponse {
    pub fn from_progress(reference: &str, progress: IntentProgress) -> (StatusCode, Self) {
        match progress {
            IntentProgress::Activated(activated) => (
                StatusCode::OK,
                Self {
                    external_payment_reference: reference.to_string(),
                    state: ActivationState::Active,
                    outcome: Some(activated.outcome),
                    message: format!("Subscription {}", activated.outcome.describe()),
                    entitlement: Some(activated.record),
                },
            ),
            IntentProgress::AwaitingAccount => (
                StatusCode::ACCEPTED,
                Self {
                    external_payment_reference: reference.to_string(),
                    state: ActivationState::PendingAccountCreation,
                    outcome: None,
                    message: "Payment recorded; activation will run once the account exists"
                        .to_string(),
                    entitlement: None,
                },
            ),
            IntentProgress::Cancelled { attempts } => (
                StatusCode::ACCEPTED,
                Self {
                    external_payment_reference: reference.to_string(),
                    state: ActivationState::Activating,
                    outcome: None,
                    message: format!("Activation interrupted after {} attempt(s)", attempts),
                    entitlement: None,
                },
            ),
        }
    }

    pub fn from_error(err: &ActivationError) -> Self {
        Self {
            external_payment_reference: err.reference().to_string(),
            state: ActivationState::TerminalPendingFailure,
            outcome: None,
            message: err.to_string(),
            entitlement: None,
        }
    }
}

/// Run activation work on its own task and wait for it
///
/// Failures are recorded as the service's last error for `/health`.
pub(crate) async fn run_detached<F, T>(state: &AppState, work: F) -> ApiResult<T>
where
    F: Future<Output = Result<T, ActivationError>> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::spawn(work)
        .await
        .map_err(|e| ApiError::Internal(format!("activation task failed: {}", e)))?;

    if let Err(err) = &result {
        state.record_error(err.to_string()).await;
    }
    Ok(result?)
}

/// GET /api/activations/:reference
pub async fn activation_status(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<ActivationStatus>> {
    Ok(Json(state.reconciler.status(&reference).await?))
}

/// POST /api/activations/:reference/retry
///
/// Re-runs activation from the persisted intent. With nothing pending, an
/// existing entitlement is reported as already active.
pub async fn retry_activation(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<(StatusCode, Json<ActivationResponse>)> {
    let reconciler = state.reconciler.clone();
    let cancel = state.shutdown.child_token();
    let task_reference = reference.clone();

    let progress = run_detached(&state, async move {
        reconciler.retry(&task_reference, &cancel).await
    })
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("No activation known for payment {}", reference)))?;

    let (status, body) = ActivationResponse::from_progress(&reference, progress);
    Ok((status, Json(body)))
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ReconcileEntry {
    pub external_payment_reference: String,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlement: Option<EntitlementRecord>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub email: String,
    pub results: Vec<ReconcileEntry>,
}

/// POST /api/activations/reconcile
///
/// Page-load verification of every outstanding intent for an email. Intents
/// that are still not active get another automatic activation run.
pub async fn reconcile_account(
    State(state): State<AppState>,
    Json(request): Json<ReconcileRequest>,
) -> ApiResult<Json<ReconcileResponse>> {
    if request.email.trim().is_empty() {
        return Err(ApiError::BadRequest("email is required".to_string()));
    }

    let reconciler = state.reconciler.clone();
    let cancel = state.shutdown.child_token();
    let email = request.email.clone();

    let results = run_detached(&state, async move {
        reconciler.reconcile_account(&email, &cancel).await
    })
    .await?
    .into_iter()
    .map(|(reference, verification)| match verification {
        Verification::Verified(record) => ReconcileEntry {
            external_payment_reference: reference,
            verified: true,
            entitlement: Some(record),
        },
        Verification::NotYetActive => ReconcileEntry {
            external_payment_reference: reference,
            verified: false,
            entitlement: None,
        },
    })
    .collect();

    Ok(Json(ReconcileResponse {
        email: request.email,
        results,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    /// Only forward events for this payment reference
    pub reference: Option<String>,
}

/// GET /api/activations/events - SSE feed for the banner
///
/// Streams:
/// - ActivationStateChanged
/// - ActivationAttempted
/// - EntitlementCreated
pub async fn activation_event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(reference = ?filter.reference, "New SSE client connected to activation events");

    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    yield Ok(Event::default().comment("heartbeat"));
                }

                Ok(event) = rx.recv() => {
                    if filter
                        .reference
                        .as_deref()
                        .is_some_and(|wanted| wanted != event.reference())
                    {
                        continue;
                    }

                    let event_type = event.event_type();
                    match serde_json::to_string(&event) {
                        Ok(json) => yield Ok(Event::default().event(event_type).data(json)),
                        Err(e) => {
                            tracing::warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

/// Build activation routes
pub fn activation_routes() -> Router<AppState> {
    Router::new()
        .route("/api/activations/events", get(activation_event_stream))
        .route("/api/activations/reconcile", post(reconcile_account))
        .route("/api/activations/:reference", get(activation_status))
        .route("/api/activations/:reference/retry", post(retry_activation))
}
