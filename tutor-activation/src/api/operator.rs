//! Operator surface: manual recovery and the pending view
//!
//! Protected by the `x-operator-token` header when the `operator_token`
//! setting is non-empty. An empty token disables the check.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::payments::parse_plan;
use crate::error::{ApiError, ApiResult};
use crate::models::{ActivationOutcome, EntitlementRecord, PendingActivationIntent};
use crate::services::recovery_message;
use crate::AppState;

/// Header carrying the operator token
pub const OPERATOR_TOKEN_HEADER: &str = "x-operator-token";

/// Operator authentication middleware
pub async fn operator_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.settings.operator_auth_enabled() {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(OPERATOR_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match provided {
        Some(token) if token == state.settings.operator_token => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Rejected operator request: wrong token");
            Err(ApiError::Unauthorized("invalid operator token".to_string()))
        }
        None => Err(ApiError::Unauthorized(format!(
            "missing {} header",
            OPERATOR_TOKEN_HEADER
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct RecoveryRequest {
    pub account_email: String,
    pub external_payment_reference: String,
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct RecoveryResponse {
    pub external_payment_reference: String,
    pub outcome: ActivationOutcome,
    pub message: String,
    pub entitlement: EntitlementRecord,
}

/// POST /api/operator/recover
///
/// 201 when the entitlement was newly created, 200 when it was already active.
pub async fn recover(
    State(state): State<AppState>,
    Json(request): Json<RecoveryRequest>,
) -> ApiResult<(StatusCode, Json<RecoveryResponse>)> {
    let plan = parse_plan(&request.plan)?;
    let reference = request.external_payment_reference.trim().to_string();
    if request.account_email.trim().is_empty() {
        return Err(ApiError::BadRequest("account_email is required".to_string()));
    }

    let recovery = state.recovery.clone();
    let email = request.account_email.clone();
    let task_reference = reference.clone();

    // Detached so a dropped connection cannot cancel the write
    let result = tokio::spawn(async move { recovery.recover(&email, &task_reference, plan).await })
        .await
        .map_err(|e| ApiError::Internal(format!("recovery task failed: {}", e)))?;

    let activated = match result {
        Ok(activated) => activated,
        Err(err) => {
            state.record_error(err.to_string()).await;
            return Err(err.into());
        }
    };

    let status = match activated.outcome {
        ActivationOutcome::Created => StatusCode::CREATED,
        ActivationOutcome::AlreadyExisted => StatusCode::OK,
    };

    Ok((
        status,
        Json(RecoveryResponse {
            message: recovery_message(&reference, &activated),
            external_payment_reference: reference,
            outcome: activated.outcome,
            entitlement: activated.record,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub count: usize,
    pub intents: Vec<PendingActivationIntent>,
}

/// GET /api/operator/pending
pub async fn pending_intents(State(state): State<AppState>) -> ApiResult<Json<PendingResponse>> {
    let intents = state.reconciler.pending_intents().await?;
    Ok(Json(PendingResponse {
        count: intents.len(),
        intents,
    }))
}

/// Build operator routes (auth layer is applied in `build_router`)
pub fn operator_routes() -> Router<AppState> {
    Router::new()
        .route("/api/operator/recover", post(recover))
        .route("/api/operator/pending", get(pending_intents))
}
