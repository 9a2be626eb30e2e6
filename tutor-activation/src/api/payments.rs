//! Payment confirmation boundary
//!
//! The payment processor may deliver a confirmation more than once, so even
//! the first call goes through the full dedup path.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;

use super::activations::{run_detached, ActivationResponse};
use crate::error::{ApiError, ApiResult};
use crate::models::Plan;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PaymentConfirmedRequest {
    pub external_payment_reference: String,
    pub payer_email: String,
    /// "standard" or "premium" (case-insensitive)
    pub plan: String,
}

pub(crate) fn parse_plan(plan: &str) -> ApiResult<Plan> {
    plan.parse::<Plan>().map_err(ApiError::BadRequest)
}

/// POST /api/payments/confirmed
///
/// Records the activation intent, then activates if the payer already has an
/// account. Returns 200 once an entitlement exists, 202 while waiting for the
/// account, 503 when retries are exhausted (the intent is kept).
pub async fn payment_confirmed(
    State(state): State<AppState>,
    Json(request): Json<PaymentConfirmedRequest>,
) -> ApiResult<(StatusCode, Json<ActivationResponse>)> {
    let plan = parse_plan(&request.plan)?;
    let reference = request.external_payment_reference.trim().to_string();

    let reconciler = state.reconciler.clone();
    let cancel = state.shutdown.child_token();

    let progress = run_detached(&state, async move {
        reconciler
            .on_payment_confirmed(
                &request.external_payment_reference,
                &request.payer_email,
                plan,
                &cancel,
            )
            .await
    })
    .await?;

    let (status, body) = ActivationResponse::from_progress(&reference, progress);
    Ok((status, Json(body)))
}

/// Build payment routes
pub fn payment_routes() -> Router<AppState> {
    Router::new().route("/api/payments/confirmed", post(payment_confirmed))
}
