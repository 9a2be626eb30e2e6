//! Identity provider `account_created` callback

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use super::activations::ActivationResponse;
use crate::error::{ApiError, ApiResult};
use crate::models::normalize_email;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AccountCreatedRequest {
    pub account_id: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct AccountCreatedResponse {
    pub account_id: String,
    /// One entry per activation that was waiting on this account
    pub resumed: Vec<ActivationResponse>,
}

/// POST /api/accounts/created
///
/// Mirrors the account into the local directory, then resumes any intents
/// that were waiting for it. Replays are harmless.
pub async fn account_created(
    State(state): State<AppState>,
    Json(request): Json<AccountCreatedRequest>,
) -> ApiResult<Json<AccountCreatedResponse>> {
    let account_id = request.account_id.trim().to_string();
    let email = normalize_email(&request.email);
    if account_id.is_empty() || email.is_empty() {
        return Err(ApiError::BadRequest(
            "account_id and email are required".to_string(),
        ));
    }

    state.directory.record_account(&account_id, &email).await?;

    let reconciler = state.reconciler.clone();
    let cancel = state.shutdown.child_token();
    let task_account = account_id.clone();

    let reports = tokio::spawn(async move {
        reconciler
            .on_account_created(&task_account, &email, &cancel)
            .await
    })
    .await
    .map_err(|e| ApiError::Internal(format!("activation task failed: {}", e)))??;

    let mut resumed = Vec::with_capacity(reports.len());
    for report in reports {
        let response = match report.result {
            Ok(progress) => ActivationResponse::from_progress(&report.reference, progress).1,
            Err(err) => {
                state.record_error(err.to_string()).await;
                ActivationResponse::from_error(&err)
            }
        };
        resumed.push(response);
    }

    Ok(Json(AccountCreatedResponse {
        account_id,
        resumed,
    }))
}

/// Build account routes
pub fn account_routes() -> Router<AppState> {
    Router::new().route("/api/accounts/created", post(account_created))
}
