//! Error types for tutor-activation
//!
//! Store and identity failures are classified here, at the activation
//! boundary. Every activation error carries the external payment reference so
//! a human can cross-check the payment processor's records.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::EntitlementStatus;

/// Entitlement store failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The uniqueness constraint on the payment reference rejected a write
    #[error("entitlement for payment {reference} already exists")]
    Duplicate { reference: String },

    /// Store unreachable, locked, or timed out
    #[error("entitlement store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("corrupt entitlement row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Classify a sqlx error
    pub fn from_sqlx(err: sqlx::Error, reference: &str) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Duplicate {
                reference: reference.to_string(),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Identity provider failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IdentityError {
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The email is already mapped to a different account
    #[error("email {email} is already registered to account {existing}")]
    Conflict { email: String, existing: String },
}

/// Activation failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActivationError {
    /// Retry-eligible failure of a single attempt
    #[error("transient failure activating payment {reference}: {cause}")]
    Transient { reference: String, cause: String },

    /// Retries used up; the intent must be kept as terminal-pending
    #[error("activation of payment {reference} failed after {attempts} attempts: {last_cause}")]
    Exhausted {
        reference: String,
        attempts: u32,
        last_cause: String,
    },

    /// The payment reference is consumed by a record that is no longer active
    #[error("payment {reference} is linked to an entitlement with status {status}")]
    NotActive {
        reference: String,
        status: EntitlementStatus,
    },

    /// The payment reference is already granted to another account
    #[error("payment {reference} is already activated for account {owner}, not {requested}")]
    ReferenceClaimed {
        reference: String,
        owner: String,
        requested: String,
    },

    #[error("invalid activation request for payment '{reference}': {reason}")]
    InvalidRequest { reference: String, reason: String },

    /// Non-transient store failure
    #[error("entitlement store error for payment {reference}: {cause}")]
    Storage { reference: String, cause: String },
}

impl ActivationError {
    pub fn reference(&self) -> &str {
        match self {
            ActivationError::Transient { reference, .. }
            | ActivationError::Exhausted { reference, .. }
            | ActivationError::NotActive { reference, .. }
            | ActivationError::ReferenceClaimed { reference, .. }
            | ActivationError::InvalidRequest { reference, .. }
            | ActivationError::Storage { reference, .. } => reference,
        }
    }

    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ActivationError::Transient { .. })
    }

    /// Classify a store error for `reference`
    ///
    /// `Duplicate` never reaches here: the activation core resolves it.
    pub fn from_store(err: StoreError, reference: &str) -> Self {
        match err {
            StoreError::Unavailable(cause) => ActivationError::Transient {
                reference: reference.to_string(),
                cause,
            },
            StoreError::Duplicate { .. } => ActivationError::Storage {
                reference: reference.to_string(),
                cause: "duplicate could not be resolved to an existing record".to_string(),
            },
            StoreError::Corrupt(cause) => ActivationError::Storage {
                reference: reference.to_string(),
                cause,
            },
        }
    }
}

impl crate::retry::Transient for ActivationError {
    fn is_transient(&self) -> bool {
        ActivationError::is_transient(self)
    }
}

/// Operator recovery failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecoveryError {
    /// No account exists for the email; recovery does not wait for one
    #[error("no account found for {email} (payment {reference})")]
    AccountNotFound { email: String, reference: String },

    #[error("identity lookup failed for payment {reference}: {source}")]
    Identity {
        reference: String,
        #[source]
        source: IdentityError,
    },

    #[error(transparent)]
    Activation(#[from] ActivationError),
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Missing or wrong operator token (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// tutor-common error
    #[error("Common error: {0}")]
    Common(#[from] tutor_common::Error),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Activation(err) | ApiError::Recovery(RecoveryError::Activation(err)) => {
                activation_status(err)
            }
            ApiError::Recovery(RecoveryError::AccountNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND")
            }
            ApiError::Recovery(RecoveryError::Identity { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "IDENTITY_UNAVAILABLE")
            }
            ApiError::Identity(IdentityError::Conflict { .. }) => {
                (StatusCode::CONFLICT, "ACCOUNT_CONFLICT")
            }
            ApiError::Identity(IdentityError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "IDENTITY_UNAVAILABLE")
            }
            ApiError::Common(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }

    fn reference(&self) -> Option<&str> {
        match self {
            ApiError::Activation(err) | ApiError::Recovery(RecoveryError::Activation(err)) => {
                Some(err.reference())
            }
            ApiError::Recovery(RecoveryError::AccountNotFound { reference, .. })
            | ApiError::Recovery(RecoveryError::Identity { reference, .. }) => Some(reference),
            _ => None,
        }
    }
}

fn activation_status(err: &ActivationError) -> (StatusCode, &'static str) {
    match err {
        ActivationError::Transient { .. } => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT_FAILURE"),
        ActivationError::Exhausted { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "TERMINAL_PENDING_FAILURE")
        }
        ActivationError::NotActive { .. } => (StatusCode::CONFLICT, "ENTITLEMENT_NOT_ACTIVE"),
        ActivationError::ReferenceClaimed { .. } => (StatusCode::CONFLICT, "REFERENCE_CLAIMED"),
        ActivationError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        ActivationError::Storage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": self.to_string(),
                "external_payment_reference": self.reference(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
