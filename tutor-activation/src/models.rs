//! Domain types for subscription activation
//!
//! [`PendingActivationIntent`] is client-held and may exist before the paying
//! user has an account. [`EntitlementRecord`] is the durable grant, unique per
//! external payment reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Subscription plan purchased through the payment processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Standard,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Standard => "standard",
            Plan::Premium => "premium",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Plan::Standard),
            "premium" => Ok(Plan::Premium),
            other => Err(format!("unknown plan '{}'", other)),
        }
    }
}

/// Lifecycle status of an entitlement
///
/// Only `Active` is written by this crate; the others come from renewal and
/// cancellation handling elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    Active,
    Expired,
    Canceled,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementStatus::Active => "active",
            EntitlementStatus::Expired => "expired",
            EntitlementStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EntitlementStatus::Active),
            "expired" => Ok(EntitlementStatus::Expired),
            "canceled" => Ok(EntitlementStatus::Canceled),
            other => Err(format!("unknown entitlement status '{}'", other)),
        }
    }
}

/// Entry point that wrote an entitlement (audit only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementSource {
    /// Payment confirmation, account callback, or user retry
    Automatic,
    /// Operator recovery
    Recovery,
}

impl EntitlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementSource::Automatic => "automatic",
            EntitlementSource::Recovery => "recovery",
        }
    }
}

impl FromStr for EntitlementSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(EntitlementSource::Automatic),
            "recovery" => Ok(EntitlementSource::Recovery),
            other => Err(format!("unknown entitlement source '{}'", other)),
        }
    }
}

/// Durable grant of a plan to an account for one payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub entitlement_id: Uuid,
    pub account_id: String,
    pub external_payment_reference: String,
    pub plan: Plan,
    pub status: EntitlementStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub source: EntitlementSource,
    pub created_at: DateTime<Utc>,
}

impl EntitlementRecord {
    /// Build a fresh active entitlement starting at `period_start`
    pub fn new_active(
        account_id: &str,
        external_payment_reference: &str,
        plan: Plan,
        period_start: DateTime<Utc>,
        period_days: u32,
        source: EntitlementSource,
    ) -> Self {
        Self {
            entitlement_id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            external_payment_reference: external_payment_reference.to_string(),
            plan,
            status: EntitlementStatus::Active,
            period_start,
            period_end: tutor_common::time::period_end(period_start, period_days),
            source,
            created_at: period_start,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EntitlementStatus::Active
    }

    /// Whether two records grant the same thing
    ///
    /// Compares account, reference, plan, status and period length; ignores
    /// the surrogate id, absolute timestamps and the audit source.
    pub fn grants_same_as(&self, other: &EntitlementRecord) -> bool {
        self.account_id == other.account_id
            && self.external_payment_reference == other.external_payment_reference
            && self.plan == other.plan
            && self.status == other.status
            && (self.period_end - self.period_start) == (other.period_end - other.period_start)
    }
}

/// Activation state of one external payment reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    NoIntent,
    PendingAccountCreation,
    Activating,
    Active,
    TerminalPendingFailure,
}

impl ActivationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationState::NoIntent => "no_intent",
            ActivationState::PendingAccountCreation => "pending_account_creation",
            ActivationState::Activating => "activating",
            ActivationState::Active => "active",
            ActivationState::TerminalPendingFailure => "terminal_pending_failure",
        }
    }

    /// Payment confirmed but no entitlement confirmed yet
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            ActivationState::PendingAccountCreation
                | ActivationState::Activating
                | ActivationState::TerminalPendingFailure
        )
    }

    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// `Active` is terminal. Re-entering the current state is always allowed
    /// (retries and replayed confirmations).
    pub fn can_transition_to(&self, next: ActivationState) -> bool {
        use ActivationState::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (NoIntent, PendingAccountCreation)
                | (NoIntent, Activating)
                | (PendingAccountCreation, Activating)
                | (Activating, Active)
                | (Activating, TerminalPendingFailure)
                | (Activating, PendingAccountCreation)
                | (TerminalPendingFailure, Activating)
                | (TerminalPendingFailure, Active)
                | (PendingAccountCreation, Active)
        )
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-held record of an activation that should happen or be retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingActivationIntent {
    pub external_payment_reference: String,
    /// Normalized with [`normalize_email`]
    pub account_email: String,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub state: ActivationState,
    /// Last classified failure, kept for the banner and operators
    pub last_error: Option<String>,
}

impl PendingActivationIntent {
    pub fn new(external_payment_reference: &str, account_email: &str, plan: Plan) -> Self {
        Self {
            external_payment_reference: external_payment_reference.trim().to_string(),
            account_email: normalize_email(account_email),
            plan,
            created_at: Utc::now(),
            last_attempt_at: None,
            attempt_count: 0,
            state: ActivationState::PendingAccountCreation,
            last_error: None,
        }
    }
}

/// How a successful activation was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOutcome {
    /// This call wrote the entitlement
    Created,
    /// The entitlement already existed (replay, double submit, or lost race)
    AlreadyExisted,
}

impl ActivationOutcome {
    /// Operator-facing wording
    pub fn describe(&self) -> &'static str {
        match self {
            ActivationOutcome::Created => "newly created",
            ActivationOutcome::AlreadyExisted => "already active",
        }
    }
}

/// Result of one activation attempt, as reported to logs and callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Created,
    AlreadyExisted,
    TransientFailure,
    TerminalFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Created => "created",
            AttemptOutcome::AlreadyExisted => "already_existed",
            AttemptOutcome::TransientFailure => "transient_failure",
            AttemptOutcome::TerminalFailure => "terminal_failure",
        }
    }
}

impl From<ActivationOutcome> for AttemptOutcome {
    fn from(outcome: ActivationOutcome) -> Self {
        match outcome {
            ActivationOutcome::Created => AttemptOutcome::Created,
            ActivationOutcome::AlreadyExisted => AttemptOutcome::AlreadyExisted,
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call into the activation core (not persisted)
#[derive(Debug, Clone, Serialize)]
pub struct ActivationAttempt {
    pub external_payment_reference: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
}

impl ActivationAttempt {
    pub fn new(external_payment_reference: &str, attempt: u32, outcome: AttemptOutcome) -> Self {
        Self {
            external_payment_reference: external_payment_reference.to_string(),
            attempt,
            outcome,
            at: Utc::now(),
        }
    }
}

/// Trim and lowercase an email for matching against the identity provider
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
