//! Activation services

pub mod activation;
pub mod reconciler;
pub mod recovery;
pub mod verification;

pub use activation::{Activated, ActivationService, DEFAULT_PERIOD_DAYS};
pub use reconciler::{ActivationStatus, IntentProgress, IntentReport, Reconciler};
pub use recovery::{recovery_message, RecoveryTool};
pub use verification::{Verification, VerificationService};
