//! HTTP API handlers for tutor-activation

pub mod accounts;
pub mod activations;
pub mod health;
pub mod operator;
pub mod payments;

pub use accounts::account_routes;
pub use activations::activation_routes;
pub use health::health_routes;
pub use operator::{operator_auth, operator_routes};
pub use payments::payment_routes;
