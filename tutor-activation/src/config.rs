//! Configuration for tutor-activation
//!
//! Two tiers:
//! 1. **TOML bootstrap** ([`tutor_common::config::TomlConfig`]): root folder,
//!    bind address, log level. Read once at startup.
//! 2. **Database runtime** ([`RuntimeSettings`]): retry policy, verification
//!    delay, entitlement period, operator token. Missing values are written
//!    back with their built-in defaults.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (`--root-folder`, `--port`, `--host`)
//! 2. Environment variables (`TUTOR_ROOT_FOLDER`, `TUTOR_ACTIVATION_PORT`)
//! 3. TOML configuration file
//! 4. Built-in defaults

use sqlx::SqlitePool;
use std::time::Duration;
use tutor_common::config::TomlConfig;
use tutor_common::time::millis_to_duration;
use tutor_common::db::get_setting_or_default;
use tutor_common::Result;

use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::services::DEFAULT_PERIOD_DAYS;

/// Module name used for config file and root folder resolution
pub const MODULE_NAME: &str = "tutor-activation";

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 5780;

/// Default bind host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Runtime settings loaded from the `settings` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    // === Retry ===
    pub activation_max_attempts: u32,
    pub activation_backoff_unit_ms: u64,

    // === Verification ===
    pub verification_delay_ms: u64,

    // === Entitlements ===
    pub entitlement_period_days: u32,

    // === Operator surface ===
    /// Empty disables operator authentication
    pub operator_token: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            activation_max_attempts: DEFAULT_MAX_ATTEMPTS,
            activation_backoff_unit_ms: 1000,
            verification_delay_ms: 3000,
            entitlement_period_days: DEFAULT_PERIOD_DAYS,
            operator_token: String::new(),
        }
    }
}

impl RuntimeSettings {
    /// Load runtime settings, writing defaults for anything missing
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();

        let settings = Self {
            activation_max_attempts: get_setting_or_default(
                pool,
                "activation_max_attempts",
                defaults.activation_max_attempts,
            )
            .await?,
            activation_backoff_unit_ms: get_setting_or_default(
                pool,
                "activation_backoff_unit_ms",
                defaults.activation_backoff_unit_ms,
            )
            .await?,
            verification_delay_ms: get_setting_or_default(
                pool,
                "verification_delay_ms",
                defaults.verification_delay_ms,
            )
            .await?,
            entitlement_period_days: get_setting_or_default(
                pool,
                "entitlement_period_days",
                defaults.entitlement_period_days,
            )
            .await?,
            operator_token: get_setting_or_default(pool, "operator_token", defaults.operator_token)
                .await?,
        };

        tracing::info!(
            max_attempts = settings.activation_max_attempts,
            backoff_unit_ms = settings.activation_backoff_unit_ms,
            verification_delay_ms = settings.verification_delay_ms,
            period_days = settings.entitlement_period_days,
            operator_auth = settings.operator_auth_enabled(),
            "Runtime settings loaded"
        );

        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.activation_max_attempts,
            millis_to_duration(self.activation_backoff_unit_ms),
        )
    }

    pub fn verification_delay(&self) -> Duration {
        millis_to_duration(self.verification_delay_ms)
    }

    pub fn operator_auth_enabled(&self) -> bool {
        !self.operator_token.is_empty()
    }
}

/// Resolved HTTP bind address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddress {
    pub host: String,
    pub port: u16,
}

impl BindAddress {
    /// CLI/env value first, then TOML, then built-in default
    pub fn resolve(cli_host: Option<String>, cli_port: Option<u16>, toml: &TomlConfig) -> Self {
        Self {
            host: cli_host
                .or_else(|| toml.host.clone())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli_port.or(toml.port).unwrap_or(DEFAULT_PORT),
        }
    }

    pub fn as_socket_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
