//! Configuration types.

use std::time::Duration;

use crate::correlation::TokenFormat;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Reconciliation settings shared by the inbound and outbound sides.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Label marking tickets that belong to the helpdesk.
    pub routing_label: String,
    /// Subject token syntax, e.g. `[GH-0042]`.
    pub tokens: TokenFormat,
    /// Most message ids kept per correlation record; `None` keeps all.
    pub history_cap: Option<usize>,
    pub retry: RetryPolicy,
}

impl ReconcileConfig {
    pub const DEFAULT_LABEL: &'static str = "helpdesk";
    pub const DEFAULT_PREFIX: &'static str = "GH";
    pub const DEFAULT_HISTORY_CAP: usize = 50;

    pub fn new(routing_label: &str, token_prefix: &str) -> Result<Self, ConfigError> {
        let routing_label = routing_label.trim();
        if routing_label.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "HELPDESK_LABEL".into(),
                message: "routing label must not be empty".into(),
            });
        }
        Ok(Self {
            routing_label: routing_label.to_string(),
            tokens: TokenFormat::new(token_prefix)?,
            history_cap: Some(Self::DEFAULT_HISTORY_CAP),
            retry: RetryPolicy::default(),
        })
    }

    /// Build from `HELPDESK_LABEL`, `TICKET_PREFIX`, `HELPDESK_HISTORY_CAP`
    /// (0 disables the cap) and the `HELPDESK_RETRY_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let label = optional("HELPDESK_LABEL").unwrap_or_else(|| Self::DEFAULT_LABEL.into());
        let prefix = optional("TICKET_PREFIX").unwrap_or_else(|| Self::DEFAULT_PREFIX.into());
        let mut config = Self::new(&label, &prefix)?;

        let cap: usize = parse_or("HELPDESK_HISTORY_CAP", Self::DEFAULT_HISTORY_CAP)?;
        config.history_cap = (cap > 0).then_some(cap);

        let defaults = RetryPolicy::default();
        let max_attempts: u32 = parse_or("HELPDESK_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HELPDESK_RETRY_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        let base_ms: u64 =
            parse_or("HELPDESK_RETRY_BASE_MS", defaults.base_delay.as_millis() as u64)?;
        config.retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: defaults.max_delay,
        };
        Ok(config)
    }
}

// ── Environment helpers ─────────────────────────────────────────────

/// Non-blank value of `key`, trimmed.
pub(crate) fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn required(key: &str) -> Result<String, ConfigError> {
    optional(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()))
}

/// Parse `key` if set, otherwise fall back to `default`.
pub(crate) fn parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}
