//! Error types for the helpdesk bridge.

use std::time::Duration;

/// Top-level error type for a reconciliation run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Correlation record error: {0}")]
    Codec(#[from] CodecError),
}

impl Error {
    /// Whether this failure should leave the item for a later run.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_retryable(),
            Self::Config(_) => true,
            Self::Codec(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the mail server or the ticket tracker.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{service} request failed: {reason}")]
    Transient { service: String, reason: String },

    #[error("{service} rate limited, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("Validation failed: {0}")]
    PermanentValidation(String),
}

impl TransportError {
    pub fn transient(service: &str, reason: impl ToString) -> Self {
        Self::Transient {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Network, auth and rate-limit failures are retried; validation failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Correlation record decode failures. Both are recoverable: callers treat
/// them as "no correlation found".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("no correlation record in description")]
    NotFound,

    #[error("malformed correlation record: {reason}")]
    MalformedRecord { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_rate_limited_are_retryable() {
        assert!(TransportError::transient("github", "502").is_retryable());
        assert!(
            TransportError::RateLimited {
                service: "github".into(),
                retry_after: Some(Duration::from_secs(3)),
            }
            .is_retryable()
        );
        assert!(!TransportError::PermanentValidation("empty sender".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        let limited = TransportError::RateLimited {
            service: "github".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(TransportError::transient("imap", "reset").retry_after(), None);
    }

    #[test]
    fn permanence_follows_transport_kind() {
        let e: Error = TransportError::PermanentValidation("bad".into()).into();
        assert!(e.is_permanent());
        let e: Error = TransportError::transient("smtp", "timeout").into();
        assert!(!e.is_permanent());
        let e: Error = CodecError::NotFound.into();
        assert!(!e.is_permanent());
    }
}
