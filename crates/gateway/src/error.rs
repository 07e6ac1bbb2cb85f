//! Error types for the routing core.
//!
//! [`ProviderError`] classifies adapter failures so the fallback loop can
//! decide whether to move on to the next candidate or to degrade the
//! provider. [`GatewayError`] is the surface callers see.

use thiserror::Error;

/// Classified failure from a provider adapter call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider rate limited the request")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("provider authentication failed: {0}")]
    Auth(String),

    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether the fallback loop may continue without degrading the
    /// provider's registry status.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::Transient(_)
                | ProviderError::RateLimited { .. }
        )
    }

    /// Stable label for telemetry events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "timeout",
            ProviderError::Transient(_) => "transient",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Auth(_) => "auth",
            ProviderError::Permanent(_) => "permanent",
        }
    }

    /// Classify an HTTP status from a provider backend.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ProviderError::RateLimited {
                retry_after_secs: None,
            },
            408 => ProviderError::Timeout,
            401 | 403 => ProviderError::Auth(body),
            500..=599 => ProviderError::Transient(format!("status {status}: {body}")),
            _ => ProviderError::Permanent(format!("status {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_connect() {
            ProviderError::Transient(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::from_status(status.as_u16(), e.to_string())
        } else {
            ProviderError::Transient(e.to_string())
        }
    }
}

/// Error surfaced to the gateway's caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("no providers available for this request")]
    NoProvidersAvailable,

    #[error("request validation failed: {0}")]
    ValidationFailed(String),

    #[error("request cancelled by caller")]
    Cancelled,

    #[error("circuit open for provider {0}")]
    CircuitOpen(String),

    #[error("bulkhead full for provider {0}")]
    BulkheadFull(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Retry-after hint in seconds, when one applies.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                *retry_after_secs
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            ProviderError::from_status(429, String::new()),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(503, String::new()),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            ProviderError::from_status(401, String::new()),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(400, String::new()),
            ProviderError::Permanent(_)
        ));
        assert!(matches!(
            ProviderError::from_status(408, String::new()),
            ProviderError::Timeout
        ));
    }

    #[test]
    fn retryable_kinds() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Transient("x".into()).is_retryable());
        assert!(ProviderError::RateLimited {
            retry_after_secs: Some(5)
        }
        .is_retryable());
        assert!(!ProviderError::Auth("x".into()).is_retryable());
        assert!(!ProviderError::Permanent("x".into()).is_retryable());
    }
}
