//! Error types for the AI orchestration layer

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, AiError>;

/// Errors surfaced by the orchestrator and its collaborators
#[derive(Debug, Error, PartialEq, Clone)]
pub enum AiError {
    /// Provider rejected the request (malformed, auth failure, not found).
    /// Never retried.
    #[error("Request rejected by provider ({status}): {message}")]
    NonRetryable { status: u16, message: String },

    /// Timeout, 5xx or network failure. Retried with backoff.
    #[error("Transient provider error: {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// Breaker for the named target is open; the provider was not invoked
    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    /// No adapter is configured or available
    #[error("No AI provider available")]
    NoProviderAvailable,

    /// The token budget cannot hold even the pinned messages
    #[error("Context budget infeasible: {required} tokens required, budget is {budget}")]
    ContextBudgetInfeasible { required: usize, budget: usize },

    /// Request failed local validation before reaching a provider
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// HTTP statuses that indicate a request can never succeed as sent
const NON_RETRYABLE_STATUSES: [u16; 4] = [400, 401, 403, 404];

impl AiError {
    /// Classify a failed HTTP-equivalent status from a provider
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if NON_RETRYABLE_STATUSES.contains(&status) {
            AiError::NonRetryable { status, message }
        } else {
            AiError::Transient {
                status: Some(status),
                message,
            }
        }
    }

    /// Shorthand for a transient failure without a status code
    pub fn transient(message: impl Into<String>) -> Self {
        AiError::Transient {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the retrying executor may attempt the call again
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AiError::NonRetryable { .. }
                | AiError::CircuitOpen(_)
                | AiError::NoProviderAvailable
                | AiError::ContextBudgetInfeasible { .. }
                | AiError::InvalidRequest(_)
                | AiError::Config(_)
        )
    }

    /// HTTP-equivalent status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            AiError::NonRetryable { status, .. } => Some(*status),
            AiError::Transient { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AiError {
    fn from(err: serde_json::Error) -> Self {
        AiError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            AiError::from_status(status.as_u16(), err.to_string())
        } else if err.is_timeout() {
            AiError::transient("Request timeout")
        } else {
            AiError::transient(err.to_string())
        }
    }
}

impl From<::config::ConfigError> for AiError {
    fn from(err: ::config::ConfigError) -> Self {
        AiError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_retryable() {
        for status in [400, 401, 403, 404] {
            let err = AiError::from_status(status, "nope");
            assert!(!err.is_retryable(), "status {} should not retry", status);
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn test_server_and_throttle_errors_are_retryable() {
        for status in [408, 429, 500, 502, 503] {
            let err = AiError::from_status(status, "later");
            assert!(err.is_retryable(), "status {} should retry", status);
        }
        assert!(AiError::transient("connection reset").is_retryable());
    }

    #[test]
    fn test_local_errors_are_not_retryable() {
        assert!(!AiError::CircuitOpen("openai".to_string()).is_retryable());
        assert!(!AiError::NoProviderAvailable.is_retryable());
        assert!(!AiError::InvalidRequest("empty".to_string()).is_retryable());
        assert!(!AiError::ContextBudgetInfeasible {
            required: 10,
            budget: 0
        }
        .is_retryable());
    }
}
