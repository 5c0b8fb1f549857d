//! Error types for Mailroom.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error(
        "Cannot infer wire protocol for model '{model}'. Set LLM_PROTOCOL to 'chat' or 'responses'"
    )]
    UnknownModelProtocol { model: String },
}

/// Store-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Classification of an LLM failure, as surfaced to the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    RateLimit,
    ApiError,
    InvalidRequest,
    Timeout,
    EmptyResponse,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimit => "rate_limit",
            Self::ApiError => "api_error",
            Self::InvalidRequest => "invalid_request",
            Self::Timeout => "timeout",
            Self::EmptyResponse => "empty_response",
        };
        write!(f, "{s}")
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} server error ({status}): {reason}")]
    Api {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Provider {provider} rejected the request ({status}): {reason}")]
    InvalidRequest {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Provider {provider} request failed in transport: {reason}")]
    Timeout { provider: String, reason: String },

    #[error("Provider {provider} returned no usable content: {reason}")]
    EmptyResponse { provider: String, reason: String },
}

impl LlmError {
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            Self::RateLimited { .. } => LlmErrorKind::RateLimit,
            Self::Api { .. } => LlmErrorKind::ApiError,
            Self::InvalidRequest { .. } => LlmErrorKind::InvalidRequest,
            Self::Timeout { .. } => LlmErrorKind::Timeout,
            Self::EmptyResponse { .. } => LlmErrorKind::EmptyResponse,
        }
    }

    /// Malformed requests and empty payloads are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidRequest { .. } | Self::EmptyResponse { .. }
        )
    }

    /// Failures a human has to look at before another attempt makes sense.
    pub fn needs_manual_review(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. })
    }
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Email sending is disabled")]
    Disabled,

    #[error("Recipient rejected by domain policy: {reason}")]
    PolicyRejected { reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Provider {provider} rejected the message ({status}): {reason}")]
    Rejected {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Transport error on {provider}: {reason}")]
    Transport { provider: String, reason: String },
}

/// Orchestrator errors. LLM failures are not errors at this level: they are
/// recorded on the record's state and returned as a processing result.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Email {id} not found")]
    NotFound { id: String },

    #[error("Email {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Email {id} is already being processed")]
    AlreadyInFlight { id: String },

    #[error("Email {id} has no generated response (status {status})")]
    NotCompleted { id: String, status: String },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> String {
        "test".to_string()
    }

    #[test]
    fn retryable_classes() {
        assert!(
            LlmError::RateLimited {
                provider: provider(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(
            LlmError::Api {
                provider: provider(),
                status: 502,
                reason: "bad gateway".into()
            }
            .is_retryable()
        );
        assert!(
            LlmError::Timeout {
                provider: provider(),
                reason: "connect".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::InvalidRequest {
                provider: provider(),
                status: 400,
                reason: "bad".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::EmptyResponse {
                provider: provider(),
                reason: "no content".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn only_invalid_request_needs_review() {
        let invalid = LlmError::InvalidRequest {
            provider: provider(),
            status: 400,
            reason: "bad".into(),
        };
        let empty = LlmError::EmptyResponse {
            provider: provider(),
            reason: "none".into(),
        };
        assert!(invalid.needs_manual_review());
        assert!(!empty.needs_manual_review());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_value(LlmErrorKind::EmptyResponse).unwrap();
        assert_eq!(json, "empty_response");
        assert_eq!(LlmErrorKind::RateLimit.to_string(), "rate_limit");
    }
}
