//! Error types for the gateway and the sync engine.

use crate::model::EntityKind;
use thiserror::Error;

/// Retry policy class for gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Leave the entity pending and try again next pass.
    Retryable,
    /// The server rejected the payload; retrying unchanged will fail again.
    Permanent,
    ReauthRequired,
}

/// Errors returned by the remote gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No connectivity, timeout or connection reset.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success response carrying a body.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Missing or expired bearer token.
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify the error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Rejected { status, .. } => match *status {
                401 | 403 => RetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Transport(_) | Self::Io(_) => RetryClass::Retryable,
            Self::Decode(_) => RetryClass::Permanent,
            Self::Auth(_) => RetryClass::ReauthRequired,
        }
    }

    /// Human-readable message suitable for a toast. Only remote rejections
    /// carry one; transport failures stay silent.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Rejected { message, .. } if !message.trim().is_empty() => {
                Some(extract_message(message))
            }
            Self::Rejected { status, .. } => Some(format!("Server error ({status})")),
            Self::Auth(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}

/// Pull `message` out of a JSON error body if there is one.
fn extract_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Errors surfaced by the engine facade and the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Pass-level precondition: no usable bearer token.
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("invalid update for {kind}: {message}")]
    InvalidUpdate { kind: EntityKind, message: String },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_by_status() {
        assert_eq!(
            GatewayError::rejected(401, "nope").retry_class(),
            RetryClass::ReauthRequired
        );
        assert_eq!(
            GatewayError::rejected(503, "down").retry_class(),
            RetryClass::Retryable
        );
        assert_eq!(
            GatewayError::rejected(422, "bad").retry_class(),
            RetryClass::Permanent
        );
    }

    #[test]
    fn user_message_prefers_json_message_field() {
        let err = GatewayError::rejected(400, r#"{"message":"Legend is required"}"#);
        assert_eq!(err.user_message().as_deref(), Some("Legend is required"));

        let err = GatewayError::rejected(500, "   ");
        assert_eq!(err.user_message().as_deref(), Some("Server error (500)"));

        let err = GatewayError::decode("garbage");
        assert!(err.user_message().is_none());
    }
}
