use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors produced by the generator and its backends.
///
/// Only [`InvalidRequest`](GenerationError::InvalidRequest) and
/// [`InvalidConfig`](GenerationError::InvalidConfig) ever escape
/// [`Generator::run`](crate::Generator::run). Everything else is a transport
/// failure that the generation loop classifies, records and recovers from.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON decoding of a provider response failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A backend reported an already-classified failure.
    #[error("backend failure: {0}")]
    Backend(BackendError),

    /// The provider answered, but not in a shape we understand.
    #[error("backend '{backend}' returned a malformed response: {reason}")]
    MalformedResponse { backend: String, reason: String },

    /// The caller submitted a request that violates its contract.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generation was cancelled via the cancellation flag.
    #[error("Generation was cancelled")]
    Cancelled,

    /// The request deadline passed before the next backend call.
    #[error("Deadline reached before the next backend call")]
    DeadlineReached,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for GenerationError {
    fn from(err: anyhow::Error) -> Self {
        GenerationError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyhow_conversion_keeps_message() {
        let err: GenerationError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(err, GenerationError::Other(ref m) if m == "disk on fire"));
    }

    #[test]
    fn test_display_messages() {
        let err = GenerationError::HttpError {
            status: 503,
            body: "overloaded".into(),
            retry_after: None,
        };
        assert_eq!(err.to_string(), "HTTP 503: overloaded");

        let err = GenerationError::InvalidRequest("count must be at least 1".into());
        assert_eq!(err.to_string(), "Invalid request: count must be at least 1");
    }
}
