//! Error types for the inventory export engine.

use thiserror::Error;

use crate::model::NodeKind;
use crate::result::RunErrorKind;

/// Result type alias using `ExportError`.
pub type ExportResult<T> = Result<T, ExportError>;

/// Errors raised while authenticating against or listing from the cloud APIs.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The identity could not be validated or no token could be obtained.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Rate limited (429/503) on every attempt.
    #[error("Throttled after {attempts} attempts: {url}")]
    Throttled { url: String, attempts: u32 },

    /// Non-retryable 4xx response.
    #[error("Client error {status} ({code}): {message}")]
    Client {
        status: u16,
        code: String,
        message: String,
    },

    /// 5xx or transport failure that persisted through every retry.
    #[error("Server error after {attempts} attempts (status {status:?}): {message}")]
    Server {
        status: Option<u16>,
        attempts: u32,
        message: String,
    },

    /// HTTP client construction or body read error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body was not the expected JSON shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// The run was cancelled before the request was sent.
    #[error("Cancelled before requesting {url}")]
    Cancelled { url: String },
}

impl ExportError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExportError::Throttled { .. } | ExportError::Server { .. } | ExportError::Http(_)
        )
    }

    /// Maps the error onto the run-level error taxonomy.
    #[must_use]
    pub fn kind(&self) -> RunErrorKind {
        match self {
            ExportError::Auth(_) => RunErrorKind::Auth,
            ExportError::Throttled { .. } => RunErrorKind::Throttled,
            ExportError::Client { .. }
            | ExportError::Config(_)
            | ExportError::Url(_)
            | ExportError::Cancelled { .. } => RunErrorKind::Client,
            ExportError::Server { .. } | ExportError::Http(_) | ExportError::Json(_) => {
                RunErrorKind::Server
            }
        }
    }
}

/// Normalization failures. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// The raw record carries no usable `id`.
    #[error("{kind} record is missing its id field")]
    MissingId { kind: NodeKind },

    /// The event could not be serialized to the wire format.
    #[error("Failed to serialize event {source_id}: {cause}")]
    Serialization { source_id: String, cause: String },
}
