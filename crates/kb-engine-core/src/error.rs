//! Error taxonomy for ingestion and retrieval.
//!
//! Every component reports failures through [`EngineError`]. Variants map
//! one-to-one onto the failure classes the orchestrator and query path act
//! on: extraction failures are terminal for one document, transient provider
//! errors are retried, backend unavailability aborts the in-progress document
//! and surfaces as a run-level warning.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The declared source type has no extraction handler.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The source could not be parsed. Partial output is discarded.
    #[error("corrupt source: {0}")]
    CorruptSource(String),

    /// Extraction or chunking produced nothing to index.
    #[error("empty content")]
    EmptyContent,

    /// Retryable provider failure (timeout, rate limit, 5xx).
    #[error("embedding provider transient error: {0}")]
    ProviderTransient(String),

    /// Non-retryable provider failure (auth, bad request, malformed response).
    #[error("embedding provider fatal error: {0}")]
    ProviderFatal(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A storage or vector backend could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether a retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderTransient(_) | EngineError::BackendUnavailable(_)
        )
    }

    /// Stable machine-readable code, used in HTTP and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnsupportedFormat(_) => "unsupported_format",
            EngineError::CorruptSource(_) => "corrupt_source",
            EngineError::EmptyContent => "empty_content",
            EngineError::ProviderTransient(_) => "provider_transient_error",
            EngineError::ProviderFatal(_) => "provider_fatal_error",
            EngineError::DimensionMismatch { .. } => "dimension_mismatch",
            EngineError::InvalidParameter(_) => "invalid_parameter",
            EngineError::BackendUnavailable(_) => "backend_unavailable",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Storage(_) => "storage_error",
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidParameter(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        EngineError::Storage(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }
}

/// Maps a poisoned lock onto a storage error instead of panicking.
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Storage("in-memory store lock poisoned".to_string())
}
