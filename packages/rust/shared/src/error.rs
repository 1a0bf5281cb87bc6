//! Error types for cartograph.
//!
//! Library crates use [`CartographError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! [`AgentError`] is the job-level failure taxonomy: every provider or
//! runner failure is converted into one of its variants before it reaches
//! the dispatcher.

use std::path::PathBuf;

/// Top-level error type for all cartograph operations.
#[derive(Debug, thiserror::Error)]
pub enum CartographError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a provider call.
    #[error("network error: {0}")]
    Network(String),

    /// Payload or feed parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad delta, unknown agent, invalid entity id).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The requested entity (or job) is not known to the pipeline.
    #[error("not found: {entity_id}")]
    NotFound { entity_id: String },

    /// Provider construction or registry error.
    #[error("provider error: {0}")]
    Provider(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CartographError>;

impl CartographError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error for an entity or job id.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_id: id.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Job failure taxonomy
// ---------------------------------------------------------------------------

/// Outcome of a failed agent run, as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    /// Network, timeout, or rate-limit failure. Retried with backoff.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Malformed input or permanently unclassifiable entity. Dead-lettered
    /// immediately.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The target provider's circuit is open. Requeued without consuming
    /// an attempt.
    #[error("provider unavailable: {provider_id}")]
    ProviderUnavailable { provider_id: String },

    /// The job was cancelled before or during execution.
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Short label used in attempt history and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Recoverable(_) => "recoverable",
            Self::Fatal(_) => "fatal",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::Cancelled => "cancelled",
        }
    }
}
