//! Provider-level failures and their mapping onto the job taxonomy.

use cartograph_shared::AgentError;

/// A failed provider exchange.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The call or its polling loop exceeded the deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// HTTP 429.
    #[error("rate limited")]
    RateLimited,

    /// Connection, TLS, or body-read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 5xx.
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    /// HTTP 4xx other than 429, or a request the provider refuses to make.
    #[error("rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The provider answered with something that is not the expected payload.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// An asynchronous task was reported failed by the provider.
    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl ProviderError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => Self::RateLimited,
            500..=599 => Self::Server { status },
            _ => Self::Rejected {
                status,
                message: body.chars().take(200).collect(),
            },
        }
    }

    /// Whether the failure is worth retrying (and counts against the breaker).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited
                | Self::Transport(_)
                | Self::Server { .. }
                | Self::TaskFailed(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), &e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<ProviderError> for AgentError {
    fn from(e: ProviderError) -> Self {
        if e.is_recoverable() {
            AgentError::Recoverable(e.to_string())
        } else {
            AgentError::Fatal(e.to_string())
        }
    }
}
