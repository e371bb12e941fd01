//! Error types for kiln-gen.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln-gen operations.
pub type Result<T> = std::result::Result<T, GenerationError>;

/// Errors that end a generation request.
///
/// Malformed model output is not an error: it is recovered into a
/// diagnostic artifact instead.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Network or HTTP client failure
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("API returned {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, as text
        body: String,
    },

    /// The backend reported an error inside the event stream
    #[error("stream error: {0}")]
    Stream(String),

    /// The hard deadline elapsed before the stream ended
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request
    #[error("generation cancelled")]
    Cancelled,

    /// Invalid client configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl GenerationError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::Stream(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Cancelled | Self::Config(_) => false,
        }
    }
}
