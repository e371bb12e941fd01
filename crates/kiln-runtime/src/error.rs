//! Error types for kiln-runtime.

use thiserror::Error;

/// Result type alias for kiln-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while talking to a sandbox engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The engine could not produce a sandbox
    #[error("failed to boot sandbox: {0}")]
    Boot(String),

    /// Path is absolute, empty, or escapes the sandbox root
    #[error("invalid sandbox path: {0:?}")]
    InvalidPath(String),

    /// A manifest path is used both as a file and as a directory
    #[error("manifest conflict at {0:?}: path is both a file and a directory")]
    ManifestConflict(String),

    /// The process could not be started
    #[error("failed to spawn {program:?}: {reason}")]
    Spawn { program: String, reason: String },

    /// The engine dropped the exit status before reporting it
    #[error("process exit status lost")]
    ProcessLost,

    /// The session has been torn down
    #[error("sandbox session closed")]
    SessionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
