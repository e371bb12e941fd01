//! Error types for kiln-core.

use thiserror::Error;

/// Errors from the virtual file store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Path is empty or escapes the project root
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// The write would make a path both a file and a directory
    #[error("path {path:?} conflicts with existing file {existing:?}")]
    Conflict {
        /// Normalized path being written
        path: String,
        /// Stored path it collides with
        existing: String,
    },
}

/// Errors from the sandbox lifecycle.
///
/// `Clone` so one memoized boot outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The sandbox engine could not start
    #[error("sandbox boot failed: {0}")]
    BootFailure(String),

    /// The project could not be mounted into the sandbox
    #[error("mount failed: {0}")]
    MountFailure(String),

    /// Dependency installation exited non-zero
    #[error("dependency install exited with code {code}")]
    InstallFailure {
        /// Exit code of the install command
        code: i32,
    },

    /// A sandbox process could not be started
    #[error("failed to spawn process: {0}")]
    SpawnFailure(String),

    /// The boot was cancelled by a restart
    #[error("boot superseded by restart (generation {generation})")]
    Superseded {
        /// Generation of the cancelled boot
        generation: u64,
    },
}

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// File store rejected the write
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The artifact file name cannot become a component symbol
    #[error("invalid artifact file name: {0:?}")]
    InvalidFilename(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Result type alias for workspace operations.
pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;
