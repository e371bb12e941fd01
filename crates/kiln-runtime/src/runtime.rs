//! Engine traits - the seam between orchestration and a concrete sandbox.

use crate::error::Result;
use crate::manifest::MountManifest;
use crate::process::{CommandSpec, ProcessHandle, ServerReady};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something that can boot isolated sandboxes.
#[async_trait]
pub trait SandboxRuntime: Send + Sync + 'static {
    /// Boot a fresh sandbox.
    async fn boot(&self) -> Result<BootedSandbox>;
}

/// A live sandbox: a filesystem plus the ability to spawn processes.
#[async_trait]
pub trait SandboxSession: Send + Sync + 'static {
    /// Engine-assigned identifier, used for logging.
    fn id(&self) -> &str;

    /// Mount a file tree at the sandbox root.
    async fn mount(&self, manifest: &MountManifest) -> Result<()>;

    /// Write one file, creating parent directories as needed.
    async fn write_file(&self, path: &str, contents: &str) -> Result<()>;

    /// Spawn a process in the sandbox root.
    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle>;

    /// Kill every process and release the sandbox.
    async fn teardown(&self) -> Result<()>;
}

/// The result of a successful boot.
///
/// `server_ready` yields one [`ServerReady`] per server that starts
/// accepting connections inside this sandbox.
pub struct BootedSandbox {
    /// The live session.
    pub session: Arc<dyn SandboxSession>,
    /// Readiness notifications emitted by the engine.
    pub server_ready: mpsc::UnboundedReceiver<ServerReady>,
}

impl std::fmt::Debug for BootedSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootedSandbox")
            .field("session", &self.session.id())
            .finish_non_exhaustive()
    }
}
