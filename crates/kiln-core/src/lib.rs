//! # kiln-core
//!
//! Project state and sandbox orchestration for kiln.
//!
//! This crate keeps the project in a [`VirtualFileStore`], registers
//! generated artifacts in the entry file with the [`patch_entry`] patcher,
//! and runs the project inside a sandbox through the
//! [`SandboxLifecycleManager`]. Preview readiness reaches observers through
//! the [`ReadinessBroadcaster`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use kiln_core::{EntryConfig, LifecycleConfig, SandboxLifecycleManager, VirtualFileStore, Workspace};
//! use kiln_gen::GeneratedArtifact;
//! use kiln_runtime::{LocalRuntime, LocalRuntimeConfig};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(LocalRuntime::new(LocalRuntimeConfig::default()));
//! let store = Arc::new(Mutex::new(VirtualFileStore::new()));
//! let manager = SandboxLifecycleManager::new(runtime, store, LifecycleConfig::default());
//!
//! // Boot once; every observer sees the same address.
//! manager.acquire().await?;
//! let mut readiness = manager.subscribe();
//! if let Some(event) = readiness.wait_for_address().await {
//!     println!("preview at {} ({:?})", event.address.url, event.address.kind);
//! }
//!
//! let workspace = Workspace::new(manager.clone(), EntryConfig::default());
//! let artifact = GeneratedArtifact::new("export default function Hello() { return <p>hi</p>; }", "hello")
//!     .with_filename("Hello.tsx");
//! let report = workspace.apply_artifact(&artifact).await?;
//! println!("{:?}", report.entry);
//! # Ok(())
//! # }
//! ```

mod broadcast;
mod error;
mod lifecycle;
mod patcher;
mod seed;
mod store;
mod workspace;

pub use broadcast::{
    AddressKind, PreviewAddress, Readiness, ReadinessBroadcaster, ReadinessEvent,
    ReadinessSubscriber,
};
pub use error::{
    LifecycleError, LifecycleResult, StoreError, StoreResult, WorkspaceError, WorkspaceResult,
};
pub use lifecycle::{
    LifecycleConfig, LifecycleConfigBuilder, LifecycleStatus, SandboxInstance,
    SandboxLifecycleManager, SandboxState,
};
pub use patcher::{component_symbol, patch_entry, EntryDocument, PatchOutcome, Patched};
pub use seed::{ensure_seeded, seed_files, seed_store};
pub use store::{normalize_path, FileNode, NodeKind, VirtualFileStore};
pub use workspace::{
    ApplyReport, ArtifactPlacement, EntryConfig, MirrorStatus, Workspace, WriteReport,
    DEFAULT_ARTIFACT_FILENAME,
};
