//! # kiln-server
//!
//! HTTP service for kiln: browses and edits the project, streams
//! generations into it, and reports the sandbox preview.
//!
//! ## Configuration
//!
//! See [`KilnConfig::from_env`] for the environment variables.

pub mod config;
pub mod http;

pub use config::{ConfigError, KilnConfig};
pub use http::{build_router, ensure_booting, serve, ApiError, AppState};

use kiln_core::{seed_store, EntryConfig, SandboxLifecycleManager, Workspace};
use kiln_gen::GenerationClient;
use kiln_runtime::{LocalRuntime, SandboxRuntime};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Assemble the handler state over `runtime`, starting from the seed project.
pub fn build_state(
    config: &KilnConfig,
    runtime: Arc<dyn SandboxRuntime>,
) -> anyhow::Result<AppState> {
    let store = Arc::new(Mutex::new(seed_store()?));
    let manager = SandboxLifecycleManager::new(runtime, store, config.lifecycle_config()?);
    let workspace = Workspace::new(manager, EntryConfig::default());
    let generator = GenerationClient::new(config.generation_config()?)?;
    Ok(AppState::new(workspace, generator))
}

/// Assemble the handler state over the host-process engine.
pub fn build_local_state(config: &KilnConfig) -> anyhow::Result<AppState> {
    let runtime = Arc::new(LocalRuntime::new(config.runtime_config()?));
    build_state(config, runtime)
}
