//! # kiln-runtime
//!
//! Sandbox engine boundary for kiln.
//!
//! A sandbox engine boots isolated environments that expose a file system,
//! process spawning, and a readiness notification when a server inside the
//! sandbox starts accepting connections. Orchestration code talks to
//! engines only through [`SandboxRuntime`] and [`SandboxSession`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use kiln_runtime::{CommandSpec, LocalRuntime, LocalRuntimeConfig, MountManifest, SandboxRuntime};
//!
//! # async fn example() -> kiln_runtime::Result<()> {
//! let runtime = LocalRuntime::new(LocalRuntimeConfig::default());
//! let mut booted = runtime.boot().await?;
//!
//! let manifest = MountManifest::from_files([("index.html", "<h1>hi</h1>")])?;
//! booted.session.mount(&manifest).await?;
//!
//! let server = booted
//!     .session
//!     .spawn(&CommandSpec::new("python3", ["-m", "http.server", "8000"]))
//!     .await?;
//!
//! if let Some(ready) = booted.server_ready.recv().await {
//!     println!("preview at {}", ready.url);
//! }
//!
//! server.kill();
//! booted.session.teardown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Mount manifests**: nested `{file}` / `{directory}` trees with flat-path conversion
//! - **Process handles**: exit code, combined output stream, kill switch
//! - **Local engine**: host processes in scratch directories with port probing

mod error;
mod local;
mod manifest;
mod process;
mod ready;
mod runtime;

pub use error::{Result, RuntimeError};
pub use local::{LocalRuntime, LocalRuntimeConfig, LocalRuntimeConfigBuilder, LocalSession};
pub use manifest::{validate_relative, ManifestItem, MountEntry, MountManifest};
pub use process::{CommandSpec, ProcessHandle, ServerReady, OUTPUT_CHANNEL_CAPACITY};
pub use ready::{extract_port, LineScanner};
pub use runtime::{BootedSandbox, SandboxRuntime, SandboxSession};
