//! Host-process sandbox engine.
//!
//! Each boot gets a fresh directory under the configured root. Mounting
//! writes the manifest to disk and processes run with that directory as
//! their working directory. Readiness is emitted once per process, after
//! its output names a port and the port accepts a TCP connection.

use crate::error::{Result, RuntimeError};
use crate::manifest::{validate_relative, ManifestItem, MountManifest};
use crate::process::{CommandSpec, ProcessHandle, ServerReady, OUTPUT_CHANNEL_CAPACITY};
use crate::ready::{extract_port, probe_port, LineScanner};
use crate::runtime::{BootedSandbox, SandboxRuntime, SandboxSession};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Read buffer size for process output pumps.
const READ_CHUNK: usize = 8 * 1024;

/// Configuration for [`LocalRuntime`].
#[derive(Debug, Clone)]
pub struct LocalRuntimeConfig {
    /// Directory under which per-boot sandbox directories are created.
    pub root_dir: PathBuf,
    /// Host used for readiness probes and preview URLs.
    pub probe_host: String,
    /// Delay between readiness probe attempts.
    pub probe_interval: Duration,
    /// How long to keep probing a port once it has been announced.
    pub probe_budget: Duration,
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("kiln"),
            probe_host: "localhost".to_string(),
            probe_interval: Duration::from_millis(250),
            probe_budget: Duration::from_secs(30),
        }
    }
}

impl LocalRuntimeConfig {
    /// Create a new config builder.
    pub fn builder() -> LocalRuntimeConfigBuilder {
        LocalRuntimeConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(RuntimeError::Boot("root_dir is required".into()));
        }
        if self.probe_host.is_empty() {
            return Err(RuntimeError::Boot("probe_host is required".into()));
        }
        if self.probe_interval.is_zero() {
            return Err(RuntimeError::Boot("probe_interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for LocalRuntimeConfig.
#[derive(Debug, Default)]
pub struct LocalRuntimeConfigBuilder {
    config: LocalRuntimeConfig,
}

impl LocalRuntimeConfigBuilder {
    /// Set the sandbox root directory.
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_dir = path.into();
        self
    }

    /// Set the readiness probe host.
    pub fn probe_host(mut self, host: impl Into<String>) -> Self {
        self.config.probe_host = host.into();
        self
    }

    /// Set the delay between probe attempts.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    /// Set the probe budget per announced port.
    pub fn probe_budget(mut self, budget: Duration) -> Self {
        self.config.probe_budget = budget;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<LocalRuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Sandbox engine backed by host processes in scratch directories.
#[derive(Debug, Clone)]
pub struct LocalRuntime {
    config: LocalRuntimeConfig,
}

impl LocalRuntime {
    /// Create a runtime with the given configuration.
    pub fn new(config: LocalRuntimeConfig) -> Self {
        tracing::info!(root = %config.root_dir.display(), "Creating local sandbox runtime");
        Self { config }
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &LocalRuntimeConfig {
        &self.config
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn boot(&self) -> Result<BootedSandbox> {
        let id = Uuid::new_v4().to_string();
        let root = self.config.root_dir.join(&id);
        tracing::info!(sandbox_id = %id, root = %root.display(), "Booting local sandbox");

        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            tracing::error!(sandbox_id = %id, error = %e, "Failed to create sandbox directory");
            RuntimeError::Boot(format!("failed to create {}: {e}", root.display()))
        })?;

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let session = LocalSession {
            id,
            root,
            config: self.config.clone(),
            ready_tx,
            closed: CancellationToken::new(),
        };

        Ok(BootedSandbox {
            session: Arc::new(session),
            server_ready: ready_rx,
        })
    }
}

/// A sandbox directory with its running processes.
pub struct LocalSession {
    id: String,
    root: PathBuf,
    config: LocalRuntimeConfig,
    ready_tx: mpsc::UnboundedSender<ServerReady>,
    closed: CancellationToken,
}

impl LocalSession {
    /// Directory the sandbox lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RuntimeError::SessionClosed);
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_relative(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl SandboxSession for LocalSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, manifest: &MountManifest) -> Result<()> {
        self.ensure_open()?;
        let items = manifest.items();
        tracing::debug!(sandbox_id = %self.id, files = manifest.file_count(), "Mounting manifest");
        for item in items {
            match item {
                ManifestItem::Directory(path) => {
                    tokio::fs::create_dir_all(self.resolve(&path)?).await?;
                }
                ManifestItem::File(path, contents) => {
                    tokio::fs::write(self.resolve(&path)?, contents).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        self.ensure_open()?;
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::trace!(sandbox_id = %self.id, path = %path, len = contents.len(), "Writing file");
        tokio::fs::write(&target, contents).await?;
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle> {
        self.ensure_open()?;
        tracing::debug!(sandbox_id = %self.id, command = %command, "Spawning process");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Spawn {
                program: command.program.clone(),
                reason: e.to_string(),
            })?;

        let kill = self.closed.child_token();

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, out_tx.clone(), scan_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, out_tx, scan_tx));
        }

        tokio::spawn(watch_for_server(
            scan_rx,
            self.ready_tx.clone(),
            self.config.clone(),
            kill.clone(),
        ));

        let (exit_tx, exit_rx) = oneshot::channel();
        let reaper_kill = kill.clone();
        let sandbox_id = self.id.clone();
        let program = command.program.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to wait for process");
                        -1
                    }
                },
                _ = reaper_kill.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to kill process");
                    }
                    -1
                }
            };
            // Stops the readiness watcher once the process is gone.
            reaper_kill.cancel();
            tracing::debug!(sandbox_id = %sandbox_id, program = %program, code, "Process exited");
            let _ = exit_tx.send(code);
        });

        Ok(ProcessHandle::new(exit_rx, out_rx, kill))
    }

    async fn teardown(&self) -> Result<()> {
        tracing::info!(sandbox_id = %self.id, "Tearing down local sandbox");
        // Every process kill switch is a child of this token.
        self.closed.cancel();
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to remove sandbox directory");
        }
        Ok(())
    }
}

/// Forward raw output chunks to the consumer and the readiness scanner.
async fn pump<R>(
    mut reader: R,
    out: mpsc::Sender<Bytes>,
    scan: mpsc::UnboundedSender<Bytes>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let _ = scan.send(chunk.clone());
                // A dropped consumer must not stall the scanner.
                if out.is_closed() {
                    continue;
                }
                let _ = out.send(chunk).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output pump stopped");
                break;
            }
        }
    }
}

/// Emit one [`ServerReady`] once a process announces a port that answers.
async fn watch_for_server(
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    ready_tx: mpsc::UnboundedSender<ServerReady>,
    config: LocalRuntimeConfig,
    kill: CancellationToken,
) {
    let mut scanner = LineScanner::default();
    while let Some(port) = next_announced_port(&mut chunks, &mut scanner).await {
        tracing::debug!(port, "Server announced port, probing");
        let accepted = probe_port(
            &config.probe_host,
            port,
            config.probe_interval,
            config.probe_budget,
            &kill,
        )
        .await;
        if accepted {
            let url = format!("http://{}:{port}", config.probe_host);
            tracing::info!(port, url = %url, "Server accepting connections");
            let _ = ready_tx.send(ServerReady { port, url });
            return;
        }
        if kill.is_cancelled() {
            return;
        }
    }
}

/// Next port named in the output, including an unterminated last line.
async fn next_announced_port(
    chunks: &mut mpsc::UnboundedReceiver<Bytes>,
    scanner: &mut LineScanner,
) -> Option<u16> {
    while let Some(chunk) = chunks.recv().await {
        if let Some(port) = scanner.push(&chunk).iter().find_map(|line| extract_port(line)) {
            return Some(port);
        }
    }
    scanner.finish().as_deref().and_then(extract_port)
}
