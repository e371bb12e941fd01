//! Sandbox lifecycle management.
//!
//! One [`SandboxLifecycleManager`] owns at most one live sandbox. The boot
//! sequence runs `Idle → Booting → Mounting → Installing → Starting →
//! Ready`, with `Failed` reachable from every step. Concurrent
//! [`acquire`](SandboxLifecycleManager::acquire) calls share one in-flight
//! boot.
//!
//! Every boot is tagged with a generation. [`restart`](SandboxLifecycleManager::restart)
//! bumps it, so anything still running on behalf of the old sandbox can
//! no longer move state forward or publish an address.

use crate::broadcast::{
    PreviewAddress, Readiness, ReadinessBroadcaster, ReadinessEvent, ReadinessSubscriber,
};
use crate::error::{LifecycleError, LifecycleResult};
use crate::seed::ensure_seeded;
use crate::store::VirtualFileStore;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use kiln_gen::Utf8StreamDecoder;
use kiln_runtime::{CommandSpec, RuntimeError, SandboxRuntime, SandboxSession, ServerReady};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`SandboxLifecycleManager`].
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Dependency installation command. Must exit 0.
    ///
    /// Default: `npm install`
    pub install_command: CommandSpec,

    /// Long-running dev server command.
    ///
    /// Default: `npm run dev`
    pub dev_command: CommandSpec,

    /// How long to wait for a readiness notification before publishing
    /// the fallback address.
    ///
    /// Default: 30 seconds
    pub readiness_deadline: Duration,

    /// Host used for the fallback address.
    pub fallback_host: String,

    /// Port used for the fallback address.
    pub fallback_port: u16,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            install_command: CommandSpec::new("npm", ["install"]),
            dev_command: CommandSpec::new("npm", ["run", "dev"]),
            readiness_deadline: Duration::from_secs(30),
            fallback_host: "localhost".to_string(),
            fallback_port: 3000,
        }
    }
}

impl LifecycleConfig {
    /// Create a new config builder.
    pub fn builder() -> LifecycleConfigBuilder {
        LifecycleConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.install_command.program.is_empty() {
            return Err("install_command is required".into());
        }
        if self.dev_command.program.is_empty() {
            return Err("dev_command is required".into());
        }
        if self.readiness_deadline.is_zero() {
            return Err("readiness_deadline must be > 0".into());
        }
        if self.fallback_host.is_empty() {
            return Err("fallback_host is required".into());
        }
        Ok(())
    }

    /// Address published when the deadline passes unconfirmed.
    pub fn fallback_address(&self) -> PreviewAddress {
        PreviewAddress::fallback(
            format!("http://{}:{}", self.fallback_host, self.fallback_port),
            Some(self.fallback_port),
        )
    }
}

/// Builder for LifecycleConfig.
#[derive(Debug, Default)]
pub struct LifecycleConfigBuilder {
    config: LifecycleConfig,
}

impl LifecycleConfigBuilder {
    /// Set the install command.
    pub fn install_command(mut self, command: CommandSpec) -> Self {
        self.config.install_command = command;
        self
    }

    /// Set the dev server command.
    pub fn dev_command(mut self, command: CommandSpec) -> Self {
        self.config.dev_command = command;
        self
    }

    /// Set the readiness deadline.
    pub fn readiness_deadline(mut self, deadline: Duration) -> Self {
        self.config.readiness_deadline = deadline;
        self
    }

    /// Set the fallback host and port.
    pub fn fallback(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.fallback_host = host.into();
        self.config.fallback_port = port;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<LifecycleConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle phase of the managed sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Idle,
    Booting,
    Mounting,
    Installing,
    Starting,
    Ready,
    Failed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Booting => "Booting",
            Self::Mounting => "Mounting",
            Self::Installing => "Installing",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the manager for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleStatus {
    pub generation: u64,
    pub state: SandboxState,
    pub sandbox_id: Option<String>,
    pub address: Option<PreviewAddress>,
    pub last_error: Option<String>,
}

/// A booted sandbox belonging to one generation.
pub struct SandboxInstance {
    generation: u64,
    session: Arc<dyn SandboxSession>,
    mounted: AtomicBool,
    server: OnceLock<CancellationToken>,
}

impl SandboxInstance {
    fn new(generation: u64, session: Arc<dyn SandboxSession>) -> Self {
        Self {
            generation,
            session,
            mounted: AtomicBool::new(false),
            server: OnceLock::new(),
        }
    }

    /// Generation this sandbox was booted for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Engine-assigned sandbox id.
    pub fn id(&self) -> &str {
        self.session.id()
    }

    /// Whether the project has been mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Write one file into the sandbox file system.
    pub async fn write_file(&self, path: &str, contents: &str) -> Result<(), RuntimeError> {
        self.session.write_file(path, contents).await
    }

    async fn terminate(&self) {
        if let Some(server) = self.server.get() {
            server.cancel();
        }
        if let Err(e) = self.session.teardown().await {
            tracing::warn!(sandbox_id = %self.id(), error = %e, "Sandbox teardown failed");
        }
    }
}

impl fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("id", &self.id())
            .field("generation", &self.generation)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

/// A booted sandbox not yet recorded in the manager's state.
///
/// Dropping it armed, as happens when the boot task is aborted while
/// waiting for the state lock, tears the sandbox down in the background.
struct Unregistered {
    instance: Arc<SandboxInstance>,
    armed: bool,
}

impl Unregistered {
    fn new(instance: Arc<SandboxInstance>) -> Self {
        Self {
            instance,
            armed: true,
        }
    }

    fn disarm(mut self) -> Arc<SandboxInstance> {
        self.armed = false;
        self.instance.clone()
    }
}

impl Drop for Unregistered {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let instance = self.instance.clone();
        tracing::warn!(
            sandbox_id = %instance.id(),
            generation = instance.generation,
            "Boot abandoned before registration, tearing sandbox down"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { instance.terminate().await });
            }
            Err(_) => {
                tracing::error!(sandbox_id = %instance.id(), "No runtime left to tear sandbox down");
            }
        }
    }
}

type BootResult = LifecycleResult<Arc<SandboxInstance>>;
type BootFuture = Shared<BoxFuture<'static, BootResult>>;

struct State {
    generation: u64,
    phase: SandboxState,
    boot: Option<BootFuture>,
    boot_task: Option<AbortHandle>,
    instance: Option<Arc<SandboxInstance>>,
    address: Option<PreviewAddress>,
    last_error: Option<String>,
    tasks: Vec<AbortHandle>,
}

impl State {
    fn new() -> Self {
        Self {
            generation: 0,
            phase: SandboxState::Idle,
            boot: None,
            boot_task: None,
            instance: None,
            address: None,
            last_error: None,
            tasks: Vec::new(),
        }
    }

    /// Drop everything belonging to the current generation.
    fn clear(&mut self) -> Option<Arc<SandboxInstance>> {
        if let Some(task) = self.boot_task.take() {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.boot = None;
        self.phase = SandboxState::Idle;
        self.address = None;
        self.last_error = None;
        self.instance.take()
    }
}

struct Inner {
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<Mutex<VirtualFileStore>>,
    config: LifecycleConfig,
    broadcaster: ReadinessBroadcaster,
    state: Mutex<State>,
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the single sandbox of a process.
///
/// Cheap to clone; clones share the same sandbox.
#[derive(Clone)]
pub struct SandboxLifecycleManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for SandboxLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLifecycleManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl SandboxLifecycleManager {
    /// Create a manager over `runtime`, mounting projects from `store`.
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<Mutex<VirtualFileStore>>,
        config: LifecycleConfig,
    ) -> Self {
        tracing::info!(
            install = %config.install_command,
            dev = %config.dev_command,
            readiness_deadline_secs = config.readiness_deadline.as_secs(),
            "Creating sandbox lifecycle manager"
        );
        Self {
            inner: Arc::new(Inner {
                runtime,
                store,
                config,
                broadcaster: ReadinessBroadcaster::new(),
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// The project store mounted into each sandbox.
    pub fn store(&self) -> &Arc<Mutex<VirtualFileStore>> {
        &self.inner.store
    }

    /// The readiness channel.
    pub fn broadcaster(&self) -> &ReadinessBroadcaster {
        &self.inner.broadcaster
    }

    /// Attach a readiness observer.
    pub fn subscribe(&self) -> ReadinessSubscriber {
        self.inner.broadcaster.subscribe()
    }

    /// Return the current sandbox, booting one if there is none.
    ///
    /// Resolves once the dev server has been spawned; readiness is
    /// observed through [`subscribe`](Self::subscribe). Every caller
    /// waiting on the same boot gets the same result. A failed boot is
    /// not retried until [`restart`](Self::restart).
    pub async fn acquire(&self) -> LifecycleResult<Arc<SandboxInstance>> {
        let boot = {
            let mut state = self.inner.state.lock().await;
            match state.boot.clone() {
                Some(boot) => boot,
                None => self.start_boot(&mut state),
            }
        };
        boot.await
    }

    fn start_boot(&self, state: &mut State) -> BootFuture {
        let generation = state.generation;
        state.phase = SandboxState::Booting;
        tracing::info!(generation, "Starting sandbox boot");

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = inner.clone().boot(generation).await;
            if let Err(err) = &result {
                inner.fail(generation, err).await;
            }
            let _ = tx.send(result);
        });
        state.boot_task = Some(task.abort_handle());

        let boot = async move {
            rx.await
                .unwrap_or(Err(LifecycleError::Superseded { generation }))
        }
        .boxed()
        .shared();
        state.boot = Some(boot.clone());
        boot
    }

    /// Discard the current sandbox and move to a new generation.
    ///
    /// Aborts any in-flight boot, kills the dev server, tears the sandbox
    /// down, and publishes `Pending` for the new generation. The next
    /// [`acquire`](Self::acquire) boots from scratch.
    pub async fn restart(&self) -> u64 {
        let (old, generation) = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            let old = state.clear();
            self.inner.broadcaster.publish(Readiness::Pending {
                generation: state.generation,
            });
            (old, state.generation)
        };
        tracing::info!(generation, "Sandbox restarted");
        if let Some(instance) = old {
            instance.terminate().await;
        }
        generation
    }

    /// Tear down the current sandbox at process exit.
    pub async fn shutdown(&self) {
        let old = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            state.clear()
        };
        if let Some(instance) = old {
            tracing::info!(sandbox_id = %instance.id(), "Shutting down sandbox");
            instance.terminate().await;
        }
    }

    /// Accept a readiness notification for `generation`.
    ///
    /// Returns `false` if the notification was dropped: it belongs to a
    /// superseded generation, or no dev server has been started for it.
    pub async fn report_ready(&self, generation: u64, ready: ServerReady) -> bool {
        self.inner.accept_ready(generation, ready).await
    }

    /// Current generation.
    pub async fn generation(&self) -> u64 {
        self.inner.state.lock().await.generation
    }

    /// The live sandbox, if one has been registered.
    pub async fn instance(&self) -> Option<Arc<SandboxInstance>> {
        self.inner.state.lock().await.instance.clone()
    }

    /// Snapshot for display.
    pub async fn status(&self) -> LifecycleStatus {
        let state = self.inner.state.lock().await;
        LifecycleStatus {
            generation: state.generation,
            state: state.phase,
            sandbox_id: state.instance.as_ref().map(|i| i.id().to_string()),
            address: state.address.clone(),
            last_error: state.last_error.clone(),
        }
    }
}

impl Inner {
    /// Move to `phase` if `generation` is still current.
    async fn transition(&self, generation: u64, phase: SandboxState) -> LifecycleResult<()> {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return Err(LifecycleError::Superseded { generation });
        }
        tracing::info!(generation, from = %state.phase, to = %phase, "Sandbox state change");
        state.phase = phase;
        Ok(())
    }

    /// Keep a background task so restart can abort it.
    async fn track(&self, generation: u64, task: AbortHandle) {
        let mut state = self.state.lock().await;
        if state.generation == generation {
            state.tasks.push(task);
        } else {
            task.abort();
        }
    }

    async fn boot(self: Arc<Self>, generation: u64) -> BootResult {
        let start = std::time::Instant::now();

        let booted = self.runtime.boot().await.map_err(|e| {
            tracing::error!(generation, error = %e, "Sandbox boot failed");
            LifecycleError::BootFailure(e.to_string())
        })?;
        let unregistered = Unregistered::new(Arc::new(SandboxInstance::new(generation, booted.session)));
        let instance = {
            let mut state = self.state.lock().await;
            let instance = unregistered.disarm();
            if state.generation != generation {
                drop(state);
                instance.terminate().await;
                return Err(LifecycleError::Superseded { generation });
            }
            state.instance = Some(instance.clone());
            instance
        };
        tracing::info!(generation, sandbox_id = %instance.id(), "Sandbox booted");

        self.transition(generation, SandboxState::Mounting).await?;
        self.mount(&instance).await?;

        self.transition(generation, SandboxState::Installing).await?;
        let mut install = instance
            .session
            .spawn(&self.config.install_command)
            .await
            .map_err(|e| LifecycleError::SpawnFailure(e.to_string()))?;
        if let Some(output) = install.take_output() {
            let task = tokio::spawn(log_output(output, "install", generation));
            self.track(generation, task.abort_handle()).await;
        }
        let code = install.wait().await.map_err(|e| {
            tracing::error!(generation, error = %e, command = %self.config.install_command, "Lost track of dependency install");
            LifecycleError::SpawnFailure(e.to_string())
        })?;
        if code != 0 {
            tracing::error!(generation, code, command = %self.config.install_command, "Dependency install failed");
            return Err(LifecycleError::InstallFailure { code });
        }
        tracing::info!(generation, "Dependencies installed");

        self.transition(generation, SandboxState::Starting).await?;
        let mut server = instance
            .session
            .spawn(&self.config.dev_command)
            .await
            .map_err(|e| LifecycleError::SpawnFailure(e.to_string()))?;
        let _ = instance.server.set(server.kill_switch());
        if let Some(output) = server.take_output() {
            let task = tokio::spawn(log_output(output, "dev", generation));
            self.track(generation, task.abort_handle()).await;
        }
        let exit = tokio::spawn(async move {
            match server.wait().await {
                Ok(code) => tracing::warn!(generation, code, "Dev server exited"),
                Err(e) => tracing::warn!(generation, error = %e, "Dev server lost"),
            }
        });
        self.track(generation, exit.abort_handle()).await;

        let watcher = tokio::spawn(self.clone().watch_readiness(generation, booted.server_ready));
        self.track(generation, watcher.abort_handle()).await;

        tracing::info!(
            generation,
            sandbox_id = %instance.id(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dev server started"
        );
        Ok(instance)
    }

    /// Mount the store into the sandbox, seeding an empty store first.
    ///
    /// Holds the store lock until the sandbox is marked mounted, so no
    /// write can land between the snapshot and the mirror switch.
    async fn mount(&self, instance: &SandboxInstance) -> LifecycleResult<()> {
        let mut store = self.store.lock().await;
        ensure_seeded(&mut store).map_err(|e| LifecycleError::MountFailure(e.to_string()))?;
        let manifest = store
            .to_manifest()
            .map_err(|e| LifecycleError::MountFailure(e.to_string()))?;
        instance.session.mount(&manifest).await.map_err(|e| {
            tracing::error!(sandbox_id = %instance.id(), error = %e, "Mount failed");
            LifecycleError::MountFailure(e.to_string())
        })?;
        instance.mounted.store(true, Ordering::Release);
        tracing::debug!(sandbox_id = %instance.id(), files = manifest.file_count(), "Project mounted");
        Ok(())
    }

    async fn fail(&self, generation: u64, err: &LifecycleError) {
        if matches!(err, LifecycleError::Superseded { .. }) {
            tracing::debug!(generation, "Boot superseded");
            return;
        }
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        state.phase = SandboxState::Failed;
        state.last_error = Some(err.to_string());
        self.broadcaster.publish(Readiness::Failed {
            generation,
            error: err.to_string(),
        });
    }

    /// Wait for the engine's readiness signal, falling back at the deadline.
    ///
    /// Keeps listening after the fallback so a late confirmed signal can
    /// replace it.
    async fn watch_readiness(
        self: Arc<Self>,
        generation: u64,
        mut ready_rx: mpsc::UnboundedReceiver<ServerReady>,
    ) {
        let deadline = tokio::time::sleep(self.config.readiness_deadline);
        tokio::pin!(deadline);
        let mut confirmed = false;
        let mut fallback_sent = false;
        let mut closed = false;

        loop {
            tokio::select! {
                ready = ready_rx.recv(), if !closed => match ready {
                    Some(ready) => {
                        if self.accept_ready(generation, ready).await {
                            confirmed = true;
                        }
                    }
                    None => closed = true,
                },
                _ = &mut deadline, if !confirmed && !fallback_sent => {
                    fallback_sent = true;
                    self.publish_fallback(generation).await;
                }
                else => break,
            }
        }
        tracing::debug!(generation, "Readiness watcher finished");
    }

    async fn accept_ready(&self, generation: u64, ready: ServerReady) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            tracing::warn!(
                generation,
                current = state.generation,
                url = %ready.url,
                "Dropping readiness from superseded sandbox"
            );
            return false;
        }
        if state.instance.is_none()
            || !matches!(state.phase, SandboxState::Starting | SandboxState::Ready)
        {
            tracing::warn!(
                generation,
                state = %state.phase,
                url = %ready.url,
                "Dropping readiness with no running dev server"
            );
            return false;
        }
        let address = PreviewAddress::confirmed(ready.url, ready.port);
        tracing::info!(generation, url = %address.url, port = ready.port, "Preview ready");
        state.phase = SandboxState::Ready;
        state.address = Some(address.clone());
        self.broadcaster
            .publish(Readiness::Ready(ReadinessEvent::new(address, generation)))
    }

    async fn publish_fallback(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        if state.address.as_ref().is_some_and(PreviewAddress::is_confirmed) {
            return;
        }
        let address = self.config.fallback_address();
        tracing::warn!(
            generation,
            url = %address.url,
            deadline_secs = self.config.readiness_deadline.as_secs(),
            "No readiness signal before deadline, publishing fallback address"
        );
        state.phase = SandboxState::Ready;
        state.address = Some(address.clone());
        self.broadcaster
            .publish(Readiness::Ready(ReadinessEvent::new(address, generation)));
    }
}

/// Log process output line by line.
async fn log_output(mut output: mpsc::Receiver<Bytes>, label: &'static str, generation: u64) {
    let mut decoder = Utf8StreamDecoder::new();
    let mut partial = String::new();
    while let Some(chunk) = output.recv().await {
        partial.push_str(&decoder.decode(&chunk));
        while let Some(pos) = partial.find('\n') {
            let line: String = partial.drain(..=pos).collect();
            let line = line.trim_end();
            if !line.is_empty() {
                tracing::info!(process = label, generation, "{line}");
            }
        }
    }
    partial.push_str(&decoder.finish());
    let rest = partial.trim_end();
    if !rest.is_empty() {
        tracing::info!(process = label, generation, "{rest}");
    }
}
