//! Scripted in-memory sandbox engine.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::{LifecycleConfig, SandboxLifecycleManager, VirtualFileStore};
use kiln_runtime::{
    BootedSandbox, CommandSpec, MountManifest, ProcessHandle, Result, RuntimeError,
    SandboxRuntime, SandboxSession, ServerReady,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

pub const INSTALL: &str = "install";
pub const DEV: &str = "dev";

pub struct FakeRuntime {
    pub boots: AtomicUsize,
    pub install_code: AtomicI32,
    /// Install processes vanish without reporting an exit code.
    pub lose_install: AtomicBool,
    pub boot_delay: Duration,
    pub sessions: StdMutex<Vec<Arc<FakeSession>>>,
}

impl FakeRuntime {
    pub fn new(install_code: i32) -> Self {
        Self {
            boots: AtomicUsize::new(0),
            install_code: AtomicI32::new(install_code),
            lose_install: AtomicBool::new(false),
            boot_delay: Duration::ZERO,
            sessions: StdMutex::new(Vec::new()),
        }
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn session(&self, index: usize) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn boot(&self) -> Result<BootedSandbox> {
        let n = self.boots.fetch_add(1, Ordering::SeqCst);
        if !self.boot_delay.is_zero() {
            tokio::time::sleep(self.boot_delay).await;
        }
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession {
            id: format!("fake-{n}"),
            install_code: self.install_code.load(Ordering::SeqCst),
            lose_install: self.lose_install.load(Ordering::SeqCst),
            ready_tx,
            files: StdMutex::new(BTreeMap::new()),
            spawned: StdMutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(BootedSandbox {
            session,
            server_ready: ready_rx,
        })
    }
}

pub struct FakeSession {
    id: String,
    install_code: i32,
    lose_install: bool,
    pub ready_tx: mpsc::UnboundedSender<ServerReady>,
    pub files: StdMutex<BTreeMap<String, String>>,
    pub spawned: StdMutex<Vec<String>>,
    pub torn_down: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl FakeSession {
    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn announce(&self, port: u16) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: format!("http://sandbox-{}:{port}", self.id),
        });
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, manifest: &MountManifest) -> Result<()> {
        let files = manifest.clone().into_files();
        self.files.lock().unwrap().extend(files);
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RuntimeError::SessionClosed);
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle> {
        self.spawned.lock().unwrap().push(command.to_string());
        let (exit_tx, exit_rx) = oneshot::channel();
        let (out_tx, out_rx) = mpsc::channel(8);
        let kill = CancellationToken::new();

        if command.program == INSTALL {
            let _ = out_tx.try_send(Bytes::from_static(b"added 3 packages\n"));
            if self.lose_install {
                drop(exit_tx);
            } else {
                let _ = exit_tx.send(self.install_code);
            }
        } else {
            let _ = out_tx.try_send(Bytes::from_static(b"  VITE ready\n"));
            let kill = kill.clone();
            tokio::spawn(async move {
                kill.cancelled().await;
                drop(out_tx);
                let _ = exit_tx.send(-1);
            });
        }
        Ok(ProcessHandle::new(exit_rx, out_rx, kill))
    }

    async fn teardown(&self) -> Result<()> {
        self.torn_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config(deadline: Duration) -> LifecycleConfig {
    LifecycleConfig::builder()
        .install_command(CommandSpec::new(INSTALL, Vec::<String>::new()))
        .dev_command(CommandSpec::new(DEV, Vec::<String>::new()))
        .readiness_deadline(deadline)
        .fallback("localhost", 3000)
        .build()
        .expect("valid lifecycle config")
}

pub fn manager(runtime: Arc<FakeRuntime>, deadline: Duration) -> SandboxLifecycleManager {
    let store = Arc::new(Mutex::new(VirtualFileStore::new()));
    SandboxLifecycleManager::new(runtime, store, config(deadline))
}
