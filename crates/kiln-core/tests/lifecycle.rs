mod common;

use common::FakeRuntime;
use kiln_core::{AddressKind, LifecycleError, Readiness, SandboxState};
use kiln_runtime::ServerReady;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

const DEADLINE: Duration = Duration::from_secs(30);

fn stale_ready() -> ServerReady {
    ServerReady {
        port: 4000,
        url: "http://stale:4000".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_boots_once() {
    let runtime = Arc::new(FakeRuntime::new(0).with_boot_delay(Duration::from_millis(100)));
    let manager = common::manager(runtime.clone(), DEADLINE);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    assert_eq!(runtime.boots(), 1);
    let instances: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap().expect("boot should succeed"))
        .collect();
    assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));

    let status = manager.status().await;
    assert_eq!(status.state, SandboxState::Starting);
    assert_eq!(status.generation, 0);
    assert_eq!(status.sandbox_id.as_deref(), Some("fake-0"));

    // Acquiring again reuses the live sandbox.
    let again = manager.acquire().await.unwrap();
    assert!(Arc::ptr_eq(&again, &instances[0]));
    assert_eq!(runtime.boots(), 1);
}

#[tokio::test]
async fn test_boot_mounts_seed_then_installs_then_starts() {
    let runtime = Arc::new(FakeRuntime::new(0));
    let manager = common::manager(runtime.clone(), DEADLINE);

    let instance = manager.acquire().await.unwrap();
    assert!(instance.is_mounted());

    let session = runtime.session(0);
    assert!(session.file("src/App.tsx").is_some());
    assert!(session.file("package.json").is_some());
    assert_eq!(session.spawned(), vec![common::INSTALL, common::DEV]);
    assert_eq!(manager.store().lock().await.len(), 7);
}

#[tokio::test]
async fn test_install_failure_is_terminal_until_restart() {
    let runtime = Arc::new(FakeRuntime::new(1));
    let manager = common::manager(runtime.clone(), DEADLINE);

    let err = manager.acquire().await.unwrap_err();
    assert_eq!(err, LifecycleError::InstallFailure { code: 1 });

    let status = manager.status().await;
    assert_eq!(status.state, SandboxState::Failed);
    assert_eq!(
        status.last_error.as_deref(),
        Some("dependency install exited with code 1")
    );
    assert!(matches!(
        manager.broadcaster().current(),
        Readiness::Failed { generation: 0, .. }
    ));

    // No automatic retry.
    assert_eq!(
        manager.acquire().await.unwrap_err(),
        LifecycleError::InstallFailure { code: 1 }
    );
    assert_eq!(runtime.boots(), 1);
    assert_eq!(runtime.session(0).spawned(), vec![common::INSTALL]);

    runtime.install_code.store(0, Ordering::SeqCst);
    assert_eq!(manager.restart().await, 1);
    assert!(runtime.session(0).is_torn_down());

    let instance = manager.acquire().await.unwrap();
    assert_eq!(instance.generation(), 1);
    assert_eq!(runtime.boots(), 2);
    assert_eq!(manager.status().await.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_lost_install_process_fails_boot() {
    let runtime = Arc::new(FakeRuntime::new(0));
    runtime.lose_install.store(true, Ordering::SeqCst);
    let manager = common::manager(runtime.clone(), DEADLINE);

    let err = manager.acquire().await.unwrap_err();
    assert!(matches!(err, LifecycleError::SpawnFailure(_)), "got {err:?}");

    let status = manager.status().await;
    assert_eq!(status.state, SandboxState::Failed);
    assert!(status.last_error.is_some());
    assert_eq!(runtime.session(0).spawned(), vec![common::INSTALL]);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_without_dev_server_is_dropped() {
    let runtime = Arc::new(FakeRuntime::new(0));
    let manager = common::manager(runtime.clone(), DEADLINE);

    // Nothing has booted yet.
    assert!(!manager.report_ready(0, stale_ready()).await);
    let status = manager.status().await;
    assert_eq!(status.state, SandboxState::Idle);
    assert_eq!(status.address, None);
    assert!(matches!(
        manager.broadcaster().current(),
        Readiness::Pending { generation: 0 }
    ));
    assert_eq!(runtime.boots(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_after_failed_install_is_dropped() {
    let runtime = Arc::new(FakeRuntime::new(1));
    let manager = common::manager(runtime.clone(), DEADLINE);
    manager.acquire().await.unwrap_err();

    assert!(!manager.report_ready(0, stale_ready()).await);
    let status = manager.status().await;
    assert_eq!(status.state, SandboxState::Failed);
    assert_eq!(status.address, None);
    assert_eq!(
        status.last_error.as_deref(),
        Some("dependency install exited with code 1")
    );
    assert!(matches!(
        manager.broadcaster().current(),
        Readiness::Failed { generation: 0, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_readiness_before_deadline() {
    let runtime = Arc::new(FakeRuntime::new(0));
    let manager = common::manager(runtime.clone(), DEADLINE);
    manager.acquire().await.unwrap();

    runtime.session(0).announce(5173);
    let mut subscriber = manager.subscribe();
    let event = subscriber.wait_for_address().await.unwrap();
    assert_eq!(event.address.kind, AddressKind::Confirmed);
    assert_eq!(event.address.port, Some(5173));
    assert_eq!(event.generation, 0);

    // The deadline passing later does not downgrade the address.
    tokio::time::sleep(DEADLINE * 2).await;
    let current = manager.broadcaster().current();
    assert!(current.address().unwrap().is_confirmed());
    assert_eq!(manager.status().await.state, SandboxState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_then_confirmed_supersedes() {
    let runtime = Arc::new(FakeRuntime::new(0));
    let manager = common::manager(runtime.clone(), DEADLINE);

    let started = Instant::now();
    manager.acquire().await.unwrap();
    let mut subscriber = manager.subscribe();

    let event = subscriber.wait_for_address().await.unwrap();
    assert_eq!(event.address.kind, AddressKind::Fallback);
    assert_eq!(event.address.url, "http://localhost:3000");
    assert!(started.elapsed() >= DEADLINE);

    let status = manager.status().await;
    assert_eq!(status.state, SandboxState::Ready);
    assert_eq!(status.address.unwrap().kind, AddressKind::Fallback);

    runtime.session(0).announce(5173);
    let next = subscriber.next().await.unwrap();
    let address = next.address().expect("ready");
    assert!(address.is_confirmed());
    assert_eq!(address.url, "http://sandbox-fake-0:5173");

    // An event from a superseded generation is discarded.
    manager.restart().await;
    assert!(!manager.report_ready(0, stale_ready()).await);
    assert_eq!(
        manager.broadcaster().current(),
        Readiness::Pending { generation: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_during_boot_blocks_late_readiness() {
    let runtime = Arc::new(FakeRuntime::new(0).with_boot_delay(Duration::from_secs(10)));
    let manager = common::manager(runtime.clone(), DEADLINE);

    let booting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(runtime.boots(), 1);
    assert_eq!(manager.status().await.state, SandboxState::Booting);

    assert_eq!(manager.restart().await, 1);
    let result = booting.await.unwrap();
    assert_eq!(
        result.unwrap_err(),
        LifecycleError::Superseded { generation: 0 }
    );

    let mut subscriber = manager.subscribe();
    assert_eq!(
        subscriber.next().await,
        Some(Readiness::Pending { generation: 1 })
    );
    assert!(!manager.report_ready(0, stale_ready()).await);
    assert!(timeout(DEADLINE * 4, subscriber.next()).await.is_err());
    assert_eq!(runtime.session_count(), 0);
    assert_eq!(manager.status().await.state, SandboxState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_start_silences_old_sandbox() {
    let runtime = Arc::new(FakeRuntime::new(0));
    let manager = common::manager(runtime.clone(), DEADLINE);
    manager.acquire().await.unwrap();

    let old = runtime.session(0);
    manager.restart().await;
    assert!(old.is_torn_down());

    old.announce(3000);
    let mut subscriber = manager.subscribe();
    assert_eq!(
        subscriber.next().await,
        Some(Readiness::Pending { generation: 1 })
    );
    // Neither the old signal nor the old fallback timer gets through.
    assert!(timeout(DEADLINE * 4, subscriber.next()).await.is_err());

    let status = manager.status().await;
    assert_eq!(status.state, SandboxState::Idle);
    assert_eq!(status.address, None);
    assert!(manager.instance().await.is_none());
}

#[tokio::test]
async fn test_shutdown_tears_down() {
    let runtime = Arc::new(FakeRuntime::new(0));
    let manager = common::manager(runtime.clone(), DEADLINE);
    manager.acquire().await.unwrap();

    manager.shutdown().await;
    assert!(runtime.session(0).is_torn_down());
    assert!(manager.instance().await.is_none());
}
