mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeRuntime, manager_config, spec};
use mcp_runner::container::ContainerRuntimeApi;
use mcp_runner::session::{
    SESSION_ID_PREFIX, SessionError, SessionLookup, SessionManager, SessionStatus,
};
use mcp_runner_protocol::CloseReason;

fn manager(runtime: &Arc<FakeRuntime>, retention: Duration) -> Arc<SessionManager> {
    let api: Arc<dyn ContainerRuntimeApi> = runtime.clone();
    let mut config = manager_config();
    config.stopped_retention = retention;
    SessionManager::new(api, config)
}

async fn wait_for_stopped_record(manager: &SessionManager, id: &str) {
    for _ in 0..500 {
        let infos = manager.list_sessions().await;
        if infos
            .iter()
            .any(|info| info.id == id && info.stopped_at.is_some())
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never marked stopped");
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, Duration::from_secs(300));

    let result = manager.get_session("ses_missing").await;
    assert!(matches!(result, Err(SessionError::NotFound(id)) if id == "ses_missing"));
}

#[tokio::test]
async fn test_create_and_lookup_active() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, Duration::from_secs(300));

    let session = manager.create_session(spec()).await;
    assert!(session.id().starts_with(SESSION_ID_PREFIX));

    match manager.get_session(session.id()).await.unwrap() {
        SessionLookup::Active { info, session: found } => {
            assert_eq!(info.status, SessionStatus::Active);
            assert_eq!(info.container_name, session.container().name());
            assert_eq!(found.id(), session.id());
        }
        SessionLookup::Stopped { .. } => panic!("expected active session"),
    }
    assert_eq!(manager.active_count().await, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_stopped_session_is_distinct_from_unknown() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, Duration::from_secs(300));

    let session = manager.create_session(spec()).await;
    session.container().wait_for_handle().await.unwrap();
    manager.stop_session(session.id()).await.unwrap();

    match manager.get_session(session.id()).await.unwrap() {
        SessionLookup::Stopped { info } => {
            assert_eq!(info.status, SessionStatus::Stopped);
            assert_eq!(info.stop_reason, Some(CloseReason::ServerStopped));
        }
        SessionLookup::Active { .. } => panic!("expected stopped session"),
    }
    assert_eq!(manager.active_count().await, 0);

    // Stopping again is not an error.
    manager.stop_session(session.id()).await.unwrap();
    assert_eq!(runtime.stop_count(), 1);
}

#[tokio::test]
async fn test_sweep_removes_expired_stopped_records() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, Duration::ZERO);

    let stopped = manager.create_session(spec()).await;
    let active = manager.create_session(spec()).await;
    stopped.stop().await;
    wait_for_stopped_record(&manager, stopped.id()).await;

    assert_eq!(manager.sweep_stopped().await, 1);
    assert!(matches!(
        manager.get_session(stopped.id()).await,
        Err(SessionError::NotFound(_))
    ));
    assert!(matches!(
        manager.get_session(active.id()).await,
        Ok(SessionLookup::Active { .. })
    ));
    assert_eq!(manager.sweep_stopped().await, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sweep_keeps_records_within_retention() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, Duration::from_secs(300));

    let session = manager.create_session(spec()).await;
    session.stop().await;
    wait_for_stopped_record(&manager, session.id()).await;

    assert_eq!(manager.sweep_stopped().await, 0);
    assert!(matches!(
        manager.get_session(session.id()).await,
        Ok(SessionLookup::Stopped { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_stops_sessions_and_gc_loop() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, Duration::from_secs(300));

    let a = manager.create_session(spec()).await;
    let b = manager.create_session(spec()).await;
    let gc = tokio::spawn(Arc::clone(&manager).gc_loop());
    tokio::task::yield_now().await;

    manager.shutdown().await;

    assert!(a.is_stopped());
    assert!(b.is_stopped());
    assert_eq!(manager.active_count().await, 0);
    tokio::time::timeout(Duration::from_secs(5), gc)
        .await
        .expect("gc loop did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gc_loop_sweeps_on_worker_threads() {
    let runtime = FakeRuntime::new();
    let api: Arc<dyn ContainerRuntimeApi> = runtime.clone();
    let mut config = manager_config();
    config.gc_interval = Duration::from_millis(20);
    config.stopped_retention = Duration::ZERO;
    let manager = SessionManager::new(api, config);

    let gc = tokio::spawn(Arc::clone(&manager).gc_loop());

    let session = manager.create_session(spec()).await;
    session.stop().await;

    let mut swept = false;
    for _ in 0..250 {
        if matches!(
            manager.get_session(session.id()).await,
            Err(SessionError::NotFound(_))
        ) {
            swept = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(swept, "stopped record was never swept");

    manager.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), gc)
        .await
        .expect("gc loop did not stop")
        .unwrap();
}
