//! Backend process lifecycle against fake `aoide-websrv` shell scripts.
//!
//! The scripts announce a scripted endpoint on stdout; requests go to an
//! in-memory backend through [`common::ScriptedConnector`].

#![cfg(unix)]

mod common;

use aoide_link_core::collection::CollectionsChanged;
use aoide_link_core::config::{MemorySettingsStore, ServiceConfig, Settings, SettingsStore};
use aoide_link_core::error::{GatewayError, LaunchError};
use aoide_link_core::query::{Pagination, TrackQuery};
use aoide_link_core::result_cache::{CacheState, PaginatedResultCache, TrackRow};
use aoide_link_core::supervisor::{
    LaunchPaths, Lifecycle, ProcessSupervisor, ServiceProcessState, SupervisorEvent,
};
use aoide_link_core::task::TaskFailure;
use aoide_link_core::transport::{Connector, HttpConnector};
use aoide_link_core::{ConnectionState, Subsystem, SubsystemEvent};
use common::fake_backend::{
    EXIT_AFTER_HANDSHAKE, EXIT_BEFORE_HANDSHAKE, IDLE_AFTER_HANDSHAKE, INVALID_HANDSHAKE,
    SPAWN_LOCK, write_script,
};
use common::{SHUTDOWN_PATH, ScriptedBackend, ScriptedConnector, collection_entity};
use serde_json::Map;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn service_for(script: &Path) -> ServiceConfig {
    ServiceConfig {
        command: Some(script.to_path_buf()),
        shutdown_timeout_ms: 300,
        request_timeout_ms: 2_000,
        search_timeout_ms: 2_000,
        ..ServiceConfig::default()
    }
}

/// Start a supervisor running `body` as its backend
fn launch(
    dir: &TempDir,
    body: &str,
    connector: Arc<dyn Connector>,
) -> (ProcessSupervisor, mpsc::UnboundedReceiver<SupervisorEvent>) {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let script = write_script(dir.path(), "aoide-websrv", body);
    let (mut supervisor, events) =
        ProcessSupervisor::new(service_for(&script), LaunchPaths::new(dir.path()), connector);
    supervisor.start().expect("start fake backend");
    (supervisor, events)
}

/// Feed supervisor events back until `wanted` is returned
async fn drive_until(
    supervisor: &mut ProcessSupervisor,
    events: &mut mpsc::UnboundedReceiver<SupervisorEvent>,
    wanted: &Lifecycle,
    seen: &mut Vec<Lifecycle>,
) {
    while !seen.contains(wanted) {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("supervisor event in time")
            .expect("supervisor channel open");
        if let Some(lifecycle) = supervisor.handle_event(event) {
            seen.push(lifecycle);
        }
    }
}

// =============================================================================
// ProcessSupervisor
// =============================================================================

#[tokio::test]
async fn handshake_connects_and_stop_kills_lingering_backend() {
    let dir = TempDir::new().expect("temp dir");
    let backend = ScriptedBackend::new(vec![], 0);
    let connector = ScriptedConnector::new(backend.clone());
    let (mut supervisor, mut events) = launch(&dir, IDLE_AFTER_HANDSHAKE, connector.clone());
    assert_eq!(supervisor.state(), ServiceProcessState::Starting);

    let connected = Lifecycle::Connected {
        endpoint: "127.0.0.1:9".to_string(),
    };
    let mut seen = Vec::new();
    drive_until(&mut supervisor, &mut events, &connected, &mut seen).await;
    assert_eq!(supervisor.state(), ServiceProcessState::Running);
    assert_eq!(supervisor.endpoint(), Some("127.0.0.1:9"));
    assert_eq!(connector.endpoints(), vec!["127.0.0.1:9".to_string()]);
    assert!(supervisor.gateway().is_some());

    supervisor.stop();
    assert_eq!(supervisor.state(), ServiceProcessState::ShuttingDown);
    supervisor.stop();
    drive_until(&mut supervisor, &mut events, &Lifecycle::Disconnected, &mut seen).await;

    assert_eq!(seen, vec![connected, Lifecycle::Disconnected]);
    assert_eq!(supervisor.state(), ServiceProcessState::Stopped);
    assert!(supervisor.gateway().is_none());
    assert_eq!(supervisor.endpoint(), None);
    assert_eq!(backend.count(SHUTDOWN_PATH), 1);

    supervisor.stop();
    assert_eq!(supervisor.state(), ServiceProcessState::Stopped);
}

#[tokio::test]
async fn exit_before_handshake_disconnects_once() {
    let dir = TempDir::new().expect("temp dir");
    let connector = ScriptedConnector::new(ScriptedBackend::new(vec![], 0));
    let (mut supervisor, mut events) = launch(&dir, EXIT_BEFORE_HANDSHAKE, connector.clone());

    let mut seen = Vec::new();
    drive_until(&mut supervisor, &mut events, &Lifecycle::Disconnected, &mut seen).await;
    assert_eq!(seen, vec![Lifecycle::Disconnected]);
    assert_eq!(supervisor.state(), ServiceProcessState::Stopped);
    assert!(connector.endpoints().is_empty());

    // Nothing else is pending for this generation
    let extra = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    if let Ok(Some(event)) = extra {
        assert_eq!(supervisor.handle_event(event), None);
    }
}

#[tokio::test]
async fn unusable_endpoint_stops_backend_with_gateway_failure() {
    let dir = TempDir::new().expect("temp dir");
    let (mut supervisor, mut events) = launch(&dir, INVALID_HANDSHAKE, Arc::new(HttpConnector));

    let mut seen = Vec::new();
    drive_until(&mut supervisor, &mut events, &Lifecycle::Disconnected, &mut seen).await;
    assert_eq!(seen, vec![Lifecycle::Disconnected]);
    assert_eq!(supervisor.state(), ServiceProcessState::Stopped);
    assert!(supervisor.gateway().is_none());

    let failure = supervisor.launch_failure().expect("handshake failure recorded");
    assert!(
        matches!(failure, LaunchError::Gateway(GatewayError::InvalidEndpoint(_))),
        "unexpected failure: {failure:?}"
    );
    assert!(failure.remediation().summary.contains("not a valid address"));
}

#[tokio::test]
async fn unexpected_exit_after_handshake_disconnects() {
    let dir = TempDir::new().expect("temp dir");
    let connector = ScriptedConnector::new(ScriptedBackend::new(vec![], 0));
    let (mut supervisor, mut events) = launch(&dir, EXIT_AFTER_HANDSHAKE, connector);

    let mut seen = Vec::new();
    drive_until(&mut supervisor, &mut events, &Lifecycle::Disconnected, &mut seen).await;
    assert_eq!(
        seen,
        vec![
            Lifecycle::Connected {
                endpoint: "127.0.0.1:9".to_string()
            },
            Lifecycle::Disconnected
        ]
    );
    assert_eq!(supervisor.state(), ServiceProcessState::Stopped);
}

#[tokio::test]
async fn non_executable_backend_fails_to_spawn() {
    let dir = TempDir::new().expect("temp dir");
    let program = dir.path().join("aoide-websrv");
    let connector = ScriptedConnector::new(ScriptedBackend::new(vec![], 0));
    let (mut supervisor, _events) =
        ProcessSupervisor::new(service_for(&program), LaunchPaths::new(dir.path()), connector);

    let err = {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        std::fs::write(&program, "not a program").expect("write file");
        supervisor.start().expect_err("spawn must fail")
    };
    assert!(matches!(err, LaunchError::Spawn { .. }));
    assert_eq!(supervisor.state(), ServiceProcessState::Stopped);
}

// =============================================================================
// Subsystem end to end
// =============================================================================

fn subsystem_for(
    dir: &TempDir,
    backend: &Arc<ScriptedBackend>,
) -> (Subsystem, mpsc::UnboundedReceiver<SubsystemEvent>) {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let script = write_script(dir.path(), "aoide-websrv", IDLE_AFTER_HANDSHAKE);
    let settings = Settings {
        service: service_for(&script),
        ..Settings::default()
    };
    let (mut subsystem, notifications) = Subsystem::new(
        Box::new(MemorySettingsStore::new(settings)),
        LaunchPaths::new(dir.path()),
        ScriptedConnector::new(backend.clone()),
    );
    subsystem.establish_connection().expect("launch fake backend");
    (subsystem, notifications)
}

#[tokio::test]
async fn running_backend_without_collections_stays_connecting() {
    let dir = TempDir::new().expect("temp dir");
    let backend = ScriptedBackend::new(vec![], 0);
    let (mut subsystem, _notifications) = subsystem_for(&dir, &backend);

    let ready = subsystem
        .process_events_until(EVENT_TIMEOUT, |subsystem| {
            subsystem.is_backend_running() && !subsystem.is_refreshing_collections()
        })
        .await;
    assert!(ready);
    assert!(subsystem.all_collections().is_empty());
    assert!(subsystem.active_collection().is_none());
    assert_eq!(subsystem.connection_state(), ConnectionState::Connecting);

    assert!(
        subsystem
            .finish_pending_tasks_and_disconnect(EVENT_TIMEOUT)
            .await
    );
    assert!(!subsystem.is_backend_running());
    assert_eq!(subsystem.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn subsystem_connects_searches_and_drains_exports() {
    let dir = TempDir::new().expect("temp dir");
    let backend = ScriptedBackend::new(
        vec![
            collection_entity("c0", "Streaming", 1),
            collection_entity("c1", "Local", 3),
        ],
        7,
    );
    let (mut subsystem, mut notifications) = subsystem_for(&dir, &backend);
    assert_eq!(subsystem.connection_state(), ConnectionState::Connecting);

    let ready = subsystem
        .process_events_until(EVENT_TIMEOUT, |subsystem| {
            subsystem.connection_state() == ConnectionState::Connected
        })
        .await;
    assert!(ready);
    assert!(subsystem.is_backend_running());
    assert_eq!(subsystem.all_collections().len(), 2);
    assert_eq!(
        subsystem.active_collection().map(|c| c.uid.as_str()),
        Some("c1")
    );
    assert_eq!(
        subsystem.settings_store().collection_uid().as_deref(),
        Some("c1")
    );

    let mut source = subsystem.page_source().expect("page source");
    let mut cache = PaginatedResultCache::<TrackRow>::new(5);
    cache
        .set_query(&mut source, Some(TrackQuery::new(Map::new())))
        .expect("request first page");
    while let Some(id) = cache.pending_task_id() {
        let completion = subsystem
            .wait_for_task(id, EVENT_TIMEOUT)
            .await
            .expect("search page");
        cache.on_task_completed(&completion);
        cache.fetch_more(&mut source).expect("request next page");
    }
    assert_eq!(cache.state(), CacheState::Exhausted);
    assert_eq!(cache.row_count(), 7);

    let export = subsystem
        .export_track_files(None, &dir.path().join("export"))
        .expect("export task");
    let export = subsystem.start_task(export, None);
    let release = {
        let backend = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            backend.release_exports(1);
        })
    };

    assert!(
        subsystem
            .finish_pending_tasks_and_disconnect(EVENT_TIMEOUT)
            .await
    );
    release.await.expect("release task");
    assert_eq!(subsystem.connection_state(), ConnectionState::Disconnected);
    assert_eq!(subsystem.process_state(), ServiceProcessState::Stopped);
    assert!(subsystem.all_collections().is_empty());
    assert_eq!(backend.count("/t/export-vfs"), 1);
    assert_eq!(backend.count(SHUTDOWN_PATH), 1);
    assert_eq!(
        subsystem.settings_store().settings().export.last_target_root,
        Some(dir.path().join("export"))
    );

    let notifications: Vec<_> = std::iter::from_fn(|| notifications.try_recv().ok()).collect();
    let export_completed = notifications.iter().any(|event| {
        matches!(event, SubsystemEvent::TaskCompleted(completion)
            if completion.id == export.id() && completion.outcome.is_ok())
    });
    assert!(export_completed, "export finished before disconnecting");
    let disconnects = notifications
        .iter()
        .filter(|event| matches!(event, SubsystemEvent::Disconnected))
        .count();
    assert_eq!(disconnects, 1);
    assert!(notifications.iter().any(|event| matches!(
        event,
        SubsystemEvent::CollectionsChanged(changed)
            if changed.contains(CollectionsChanged::ACTIVE_COLLECTION)
    )));
}

#[tokio::test]
async fn tasks_after_shutdown_request_are_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let backend = ScriptedBackend::new(vec![collection_entity("c1", "Local", 2)], 0);
    let (mut subsystem, _notifications) = subsystem_for(&dir, &backend);
    assert!(
        subsystem
            .process_events_until(EVENT_TIMEOUT, |subsystem| {
                subsystem.connection_state() == ConnectionState::Connected
            })
            .await
    );

    subsystem.invoke_shutdown();
    assert_eq!(subsystem.connection_state(), ConnectionState::Disconnecting);
    let task = subsystem
        .list_playlists(None, Pagination::unlimited())
        .expect("gateway is kept until the backend is gone");
    let handle = subsystem.start_task(task, None);
    let completion = subsystem
        .wait_for_task(handle.id(), EVENT_TIMEOUT)
        .await
        .expect("rejection is delivered");
    assert_eq!(completion.outcome, Err(TaskFailure::ShuttingDown));

    assert!(
        subsystem
            .process_events_until(EVENT_TIMEOUT, |subsystem| {
                subsystem.connection_state() == ConnectionState::Disconnected
            })
            .await
    );
    assert_eq!(backend.count("/p/query"), 0);
}
