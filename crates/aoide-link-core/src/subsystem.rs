//! Control domain: ties the supervisor, the gateway and the collection
//! registry together.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────── Subsystem (control domain) ───────────────────────┐
//!  caller ──────► │ establish_connection / invoke_shutdown / search_tracks / export_track_files │
//!                 │                                                                             │
//!                 │  ProcessSupervisor ──SupervisorEvent──┐                                     │
//!                 │  Gateway worker ─────TaskCompletion───┼──► next_event() ─► handle_event()   │
//!                 │  CollectionRegistry ◄─────────────────┘                                     │
//!                 └────────────────────────────────┬────────────────────────────────────────────┘
//!                                                  ▼
//!                                           SubsystemEvent
//! ```
//!
//! All state transitions happen inside [`Subsystem::handle_event`], on the
//! owner's turn. Nothing here blocks; waiting is done by awaiting events.

use crate::collection::{Collection, CollectionRegistry, CollectionsChanged};
use crate::config::SettingsStore;
use crate::error::{Error, Result};
use crate::gateway::GatewayHandle;
use crate::query::{Pagination, TrackQuery};
use crate::result_cache::PageSource;
use crate::supervisor::{
    LaunchPaths, Lifecycle, ProcessSupervisor, ServiceProcessState, SupervisorEvent,
};
use crate::task::{CompletionSender, Task, TaskCompletion, TaskHandle, TaskId};
use crate::transport::Connector;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Upper bound for a graceful disconnect
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Backend running and an active collection selected
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Notifications for the owner of the subsystem
#[derive(Debug, Clone)]
pub enum SubsystemEvent {
    ConnectionStateChanged(ConnectionState),
    /// Handshake received, the gateway is up
    Connected { endpoint: String },
    Disconnected,
    CollectionsChanged(CollectionsChanged),
    /// Completion of a task started by the owner
    TaskCompleted(TaskCompletion),
}

/// Input of [`Subsystem::handle_event`]
#[derive(Debug)]
pub enum ControlEvent {
    Supervisor(SupervisorEvent),
    Task(TaskCompletion),
}

/// Requests result pages of the active collection
#[derive(Debug, Clone)]
pub struct CollectionPageSource {
    gateway: GatewayHandle,
    collection_uid: String,
    timeout: Duration,
    reply_to: CompletionSender,
}

impl CollectionPageSource {
    #[must_use]
    pub fn collection_uid(&self) -> &str {
        &self.collection_uid
    }
}

impl PageSource for CollectionPageSource {
    fn request_page(&mut self, query: &TrackQuery, pagination: Pagination) -> Result<TaskHandle> {
        let task = self
            .gateway
            .search_tracks(&self.collection_uid, query, pagination);
        Ok(task.start(Some(self.timeout), self.reply_to.clone()))
    }
}

pub struct Subsystem {
    supervisor: ProcessSupervisor,
    supervisor_events: mpsc::UnboundedReceiver<SupervisorEvent>,
    registry: CollectionRegistry,
    store: Box<dyn SettingsStore>,
    completions_tx: CompletionSender,
    completions_rx: mpsc::UnboundedReceiver<TaskCompletion>,
    notify: mpsc::UnboundedSender<SubsystemEvent>,
    connection: ConnectionState,
}

impl std::fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsystem")
            .field("connection", &self.connection)
            .field("supervisor", &self.supervisor)
            .field("active_collection", &self.registry.active_uid())
            .finish_non_exhaustive()
    }
}

impl Subsystem {
    #[must_use]
    pub fn new(
        store: Box<dyn SettingsStore>,
        paths: LaunchPaths,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<SubsystemEvent>) {
        let service = store.settings().service.clone();
        let (supervisor, supervisor_events) = ProcessSupervisor::new(service, paths, connector);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (notify, notifications) = mpsc::unbounded_channel();
        let subsystem = Self {
            supervisor,
            supervisor_events,
            registry: CollectionRegistry::new(),
            store,
            completions_tx,
            completions_rx,
            notify,
            connection: ConnectionState::Disconnected,
        };
        (subsystem, notifications)
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    #[must_use]
    pub fn process_state(&self) -> ServiceProcessState {
        self.supervisor.state()
    }

    /// Backend process running with a gateway. Unlike
    /// [`ConnectionState::Connected`] this does not need an active collection.
    #[must_use]
    pub fn is_backend_running(&self) -> bool {
        self.supervisor.state() == ServiceProcessState::Running
    }

    #[must_use]
    pub fn all_collections(&self) -> &[Collection] {
        self.registry.all()
    }

    #[must_use]
    pub fn active_collection(&self) -> Option<&Collection> {
        self.registry.active()
    }

    #[must_use]
    pub fn settings_store(&self) -> &dyn SettingsStore {
        self.store.as_ref()
    }

    pub fn settings_store_mut(&mut self) -> &mut dyn SettingsStore {
        self.store.as_mut()
    }

    #[must_use]
    pub fn is_refreshing_collections(&self) -> bool {
        self.registry.is_refreshing()
    }

    /// Sender for completions that should come back through
    /// [`Subsystem::next_event`]
    #[must_use]
    pub fn completion_sender(&self) -> CompletionSender {
        self.completions_tx.clone()
    }

    fn emit(&self, event: SubsystemEvent) {
        let _ = self.notify.send(event);
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        tracing::info!(from = %self.connection, to = %state, "Connection state changed");
        self.connection = state;
        self.emit(SubsystemEvent::ConnectionStateChanged(state));
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Start the backend; connected once the handshake arrived and an active
    /// collection is selected.
    pub fn establish_connection(&mut self) -> Result<()> {
        if self.connection != ConnectionState::Disconnected {
            tracing::warn!(state = %self.connection, "Connection already established");
            return Ok(());
        }
        self.set_connection_state(ConnectionState::Connecting);
        if let Err(err) = self.supervisor.start() {
            self.set_connection_state(ConnectionState::Disconnected);
            return Err(err.into());
        }
        Ok(())
    }

    /// Ask for a graceful shutdown; completes asynchronously
    pub fn invoke_shutdown(&mut self) {
        if self.connection == ConnectionState::Disconnected {
            return;
        }
        self.set_connection_state(ConnectionState::Disconnecting);
        self.registry.abort_refresh();
        self.supervisor.stop();
    }

    /// Shut down and process events until disconnected or `timeout` elapsed.
    ///
    /// Returns whether the subsystem is disconnected.
    pub async fn finish_pending_tasks_and_disconnect(&mut self, timeout: Duration) -> bool {
        if self.connection == ConnectionState::Disconnected {
            return true;
        }
        self.invoke_shutdown();
        let started = Instant::now();
        let disconnected = self
            .process_events_until(timeout, |subsystem| {
                subsystem.connection == ConnectionState::Disconnected
            })
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if disconnected {
            tracing::info!(elapsed_ms, "Disconnected");
        } else {
            tracing::warn!(elapsed_ms, "Disconnecting timed out");
        }
        disconnected
    }

    // =========================================================================
    // Event processing
    // =========================================================================

    /// Next supervisor event or task completion
    pub async fn next_event(&mut self) -> Option<ControlEvent> {
        tokio::select! {
            event = self.supervisor_events.recv() => event.map(ControlEvent::Supervisor),
            completion = self.completions_rx.recv() => completion.map(ControlEvent::Task),
        }
    }

    pub fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Supervisor(event) => match self.supervisor.handle_event(event) {
                Some(Lifecycle::Connected { endpoint }) => self.on_connected(endpoint),
                Some(Lifecycle::Disconnected) => self.on_disconnected(),
                None => {}
            },
            ControlEvent::Task(completion) => {
                if self.registry.owns_task(completion.id) {
                    let changed = self
                        .registry
                        .on_task_completed(&completion, self.store.as_mut());
                    if let Some(changed) = changed {
                        self.on_collections_changed(changed);
                    }
                } else {
                    self.emit(SubsystemEvent::TaskCompleted(completion));
                }
            }
        }
    }

    /// Handle events until `done` holds; `false` on timeout
    pub async fn process_events_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            match tokio::time::timeout_at(deadline, self.next_event()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }

    /// Handle events until the completion of task `id` arrives.
    ///
    /// `None` on timeout or when the connection is lost meanwhile.
    pub async fn wait_for_task(&mut self, id: TaskId, timeout: Duration) -> Option<TaskCompletion> {
        let deadline = Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.next_event())
                .await
                .ok()??;
            match event {
                ControlEvent::Task(completion) if completion.id == id => return Some(completion),
                event => self.handle_event(event),
            }
            if self.connection == ConnectionState::Disconnected {
                tracing::warn!(task_id = %id, "Disconnected while waiting for task");
                return None;
            }
        }
    }

    fn on_connected(&mut self, endpoint: String) {
        self.emit(SubsystemEvent::Connected {
            endpoint: endpoint.clone(),
        });
        if self.connection == ConnectionState::Disconnecting {
            tracing::info!(endpoint, "Disconnect requested while connecting");
            return;
        }
        if let Err(err) = self.refresh_collections() {
            tracing::warn!(error = %err, "Failed to refresh collections");
        }
        self.update_connection_state();
    }

    fn on_disconnected(&mut self) {
        if let Some(changed) = self.registry.clear() {
            self.emit(SubsystemEvent::CollectionsChanged(changed));
        }
        self.set_connection_state(ConnectionState::Disconnected);
        self.emit(SubsystemEvent::Disconnected);
    }

    fn on_collections_changed(&mut self, changed: CollectionsChanged) {
        self.emit(SubsystemEvent::CollectionsChanged(changed));
        self.update_connection_state();
    }

    fn update_connection_state(&mut self) {
        let ready = self.is_backend_running() && self.registry.active().is_some();
        match (self.connection, ready) {
            (ConnectionState::Connecting, true) => {
                self.set_connection_state(ConnectionState::Connected);
            }
            (ConnectionState::Connected, false) => {
                self.set_connection_state(ConnectionState::Connecting);
            }
            _ => {}
        }
    }

    // =========================================================================
    // Collections
    // =========================================================================

    fn gateway(&self) -> Result<GatewayHandle> {
        self.supervisor.gateway().ok_or(Error::NotConnected)
    }

    fn active_collection_uid(&self) -> Result<String> {
        self.registry
            .active_uid()
            .map(str::to_string)
            .ok_or(Error::NoActiveCollection)
    }

    /// Reload the collections of the configured kind
    pub fn refresh_collections(&mut self) -> Result<TaskId> {
        let gateway = self.gateway()?;
        let kind = self.store.settings().collection.kind.clone();
        let timeout = self.store.settings().service.request_timeout();
        Ok(self.registry.refresh(
            &gateway,
            kind.as_deref(),
            Some(timeout),
            self.completions_tx.clone(),
        ))
    }

    /// Select the active collection; unknown uids clear the selection
    pub fn select_active_collection(&mut self, uid: &str) {
        if let Some(changed) = self.registry.select(uid, self.store.as_mut()) {
            self.on_collections_changed(changed);
        }
    }

    // =========================================================================
    // Tasks scoped to the active collection
    // =========================================================================

    pub fn search_tracks(&self, query: &TrackQuery, pagination: Pagination) -> Result<Task> {
        let uid = self.active_collection_uid()?;
        Ok(self.gateway()?.search_tracks(&uid, query, pagination))
    }

    pub fn list_playlists(&self, kind: Option<&str>, pagination: Pagination) -> Result<Task> {
        let uid = self.active_collection_uid()?;
        Ok(self.gateway()?.list_playlists(&uid, kind, pagination))
    }

    /// Export the files of matching tracks into `target_root`; the target is
    /// remembered for next time.
    pub fn export_track_files(
        &mut self,
        track_filter: Option<Value>,
        target_root: &Path,
    ) -> Result<Task> {
        let uid = self.active_collection_uid()?;
        let gateway = self.gateway()?;
        if let Err(err) = self.store.set_last_export_target(target_root) {
            tracing::warn!(error = %err, "Failed to remember export target");
        }
        let target = target_root.to_string_lossy();
        tracing::info!(collection_uid = %uid, target_root = %target, "Exporting track files");
        Ok(gateway.export_track_files(&uid, track_filter, &target))
    }

    /// Start `task` with completion delivered through [`Subsystem::next_event`]
    pub fn start_task(&self, task: Task, timeout: Option<Duration>) -> TaskHandle {
        task.start(timeout, self.completions_tx.clone())
    }

    /// Page source for a [`crate::result_cache::PaginatedResultCache`] bound
    /// to the active collection
    pub fn page_source(&self) -> Result<CollectionPageSource> {
        Ok(CollectionPageSource {
            gateway: self.gateway()?,
            collection_uid: self.active_collection_uid()?,
            timeout: self.store.settings().service.search_timeout(),
            reply_to: self.completions_tx.clone(),
        })
    }
}
