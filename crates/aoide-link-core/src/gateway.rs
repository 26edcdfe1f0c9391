//! Task gateway: the single execution context for all backend requests.
//!
//! # Architecture
//!
//! ```text
//!  control domain / any thread              worker thread "aoide"
//! ┌───────────────────────────┐  commands  ┌──────────────────────────────┐
//! │ GatewayHandle::read/write │──────────► │ Worker (current_thread rt)   │
//! │ Task::start / abort       │  (mpsc)    │  ├─ JoinSet of exchanges     │
//! │ GatewayHandle::shutdown   │            │  ├─ GatewayState             │
//! └───────────────────────────┘            │  └─ shutdown barrier         │
//!              ▲                           └──────────────┬───────────────┘
//!              │  TaskCompletion (per-task reply channel) │
//!              └──────────────────────────────────────────┘
//!                     GatewayEvent::ShuttingDown ──► owner
//! ```
//!
//! Tasks may be created anywhere but always execute on the worker thread.
//! Write tasks increment the shared [`PendingWrites`] counter when they are
//! created; a shutdown request is held back in
//! [`GatewayState::ShutdownPending`] until that counter is zero, and only
//! then is the backend asked to quit and [`GatewayEvent::ShuttingDown`]
//! emitted.

use crate::api::{self, WebRequest};
use crate::error::GatewayError;
use crate::query::{Pagination, TrackQuery};
use crate::task::{
    PendingWrites, StartRequest, Task, TaskCompletion, TaskFailure, TaskId, TaskKind,
    WorkerCommand, WriteTicket,
};
use crate::transport::{Transport, TransportError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};

/// Name of the worker thread
pub const WORKER_THREAD_NAME: &str = "aoide";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Used for tasks started without an explicit timeout
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Active,
    /// Shutdown requested, waiting for pending writes
    ShutdownPending,
    /// Shutdown request sent to the backend; new tasks are rejected
    ShuttingDown,
}

/// Notifications for the owner of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    /// All writes finished and the backend has been asked to quit
    ShuttingDown,
}

#[derive(Debug)]
struct Shared {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    pending_writes: Arc<PendingWrites>,
    next_task_id: AtomicU64,
    state: watch::Receiver<GatewayState>,
}

/// Cloneable, thread-safe access to a running gateway
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
}

impl GatewayHandle {
    fn next_id(&self) -> TaskId {
        TaskId::from_raw(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a read task
    pub fn read(&self, request: WebRequest) -> Task {
        Task::new(
            self.next_id(),
            TaskKind::Read,
            request,
            None,
            self.shared.commands.clone(),
        )
    }

    /// Create a write task; it counts as pending from now on
    pub fn write(&self, request: WebRequest) -> Task {
        let commands = self.shared.commands.clone();
        let notify = commands.clone();
        let ticket = WriteTicket::acquire(
            Arc::clone(&self.shared.pending_writes),
            Some(Box::new(move |remaining: usize| {
                let _ = notify.send(WorkerCommand::WriteFinished { remaining });
            })),
        );
        let task = Task::new(self.next_id(), TaskKind::Write, request, Some(ticket), commands);
        tracing::debug!(
            task_id = %task.id(),
            pending_writes = self.pending_writes(),
            "Created write task"
        );
        task
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.shared.pending_writes.get()
    }

    #[must_use]
    pub fn state(&self) -> GatewayState {
        *self.shared.state.borrow()
    }

    /// Ask the worker to shut the backend down once no writes are pending.
    ///
    /// Returns immediately. Repeated calls are harmless; only the first one
    /// that finds zero pending writes sends the shutdown request.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        if self
            .shared
            .commands
            .send(WorkerCommand::Shutdown { timeout })
            .is_err()
        {
            tracing::debug!("Gateway worker already gone, ignoring shutdown");
        }
    }

    pub fn list_collections(&self, kind: Option<&str>, pagination: Pagination) -> Task {
        self.read(api::list_collections(kind, pagination))
    }

    pub fn search_tracks(
        &self,
        collection_uid: &str,
        query: &TrackQuery,
        pagination: Pagination,
    ) -> Task {
        self.read(api::search_tracks(collection_uid, query, pagination))
    }

    pub fn list_playlists(
        &self,
        collection_uid: &str,
        kind: Option<&str>,
        pagination: Pagination,
    ) -> Task {
        self.read(api::list_playlists(collection_uid, kind, pagination))
    }

    /// Exporting modifies the filesystem, so it must not be cut off by a
    /// shutdown and is created as a write task.
    pub fn export_track_files(
        &self,
        collection_uid: &str,
        track_filter: Option<Value>,
        target_root_path: &str,
    ) -> Task {
        self.write(api::export_track_files(
            collection_uid,
            track_filter,
            target_root_path,
        ))
    }
}

/// Owner of the worker thread
#[derive(Debug)]
pub struct Gateway {
    handle: GatewayHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Gateway {
    /// Start the worker thread
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: GatewayConfig,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Result<Self, GatewayError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| GatewayError::Runtime(err.to_string()))?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(GatewayState::Active);
        let pending_writes = Arc::new(PendingWrites::new());

        let worker = Worker {
            transport,
            config,
            events,
            state: state_tx,
            shutdown_timeout: None,
            pending_writes: Arc::clone(&pending_writes),
            in_flight: JoinSet::new(),
            aborts: HashMap::new(),
        };
        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(worker.run(commands_rx)))
            .map_err(|err| GatewayError::SpawnWorker(err.to_string()))?;

        Ok(Self {
            handle: GatewayHandle {
                shared: Arc::new(Shared {
                    commands: commands_tx,
                    pending_writes,
                    next_task_id: AtomicU64::new(1),
                    state: state_rx,
                }),
            },
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Stop the worker, dropping everything still in flight, and wait for the
    /// thread to exit. Blocks the calling thread.
    pub fn join(mut self) {
        let _ = self.handle.shared.commands.send(WorkerCommand::Terminate);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Gateway worker thread panicked");
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Detach; the worker exits on its own once it sees the command
            let _ = self.handle.shared.commands.send(WorkerCommand::Terminate);
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    transport: Arc<dyn Transport>,
    config: GatewayConfig,
    events: mpsc::UnboundedSender<GatewayEvent>,
    state: watch::Sender<GatewayState>,
    shutdown_timeout: Option<Duration>,
    pending_writes: Arc<PendingWrites>,
    in_flight: JoinSet<TaskId>,
    aborts: HashMap<TaskId, AbortHandle>,
}

enum WorkerEvent {
    Command(Option<WorkerCommand>),
    Joined(Result<TaskId, JoinError>),
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        tracing::debug!("Gateway worker started");
        loop {
            let event = tokio::select! {
                command = commands.recv() => WorkerEvent::Command(command),
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    WorkerEvent::Joined(joined)
                }
            };
            match event {
                WorkerEvent::Command(Some(WorkerCommand::Start(start))) => self.start(start),
                WorkerEvent::Command(Some(WorkerCommand::Abort(id))) => self.abort(id),
                WorkerEvent::Command(Some(WorkerCommand::WriteFinished { remaining })) => {
                    self.on_write_finished(remaining);
                }
                WorkerEvent::Command(Some(WorkerCommand::Shutdown { timeout })) => {
                    self.shutdown(timeout);
                }
                WorkerEvent::Command(Some(WorkerCommand::Terminate) | None) => break,
                WorkerEvent::Joined(Ok(id)) => {
                    self.aborts.remove(&id);
                }
                WorkerEvent::Joined(Err(err)) => {
                    if err.is_panic() {
                        tracing::error!(error = %err, "Gateway task panicked");
                    }
                }
            }
        }
        let remaining = self.in_flight.len();
        if remaining > 0 {
            tracing::info!(in_flight = remaining, "Dropping unfinished tasks");
        }
        self.in_flight.abort_all();
        tracing::debug!("Gateway worker stopped");
    }

    fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    fn set_state(&self, state: GatewayState) {
        self.state.send_replace(state);
    }

    fn start(&mut self, mut start: StartRequest) {
        if self.state() == GatewayState::ShuttingDown {
            drop(start.ticket.take());
            tracing::warn!(
                task_id = %start.id,
                path = %start.request.path,
                "Rejecting task, gateway is shutting down"
            );
            let _ = start.reply_to.send(TaskCompletion {
                id: start.id,
                kind: start.kind,
                outcome: Err(TaskFailure::ShuttingDown),
            });
            return;
        }
        let id = start.id;
        let timeout = start.timeout.unwrap_or(self.config.request_timeout);
        let transport = Arc::clone(&self.transport);
        let abort = self.in_flight.spawn(execute(transport, start, timeout));
        self.aborts.insert(id, abort);
    }

    fn abort(&mut self, id: TaskId) {
        if let Some(abort) = self.aborts.remove(&id) {
            tracing::debug!(task_id = %id, "Aborted task");
            abort.abort();
        }
    }

    fn on_write_finished(&mut self, remaining: usize) {
        tracing::debug!(pending_writes = remaining, "Write task finished");
        if self.state() == GatewayState::ShutdownPending {
            self.shutdown(self.shutdown_timeout);
        }
    }

    fn shutdown(&mut self, timeout: Option<Duration>) {
        if self.state() == GatewayState::ShuttingDown {
            tracing::debug!("Already shutting down");
            return;
        }
        if timeout.is_some() || self.state() == GatewayState::Active {
            self.shutdown_timeout = timeout;
        }
        self.set_state(GatewayState::ShutdownPending);

        let pending_writes = self.pending_writes.get();
        if pending_writes > 0 {
            tracing::info!(
                pending_writes,
                "Delaying shutdown until all pending write tasks have finished"
            );
            return;
        }

        tracing::info!("Shutting down");
        self.set_state(GatewayState::ShuttingDown);
        let transport = Arc::clone(&self.transport);
        let timeout = self.shutdown_timeout.unwrap_or(self.config.request_timeout);
        tokio::spawn(async move {
            let request = api::shutdown();
            match exchange(transport.as_ref(), &request, timeout).await {
                Ok(_) => tracing::debug!("Backend acknowledged shutdown"),
                Err(failure) => tracing::warn!(error = %failure, "Shutdown request failed"),
            }
        });
        let _ = self.events.send(GatewayEvent::ShuttingDown);
    }
}

async fn exchange(
    transport: &dyn Transport,
    request: &WebRequest,
    timeout: Duration,
) -> Result<Value, TaskFailure> {
    match tokio::time::timeout(timeout, transport.exchange(request, timeout)).await {
        Err(_) | Ok(Err(TransportError::Timeout)) => Err(TaskFailure::Timeout(timeout)),
        Ok(Err(TransportError::MalformedJson { status, message })) => {
            Err(TaskFailure::MalformedJson { status, message })
        }
        Ok(Err(err)) => Err(TaskFailure::Network(err.to_string())),
        Ok(Ok(response)) => request.check_response(response.status, response.content),
    }
}

async fn execute(transport: Arc<dyn Transport>, start: StartRequest, timeout: Duration) -> TaskId {
    let StartRequest {
        id,
        kind,
        request,
        reply_to,
        ticket,
        ..
    } = start;
    tracing::debug!(
        task_id = %id,
        method = %request.method,
        path = %request.path,
        "Sending request"
    );
    let outcome = exchange(transport.as_ref(), &request, timeout).await;
    if let Err(failure) = &outcome {
        tracing::warn!(task_id = %id, path = %request.path, error = %failure, "Request failed");
    }
    if reply_to.send(TaskCompletion { id, kind, outcome }).is_err() {
        tracing::debug!(task_id = %id, "Task owner is gone, discarding result");
    }
    // Released only after the owner has been notified
    drop(ticket);
    id
}
