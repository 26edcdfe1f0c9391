//! Tasks executed by the [`Gateway`](crate::gateway::Gateway) worker.
//!
//! # Ownership
//!
//! ```text
//! caller ── gateway.read()/write() ──► Task (not started, owned by caller)
//!                                        │ start(timeout, reply_to)
//!                                        ▼
//!                                  TaskHandle (id + abort)
//!                                        │
//! worker thread: exchange ──► TaskCompletion { id, outcome } ──► reply_to
//! ```
//!
//! Every task finishes with exactly one [`TaskCompletion`] unless it was
//! aborted; an aborted task's caller is detached and receives nothing. Owners
//! must compare [`TaskCompletion::id`] with the task they are waiting for and
//! drop anything else.
//!
//! A write task holds a [`WriteTicket`] from creation until it is finished,
//! aborted or dropped, which keeps the shared [`PendingWrites`] counter in
//! sync without any locking.

use crate::api::WebRequest;
use crate::error::Remediation;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies one task for the lifetime of its gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Does not modify backend state
    Read,
    /// Modifies backend state; holds back a pending shutdown
    Write,
}

/// Why a task did not produce a result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskFailure {
    /// Connection refused, reset, DNS, ...
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success (or unexpected success) HTTP status
    #[error("unexpected HTTP status {status}")]
    Status { status: u16, content: Value },

    /// Response body is not valid JSON
    #[error("malformed response (HTTP {status}): {message}")]
    MalformedJson { status: u16, message: String },

    /// Response is JSON of the wrong shape
    #[error("invalid response content: expected {expected}")]
    InvalidContent {
        expected: &'static str,
        content: Value,
    },

    #[error("task aborted")]
    Aborted,

    /// The gateway has begun shutting down and no longer accepts tasks
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// The gateway worker is gone
    #[error("gateway is not running")]
    GatewayGone,
}

impl TaskFailure {
    /// Transport-level failure (as opposed to a backend-reported one)
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Network(_) | Self::GatewayGone => {
                Remediation::new("The backend is not reachable. Check that it is still running.")
                    .alternative("Inspect the aoide_websrv log target for crash output.")
            }
            Self::Timeout(timeout) => Remediation::new(format!(
                "The backend did not answer within {timeout:?}. Retry when it is idle."
            ))
            .alternative("Raise `service.request_timeout_ms` or `service.search_timeout_ms`."),
            Self::Status { status, .. } => Remediation::new(format!(
                "The backend rejected the request with HTTP status {status}."
            ))
            .alternative("Check the request filter and the backend log."),
            Self::MalformedJson { .. } | Self::InvalidContent { .. } => Remediation::new(
                "The backend answered with unexpected content. Check that client and backend versions match.",
            ),
            Self::Aborted => Remediation::new("The request was cancelled. Retry if that was unexpected."),
            Self::ShuttingDown => {
                Remediation::new("The backend is shutting down. Reconnect before sending more requests.")
            }
        }
    }
}

/// Terminal outcome of a task: response content or failure
pub type TaskOutcome = Result<Value, TaskFailure>;

/// Delivered once per task that was started and not aborted
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub id: TaskId,
    pub kind: TaskKind,
    pub outcome: TaskOutcome,
}

/// Channel on which task completions are delivered to their owner
pub type CompletionSender = mpsc::UnboundedSender<TaskCompletion>;

// =============================================================================
// Write bookkeeping
// =============================================================================

/// Number of write tasks created but not yet finished.
///
/// Incremented at task creation (any thread) and decremented when the task
/// is finished, aborted or dropped (usually on the worker thread).
#[derive(Debug, Default)]
pub struct PendingWrites {
    count: AtomicUsize,
}

impl PendingWrites {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Held by a write task for as long as it counts as pending
pub struct WriteTicket {
    counter: Arc<PendingWrites>,
    on_release: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

impl WriteTicket {
    /// Count one more pending write; `on_release` gets the remaining count
    pub(crate) fn acquire(
        counter: Arc<PendingWrites>,
        on_release: Option<Box<dyn Fn(usize) + Send + Sync>>,
    ) -> Self {
        counter.count.fetch_add(1, Ordering::AcqRel);
        Self {
            counter,
            on_release,
        }
    }
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        let previous = self.counter.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pending write counter underflow");
        if let Some(on_release) = &self.on_release {
            on_release(previous.saturating_sub(1));
        }
    }
}

impl std::fmt::Debug for WriteTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTicket")
            .field("pending", &self.counter.get())
            .finish()
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Messages understood by the gateway worker
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Start(StartRequest),
    Abort(TaskId),
    /// A write ticket was released
    WriteFinished { remaining: usize },
    Shutdown { timeout: Option<Duration> },
    Terminate,
}

#[derive(Debug)]
pub(crate) struct StartRequest {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) request: WebRequest,
    pub(crate) timeout: Option<Duration>,
    pub(crate) reply_to: CompletionSender,
    pub(crate) ticket: Option<WriteTicket>,
}

/// A request bound to a gateway, not yet started.
///
/// Dropping an unstarted write task releases its pending-write slot.
#[derive(Debug)]
#[must_use = "a task does nothing until it is started"]
pub struct Task {
    id: TaskId,
    kind: TaskKind,
    request: WebRequest,
    ticket: Option<WriteTicket>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        kind: TaskKind,
        request: WebRequest,
        ticket: Option<WriteTicket>,
        commands: mpsc::UnboundedSender<WorkerCommand>,
    ) -> Self {
        Self {
            id,
            kind,
            request,
            ticket,
            commands,
        }
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    #[must_use]
    pub fn request(&self) -> &WebRequest {
        &self.request
    }

    /// Hand the task to the worker. `timeout` overrides the gateway default.
    ///
    /// If the worker is gone the completion is delivered immediately with
    /// [`TaskFailure::GatewayGone`].
    pub fn start(self, timeout: Option<Duration>, reply_to: CompletionSender) -> TaskHandle {
        let Self {
            id,
            kind,
            request,
            ticket,
            commands,
        } = self;
        let start = StartRequest {
            id,
            kind,
            request,
            timeout,
            reply_to,
            ticket,
        };
        if let Err(mpsc::error::SendError(command)) = commands.send(WorkerCommand::Start(start)) {
            if let WorkerCommand::Start(start) = command {
                tracing::warn!(task_id = %id, "Gateway worker is gone, failing task");
                let _ = start.reply_to.send(TaskCompletion {
                    id,
                    kind,
                    outcome: Err(TaskFailure::GatewayGone),
                });
            }
        }
        TaskHandle {
            id,
            kind,
            commands: Some(commands),
        }
    }
}

/// Caller-side handle of a started task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    kind: TaskKind,
    commands: Option<mpsc::UnboundedSender<WorkerCommand>>,
}

impl TaskHandle {
    /// A handle that is not bound to any worker; aborting it does nothing.
    ///
    /// For page sources that answer requests themselves.
    #[must_use]
    pub fn detached(id: TaskId, kind: TaskKind) -> Self {
        Self {
            id,
            kind,
            commands: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Detach from the task and ask the worker to drop it. Always safe.
    pub fn abort(&self) {
        if let Some(commands) = &self.commands {
            tracing::debug!(task_id = %self.id, "Aborting task");
            let _ = commands.send(WorkerCommand::Abort(self.id));
        }
    }
}
