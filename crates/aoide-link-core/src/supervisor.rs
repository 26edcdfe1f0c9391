//! Backend process supervision.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted ──start()──► Starting ──handshake──► Running
//!                            │                       │ stop()
//!                            │ exit / stop()         ▼
//!                            └──────────────► ShuttingDown ──exit or kill──► Stopped
//! ```
//!
//! The supervisor owns the child process and, once the handshake arrived, the
//! [`Gateway`]. Everything that happens asynchronously (handshake, process
//! exit, gateway quiescence, termination) is reported as a
//! [`SupervisorEvent`] on the channel returned by [`ProcessSupervisor::new`];
//! the owner feeds those back through [`ProcessSupervisor::handle_event`] on
//! its own turn. Events carry the launch generation so that late events from
//! a previous process are ignored.

use crate::config::ServiceConfig;
use crate::error::LaunchError;
use crate::gateway::{Gateway, GatewayConfig, GatewayEvent, GatewayHandle};
use crate::logging::{StderrLineBuffer, current_backend_log_level, log_backend_output};
use crate::transport::Connector;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};

/// File name of the backend executable
pub const EXECUTABLE_NAME: &str = if cfg!(windows) {
    "aoide-websrv.exe"
} else {
    "aoide-websrv"
};

pub const ENV_LOG_LEVEL: &str = "RUST_LOG";
pub const ENV_BACKTRACE: &str = "RUST_BACKTRACE";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_ENDPOINT_IP: &str = "ENDPOINT_IP";
pub const ENV_ENDPOINT_PORT: &str = "ENDPOINT_PORT";
pub const ENV_LAUNCH_HEADLESS: &str = "LAUNCH_HEADLESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProcessState {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Directories searched for the backend executable
#[derive(Debug, Clone, Default)]
pub struct LaunchPaths {
    pub settings_dir: PathBuf,
    pub app_dir: Option<PathBuf>,
}

impl LaunchPaths {
    #[must_use]
    pub fn new(settings_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_dir: settings_dir.into(),
            app_dir: None,
        }
    }

    /// Use the directory of the running executable as application folder
    #[must_use]
    pub fn with_current_exe_dir(mut self) -> Self {
        self.app_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        self
    }
}

/// Locate the backend: configured command, settings folder, application
/// folder, then a bare name resolved through `PATH`.
#[must_use]
pub fn resolve_executable(service: &ServiceConfig, paths: &LaunchPaths) -> PathBuf {
    if let Some(command) = service.command.as_ref().filter(|c| !c.as_os_str().is_empty()) {
        if command.is_file() {
            return command.clone();
        }
        tracing::warn!(command = %command.display(), "Configured backend executable not found");
    }
    let candidates = std::iter::once(paths.settings_dir.as_path())
        .chain(paths.app_dir.as_deref())
        .map(|dir| dir.join(EXECUTABLE_NAME));
    for candidate in candidates {
        if candidate.is_file() {
            return candidate;
        }
    }
    PathBuf::from(EXECUTABLE_NAME)
}

fn file_url(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    reqwest::Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .unwrap_or_else(|()| format!("file://{}", absolute.display()))
}

/// Variables added to the inherited environment of the backend.
///
/// Variables already present in `inherited` are left alone so that explicit
/// overrides win.
#[must_use]
pub fn launch_environment(
    inherited: &HashMap<String, String>,
    service: &ServiceConfig,
    settings_dir: &Path,
    log_level: &str,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set_default = |key: &str, value: String| {
        if !inherited.contains_key(key) {
            env.insert(key.to_string(), value);
        }
    };
    set_default(ENV_LOG_LEVEL, log_level.to_string());
    if cfg!(debug_assertions) {
        set_default(ENV_BACKTRACE, "1".to_string());
    }
    set_default(
        ENV_DATABASE_URL,
        file_url(&service.database_path(settings_dir)),
    );
    set_default(ENV_ENDPOINT_IP, service.host.clone());
    set_default(ENV_ENDPOINT_PORT, service.port.to_string());
    set_default(ENV_LAUNCH_HEADLESS, "true".to_string());
    env
}

/// The endpoint announced on a line of standard output, if any
#[must_use]
pub fn parse_handshake_line(line: &str) -> Option<&str> {
    let endpoint = line.trim();
    (!endpoint.is_empty()).then_some(endpoint)
}

/// How the backend process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Forcibly killed by the supervisor
    pub killed: bool,
}

#[derive(Debug)]
pub enum SupervisorEvent {
    /// First non-empty line of standard output
    Handshake { generation: u64, endpoint: String },
    /// The process has exited, for whatever reason
    Exited { generation: u64, exit: ProcessExit },
    Gateway {
        generation: u64,
        event: GatewayEvent,
    },
    /// Termination finished; the gateway worker is gone as well
    Terminated {
        generation: u64,
        exit: Option<ProcessExit>,
    },
}

impl SupervisorEvent {
    #[must_use]
    pub fn generation(&self) -> u64 {
        match self {
            Self::Handshake { generation, .. }
            | Self::Exited { generation, .. }
            | Self::Gateway { generation, .. }
            | Self::Terminated { generation, .. } => *generation,
        }
    }
}

/// Connection level outcome of handling a [`SupervisorEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Connected { endpoint: String },
    Disconnected,
}

struct RunningProcess {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

pub struct ProcessSupervisor {
    service: ServiceConfig,
    paths: LaunchPaths,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    state: ServiceProcessState,
    generation: u64,
    process: Option<RunningProcess>,
    gateway: Option<Gateway>,
    endpoint: Option<String>,
    disconnect_emitted: bool,
    launch_failure: Option<LaunchError>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("pid", &self.process.as_ref().and_then(|p| p.pid))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(
        service: ServiceConfig,
        paths: LaunchPaths,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            service,
            paths,
            connector,
            events,
            state: ServiceProcessState::NotStarted,
            generation: 0,
            process: None,
            gateway: None,
            endpoint: None,
            disconnect_emitted: false,
            launch_failure: None,
        };
        (supervisor, events_rx)
    }

    #[must_use]
    pub fn state(&self) -> ServiceProcessState {
        self.state
    }

    /// Address announced by the running backend
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Gateway of the running backend (only while `Running`)
    #[must_use]
    pub fn gateway(&self) -> Option<GatewayHandle> {
        self.gateway.as_ref().map(Gateway::handle)
    }

    /// Why the last launch stopped after its handshake, if it failed there
    #[must_use]
    pub fn launch_failure(&self) -> Option<&LaunchError> {
        self.launch_failure.as_ref()
    }

    #[must_use]
    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    /// Launch the backend. Must be called within a tokio runtime.
    ///
    /// A no-op while the backend is starting, running or shutting down.
    pub fn start(&mut self) -> Result<(), LaunchError> {
        match self.state {
            ServiceProcessState::Starting | ServiceProcessState::Running => {
                tracing::debug!(state = ?self.state, "Backend already started");
                return Ok(());
            }
            ServiceProcessState::ShuttingDown => {
                tracing::warn!("Backend is still shutting down, not starting it again");
                return Ok(());
            }
            ServiceProcessState::NotStarted | ServiceProcessState::Stopped => {}
        }

        let program = resolve_executable(&self.service, &self.paths);
        let inherited: HashMap<String, String> = std::env::vars().collect();
        let env = launch_environment(
            &inherited,
            &self.service,
            &self.paths.settings_dir,
            current_backend_log_level(),
        );
        tracing::info!(program = %program.display(), env = ?env, "Starting backend process");

        let mut command = Command::new(&program);
        command
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| {
            tracing::error!(program = %program.display(), error = %source, "Failed to start backend process");
            self.state = ServiceProcessState::Stopped;
            LaunchError::Spawn {
                program: program.clone(),
                source,
            }
        })?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.state = ServiceProcessState::Stopped;
            return Err(LaunchError::StdioUnavailable("output"));
        };

        self.generation += 1;
        self.state = ServiceProcessState::Starting;
        self.disconnect_emitted = false;
        self.endpoint = None;
        self.launch_failure = None;

        let generation = self.generation;
        let pid = child.id();
        tracing::info!(pid, generation, "Backend process started, waiting for handshake");

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(read_handshake(stdout, self.events.clone(), generation));
        tokio::spawn(forward_stderr(stderr));
        tokio::spawn(reap(child, kill_rx, exit_tx, self.events.clone(), generation));
        self.process = Some(RunningProcess {
            pid,
            kill: Some(kill_tx),
            exit: exit_rx,
        });
        Ok(())
    }

    /// Shut the backend down: quiesce the gateway, ask the backend to quit,
    /// wait for it to exit and kill it after the grace period. Idempotent.
    pub fn stop(&mut self) {
        match self.state {
            ServiceProcessState::NotStarted | ServiceProcessState::Stopped => {
                tracing::debug!("Backend not running");
            }
            ServiceProcessState::ShuttingDown => {
                tracing::debug!("Backend already shutting down");
            }
            ServiceProcessState::Starting => {
                tracing::info!("Stopping backend before its handshake");
                self.state = ServiceProcessState::ShuttingDown;
                self.begin_termination(Duration::ZERO);
            }
            ServiceProcessState::Running => {
                tracing::info!("Stopping backend");
                self.state = ServiceProcessState::ShuttingDown;
                match &self.gateway {
                    Some(gateway) => gateway.handle().shutdown(None),
                    None => self.begin_termination(self.service.shutdown_timeout()),
                }
            }
        }
    }

    /// Apply an event received from the supervisor channel
    pub fn handle_event(&mut self, event: SupervisorEvent) -> Option<Lifecycle> {
        if event.generation() != self.generation {
            tracing::debug!(?event, generation = self.generation, "Ignoring stale supervisor event");
            return None;
        }
        match event {
            SupervisorEvent::Handshake { endpoint, .. } => self.on_handshake(endpoint),
            SupervisorEvent::Gateway {
                event: GatewayEvent::ShuttingDown,
                ..
            } => {
                if self.state == ServiceProcessState::ShuttingDown {
                    self.begin_termination(self.service.shutdown_timeout());
                }
                None
            }
            SupervisorEvent::Exited { exit, .. } => {
                if matches!(
                    self.state,
                    ServiceProcessState::Starting | ServiceProcessState::Running
                ) {
                    tracing::warn!(
                        exit_code = ?exit.code,
                        state = ?self.state,
                        "Backend process exited unexpectedly"
                    );
                    self.state = ServiceProcessState::ShuttingDown;
                    self.begin_termination(Duration::ZERO);
                }
                None
            }
            SupervisorEvent::Terminated { exit, .. } => self.on_terminated(exit),
        }
    }

    fn on_handshake(&mut self, endpoint: String) -> Option<Lifecycle> {
        if self.state != ServiceProcessState::Starting {
            tracing::warn!(endpoint, state = ?self.state, "Ignoring unexpected handshake");
            return None;
        }
        let gateway = self.connector.connect(&endpoint).and_then(|transport| {
            let (gateway_tx, mut gateway_rx) = mpsc::unbounded_channel();
            let gateway = Gateway::spawn(
                transport,
                GatewayConfig {
                    request_timeout: self.service.request_timeout(),
                },
                gateway_tx,
            )?;
            let events = self.events.clone();
            let generation = self.generation;
            tokio::spawn(async move {
                while let Some(event) = gateway_rx.recv().await {
                    if events
                        .send(SupervisorEvent::Gateway { generation, event })
                        .is_err()
                    {
                        break;
                    }
                }
            });
            Ok(gateway)
        });
        match gateway {
            Ok(gateway) => {
                tracing::info!(endpoint, "Backend is running");
                self.gateway = Some(gateway);
                self.state = ServiceProcessState::Running;
                self.endpoint = Some(endpoint.clone());
                Some(Lifecycle::Connected { endpoint })
            }
            Err(err) => {
                let err = LaunchError::from(err);
                tracing::error!(
                    endpoint,
                    error = %err,
                    remediation = %err.remediation().summary,
                    "Failed to connect to backend"
                );
                self.launch_failure = Some(err);
                self.state = ServiceProcessState::ShuttingDown;
                self.begin_termination(Duration::ZERO);
                None
            }
        }
    }

    fn on_terminated(&mut self, exit: Option<ProcessExit>) -> Option<Lifecycle> {
        tracing::info!(
            exit_code = ?exit.as_ref().and_then(|e| e.code),
            killed = exit.as_ref().is_some_and(|e| e.killed),
            "Backend process stopped"
        );
        self.state = ServiceProcessState::Stopped;
        self.endpoint = None;
        if self.disconnect_emitted {
            return None;
        }
        self.disconnect_emitted = true;
        Some(Lifecycle::Disconnected)
    }

    fn begin_termination(&mut self, grace: Duration) {
        let process = self.process.take();
        let gateway = self.gateway.take();
        let events = self.events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let exit = match process {
                Some(process) => terminate(process, grace).await,
                None => None,
            };
            if let Some(gateway) = gateway {
                if tokio::task::spawn_blocking(move || gateway.join())
                    .await
                    .is_err()
                {
                    tracing::error!("Failed to join gateway worker");
                }
            }
            let _ = events.send(SupervisorEvent::Terminated { generation, exit });
        });
    }
}

async fn terminate(mut process: RunningProcess, grace: Duration) -> Option<ProcessExit> {
    let exited = tokio::time::timeout(grace, process.exit.wait_for(Option::is_some))
        .await
        .is_ok();
    if !exited {
        if !grace.is_zero() {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                pid = process.pid,
                "Backend did not exit in time, killing it"
            );
        }
        if let Some(kill) = process.kill.take() {
            let _ = kill.send(());
        }
        let _ = process.exit.wait_for(Option::is_some).await;
    }
    process.exit.borrow().clone()
}

async fn read_handshake(
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    generation: u64,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut endpoint_received = false;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if endpoint_received {
                    if !line.trim().is_empty() {
                        tracing::warn!(output = %line, "Ignoring unexpected output from backend");
                    }
                    continue;
                }
                if let Some(endpoint) = parse_handshake_line(&line) {
                    endpoint_received = true;
                    tracing::info!(endpoint, "Received handshake");
                    let _ = events.send(SupervisorEvent::Handshake {
                        generation,
                        endpoint: endpoint.to_string(),
                    });
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read backend output");
                break;
            }
        }
    }
}

async fn forward_stderr(mut stderr: ChildStderr) {
    let mut buffer = StderrLineBuffer::new();
    let mut chunk = [0_u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(len) => {
                if let Some(lines) = buffer.push(&chunk[..len]) {
                    log_backend_output(&lines);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read backend error output");
                break;
            }
        }
    }
    if let Some(rest) = buffer.finish() {
        log_backend_output(&rest);
    }
}

async fn reap(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    generation: u64,
) {
    // A dropped kill sender means the supervisor is gone: kill as well
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };
    let (status, killed) = match waited {
        Some(status) => (status, false),
        None => {
            if let Err(err) = child.start_kill() {
                tracing::warn!(error = %err, "Failed to kill backend process");
            }
            (child.wait().await, true)
        }
    };
    let exit = ProcessExit {
        code: status.ok().and_then(|status| status.code()),
        killed,
    };
    tracing::debug!(exit_code = ?exit.code, killed, "Backend process exited");
    exit_tx.send_replace(Some(exit.clone()));
    let _ = events.send(SupervisorEvent::Exited { generation, exit });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_takes_first_non_empty_line() {
        assert_eq!(parse_handshake_line("  \r\n"), None);
        assert_eq!(parse_handshake_line("[::1]:41234\n"), Some("[::1]:41234"));
    }

    #[test]
    fn executable_resolution_order() {
        let settings = tempfile::tempdir().unwrap();
        let app = tempfile::tempdir().unwrap();
        let paths = LaunchPaths {
            settings_dir: settings.path().to_path_buf(),
            app_dir: Some(app.path().to_path_buf()),
        };
        let mut service = ServiceConfig::default();

        assert_eq!(resolve_executable(&service, &paths), PathBuf::from(EXECUTABLE_NAME));

        let in_app = app.path().join(EXECUTABLE_NAME);
        std::fs::write(&in_app, b"").unwrap();
        assert_eq!(resolve_executable(&service, &paths), in_app);

        let in_settings = settings.path().join(EXECUTABLE_NAME);
        std::fs::write(&in_settings, b"").unwrap();
        assert_eq!(resolve_executable(&service, &paths), in_settings);

        service.command = Some(settings.path().join("missing-websrv"));
        assert_eq!(resolve_executable(&service, &paths), in_settings);

        let custom = settings.path().join("custom-websrv");
        std::fs::write(&custom, b"").unwrap();
        service.command = Some(custom.clone());
        assert_eq!(resolve_executable(&service, &paths), custom);
    }

    #[test]
    fn environment_fills_in_missing_variables() {
        let service = ServiceConfig {
            database: Some(PathBuf::from("/var/lib/aoide/aoide.sqlite")),
            port: 8080,
            ..ServiceConfig::default()
        };
        let env = launch_environment(&HashMap::new(), &service, Path::new("/cfg"), "debug");
        assert_eq!(env[ENV_LOG_LEVEL], "debug");
        assert_eq!(env[ENV_ENDPOINT_IP], "::1");
        assert_eq!(env[ENV_ENDPOINT_PORT], "8080");
        assert_eq!(env[ENV_LAUNCH_HEADLESS], "true");
        if cfg!(unix) {
            assert_eq!(env[ENV_DATABASE_URL], "file:///var/lib/aoide/aoide.sqlite");
        }
        assert_eq!(env.contains_key(ENV_BACKTRACE), cfg!(debug_assertions));
    }

    #[test]
    fn environment_respects_inherited_overrides() {
        let inherited: HashMap<String, String> = [
            (ENV_LOG_LEVEL.to_string(), "aoide=trace".to_string()),
            (ENV_ENDPOINT_PORT.to_string(), "9999".to_string()),
            (ENV_LAUNCH_HEADLESS.to_string(), "false".to_string()),
        ]
        .into_iter()
        .collect();
        let env = launch_environment(
            &inherited,
            &ServiceConfig::default(),
            Path::new("/cfg"),
            "info",
        );
        assert!(!env.contains_key(ENV_LOG_LEVEL));
        assert!(!env.contains_key(ENV_ENDPOINT_PORT));
        assert!(!env.contains_key(ENV_LAUNCH_HEADLESS));
        assert_eq!(env[ENV_ENDPOINT_IP], "::1");
        assert!(env[ENV_DATABASE_URL].starts_with("file://"));
        assert!(env[ENV_DATABASE_URL].ends_with("aoide.sqlite"));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let (mut supervisor, mut events) = ProcessSupervisor::new(
            ServiceConfig::default(),
            LaunchPaths::default(),
            Arc::new(crate::transport::HttpConnector),
        );
        supervisor.stop();
        supervisor.stop();
        assert_eq!(supervisor.state(), ServiceProcessState::NotStarted);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let (mut supervisor, _events) = ProcessSupervisor::new(
            ServiceConfig::default(),
            LaunchPaths::default(),
            Arc::new(crate::transport::HttpConnector),
        );
        let lifecycle = supervisor.handle_event(SupervisorEvent::Handshake {
            generation: 42,
            endpoint: "127.0.0.1:1".to_string(),
        });
        assert_eq!(lifecycle, None);
        assert_eq!(supervisor.state(), ServiceProcessState::NotStarted);
    }
}
