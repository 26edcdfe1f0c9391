//! Error types for aoide-link-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

pub use crate::task::TaskFailure;

/// A shell command that helps resolve an error
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    pub label: String,
    pub command: String,
}

/// What the user can do about an error
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    pub summary: String,
    pub commands: Vec<RemediationCommand>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        let label = label.into();
        let command = command.into();
        self.commands.push(RemediationCommand { label, command });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Plain text block for terminal output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut text = format!("To fix:\n  {}\n", self.summary);
        if !self.commands.is_empty() {
            text.push_str("  Commands:\n");
            for RemediationCommand { label, command } in &self.commands {
                let _ = writeln!(text, "    - {label}: {command}");
            }
        }
        if !self.alternatives.is_empty() {
            text.push_str("  Alternatives:\n");
            for alternative in &self.alternatives {
                let _ = writeln!(text, "    - {alternative}");
            }
        }
        text
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Backend process could not be launched
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// A request against the backend failed
    #[error("Task failed: {0}")]
    Task(#[from] TaskFailure),

    /// The task gateway is not usable
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Operation requires a connected backend
    #[error("Not connected to the backend")]
    NotConnected,

    /// Operation requires an active collection
    #[error("No active collection selected")]
    NoActiveCollection,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Launch(err) => Some(err.remediation()),
            Self::Task(err) => Some(err.remediation()),
            Self::Gateway(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::NotConnected => Some(
                Remediation::new("Start the backend and wait for its handshake before issuing requests.")
                    .command("List collections", "aoide-link collections")
                    .alternative("Check the log output of the aoide_websrv target for startup errors."),
            ),
            Self::NoActiveCollection => Some(
                Remediation::new("Select a collection or create one in the backend first.")
                    .command("List collections", "aoide-link collections")
                    .command("Select collection", "aoide-link --collection <UID> search")
                    .alternative("Set `collection.uid` in aoide-link.toml."),
            ),
            Self::Io(_) => Some(Remediation::new(
                "Check that the paths involved exist and are accessible.",
            )),
            Self::Json(_) => Some(
                Remediation::new("The query or filter file is not valid JSON.")
                    .command("Validate", "jq . filter.json"),
            ),
        }
    }
}

/// Errors raised while launching the backend process
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Spawning the executable failed (missing, not executable, ...)
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child process did not expose a piped stdio stream
    #[error("Standard {0} of the backend process is not available")]
    StdioUnavailable(&'static str),

    /// The worker execution context could not be created
    #[error("Failed to set up the task gateway: {0}")]
    Gateway(#[from] GatewayError),
}

impl LaunchError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Spawn { program, .. } => Remediation::new(format!(
                "Make sure the backend executable exists and is runnable: {}",
                program.display()
            ))
            .command("Check PATH", "which aoide-websrv")
            .alternative("Set `service.command` in aoide-link.toml to the absolute executable path.")
            .alternative("Place aoide-websrv next to the settings file."),
            Self::StdioUnavailable(_) => Remediation::new(
                "The backend was started without piped output streams. Retry the launch.",
            ),
            Self::Gateway(err) => err.remediation(),
        }
    }
}

/// Errors raised by the task gateway itself (not by individual tasks)
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// The worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    SpawnWorker(String),

    /// The worker runtime could not be built
    #[error("Failed to build worker runtime: {0}")]
    Runtime(String),

    /// The endpoint announced by the backend is not a usable base URL
    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(String),
}

impl GatewayError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::SpawnWorker(_) | Self::Runtime(_) => Remediation::new(
                "The system refused to create a worker thread. Free resources and retry.",
            )
            .alternative("Check the process limits (ulimit -u)."),
            Self::InvalidEndpoint(addr) => Remediation::new(format!(
                "The backend announced an endpoint that is not a valid address: {addr}"
            ))
            .alternative("Check `service.host` and `service.port` in aoide-link.toml.")
            .alternative("Upgrade aoide-websrv if its handshake format changed."),
        }
    }
}

/// Loading or saving the settings file failed
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(String),

    #[error("No settings directory available on this platform")]
    NoSettingsDir,
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { path, .. } => Remediation::new(format!(
                "Check that the settings file is readable: {}",
                path.display()
            ))
            .command("Inspect", format!("ls -la \"{}\"", path.display())),
            Self::Parse { path, .. } => Remediation::new(format!(
                "Fix the TOML syntax in {}",
                path.display()
            ))
            .alternative("Delete the file to fall back to built-in defaults."),
            Self::Write { path, .. } => Remediation::new(format!(
                "Check that the settings directory is writable: {}",
                path.parent().unwrap_or(path).display()
            )),
            Self::Serialize(_) => Remediation::new("Report this as a bug; settings failed to serialize."),
            Self::NoSettingsDir => Remediation::new("Pass an explicit settings file.")
                .command("Explicit config", "aoide-link --config ./aoide-link.toml collections"),
        }
    }
}
