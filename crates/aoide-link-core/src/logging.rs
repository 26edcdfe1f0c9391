//! Logging setup and backend output bridging.
//!
//! The client logs through `tracing`; [`init_logging`] installs the global
//! subscriber (pretty or JSON lines on stderr, optionally mirrored into a
//! file). The backend's own diagnostics arrive on its standard error and are
//! re-emitted line by line under [`BACKEND_LOG_TARGET`], e.g.
//! `RUST_LOG=info,aoide_websrv=warn` keeps them quiet.
//!
//! Field names used throughout the crate: `task_id`, `collection_uid`,
//! `offset`, `limit`, `pending_writes`, `endpoint`.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Tracing target for lines forwarded from the backend's standard error
pub const BACKEND_LOG_TARGET: &str = "aoide_websrv";

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// `[logging]` section of the settings file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directives; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    /// Also append log lines to this file
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,

    #[error("cannot open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot install tracing subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LogError> {
    let open = || {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).append(true).open(path)
    };
    open().map_err(|source| LogError::OpenFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Install the global subscriber. Only the first call succeeds.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(LogError::AlreadyInitialized);
    }
    let result = install(config);
    if result.is_err() {
        INSTALLED.store(false, Ordering::Release);
    }
    result
}

fn install(config: &LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let mut layers = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        layers.push(output_layer(config.format, open_log_file(path)?, false));
    }
    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(layers).with(filter),
    )?;
    tracing::debug!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

// =============================================================================
// Backend log bridging
// =============================================================================

/// Log level handed to the backend, following our own effective max level.
///
/// The backend is never more verbose than `trace` nor quieter than `warn`.
#[must_use]
pub fn backend_log_level(max_level: LevelFilter) -> &'static str {
    if max_level >= LevelFilter::TRACE {
        "trace"
    } else if max_level >= LevelFilter::DEBUG {
        "debug"
    } else if max_level >= LevelFilter::INFO {
        "info"
    } else {
        "warn"
    }
}

/// [`backend_log_level`] for the currently installed subscriber
#[must_use]
pub fn current_backend_log_level() -> &'static str {
    backend_log_level(LevelFilter::current())
}

/// Re-emit a chunk of complete lines written by the backend
pub fn log_backend_output(chunk: &str) {
    for line in chunk.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        tracing::info!(target: BACKEND_LOG_TARGET, "{line}");
    }
}

/// Buffers raw standard error output until whole lines are available.
///
/// Chunks are only released up to (and including) the last newline; a
/// trailing partial line stays buffered until its newline arrives or the
/// stream ends.
#[derive(Debug, Default)]
pub struct StderrLineBuffer {
    pending: Vec<u8>,
}

impl StderrLineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes`, returning all complete lines accumulated so far
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let last_newline = self.pending.iter().rposition(|&b| b == b'\n')?;
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        Some(String::from_utf8_lossy(&complete).into_owned())
    }

    /// Release whatever is left when the stream closes
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_section_parses_with_defaults() {
        let config: LogConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.file.is_none());
    }

    #[test]
    fn log_file_parent_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("aoide-link.log");
        open_log_file(&path).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn backend_level_is_clamped() {
        assert_eq!(backend_log_level(LevelFilter::TRACE), "trace");
        assert_eq!(backend_log_level(LevelFilter::DEBUG), "debug");
        assert_eq!(backend_log_level(LevelFilter::INFO), "info");
        assert_eq!(backend_log_level(LevelFilter::WARN), "warn");
        assert_eq!(backend_log_level(LevelFilter::ERROR), "warn");
        assert_eq!(backend_log_level(LevelFilter::OFF), "warn");
    }

    #[test]
    fn stderr_buffer_holds_partial_lines() {
        let mut buffer = StderrLineBuffer::new();
        assert_eq!(buffer.push(b"INFO starting"), None);
        assert_eq!(buffer.buffered_len(), 13);
        assert_eq!(
            buffer.push(b" up\nWARN disk").as_deref(),
            Some("INFO starting up\n")
        );
        assert_eq!(buffer.push(b" full\nDONE\n").as_deref(), Some("WARN disk full\nDONE\n"));
        assert_eq!(buffer.buffered_len(), 0);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn stderr_buffer_flushes_tail_on_finish() {
        let mut buffer = StderrLineBuffer::new();
        assert_eq!(buffer.push(b"a\nb"), Some("a\n".to_string()));
        assert_eq!(buffer.finish(), Some("b".to_string()));
        assert_eq!(buffer.finish(), None);
    }
}
