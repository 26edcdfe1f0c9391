//! Configuration management for aoide-link
//!
//! Handles loading and persisting `aoide-link.toml`. The settings file doubles
//! as the persisted state of the client: the last selected collection and the
//! last export target are written back through a [`SettingsStore`].

use crate::error::ConfigError;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the settings document inside the settings directory
pub const SETTINGS_FILE_NAME: &str = "aoide-link.toml";

/// Default name of the backend database file inside the settings directory
pub const DATABASE_FILE_NAME: &str = "aoide.sqlite";

/// Collection kind used to tag collections owned by this client
pub const DEFAULT_COLLECTION_KIND: &str = "org.mixxx";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Backend process and request settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Collection selection
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Export defaults
    #[serde(default)]
    pub export: ExportConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,
}

/// Backend service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Explicit path of the backend executable
    #[serde(default)]
    pub command: Option<PathBuf>,

    /// Explicit path of the database file
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Bind host passed to the backend
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port passed to the backend (0 = pick a free port)
    #[serde(default)]
    pub port: u16,

    /// Grace period for the backend to exit after the shutdown request
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Default per-request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for search requests
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,

    /// Number of rows requested per result page
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command: None,
            database: None,
            host: default_host(),
            port: 0,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The first search after startup may take much longer than other requests
    #[must_use]
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    /// Database location, defaulting to [`DATABASE_FILE_NAME`] in `settings_dir`
    #[must_use]
    pub fn database_path(&self, settings_dir: &Path) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| settings_dir.join(DATABASE_FILE_NAME))
    }
}

fn default_host() -> String {
    "::1".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_search_timeout_ms() -> u64 {
    20_000
}

fn default_page_size() -> u64 {
    200
}

/// Collection selection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Only collections of this kind are listed
    #[serde(default = "default_collection_kind")]
    pub kind: Option<String>,

    /// Last selected collection, restored on the next listing
    #[serde(default)]
    pub uid: Option<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            kind: default_collection_kind(),
            uid: None,
        }
    }
}

fn default_collection_kind() -> Option<String> {
    Some(DEFAULT_COLLECTION_KIND.to_string())
}

/// Export defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExportConfig {
    /// Last used export target directory
    #[serde(default)]
    pub last_target_root: Option<PathBuf>,

    /// Last used query/filter file
    #[serde(default)]
    pub last_query_file: Option<PathBuf>,
}

impl Settings {
    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Settings file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml_str(&text).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse settings from a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|err| err.to_string())
    }

    /// Write settings to `path` atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text =
            toml::to_string_pretty(self).map_err(|err| ConfigError::Serialize(err.to_string()))?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, text).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }
}

/// Default settings directory (`<config dir>/aoide-link`)
pub fn default_settings_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("aoide-link"))
        .ok_or(ConfigError::NoSettingsDir)
}

// =============================================================================
// Persisted state
// =============================================================================

/// Persisted client state.
///
/// The registry and the CLI only ever go through this trait so tests can run
/// without touching the filesystem.
pub trait SettingsStore: Send {
    fn settings(&self) -> &Settings;

    fn settings_mut(&mut self) -> &mut Settings;

    /// Persist the current settings
    fn save(&mut self) -> Result<(), ConfigError>;

    /// Last selected collection uid
    fn collection_uid(&self) -> Option<String> {
        self.settings().collection.uid.clone()
    }

    /// Remember `uid` as the selected collection and persist it
    fn set_collection_uid(&mut self, uid: &str) -> Result<(), ConfigError> {
        if self.settings().collection.uid.as_deref() == Some(uid) {
            return Ok(());
        }
        self.settings_mut().collection.uid = Some(uid.to_string());
        self.save()
    }

    /// Remember the last export target directory and persist it
    fn set_last_export_target(&mut self, target_root: &Path) -> Result<(), ConfigError> {
        self.settings_mut().export.last_target_root = Some(target_root.to_path_buf());
        self.save()
    }
}

/// Settings backed by a TOML file
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl FileSettingsStore {
    /// Load the store from `path` (defaults if the file does not exist yet)
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let settings = Settings::load(&path)?;
        Ok(Self { path, settings })
    }

    /// Open `aoide-link.toml` in the default settings directory
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::open(default_settings_dir()?.join(SETTINGS_FILE_NAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the settings file
    #[must_use]
    pub fn settings_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

impl SettingsStore for FileSettingsStore {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    fn save(&mut self) -> Result<(), ConfigError> {
        self.settings.save(&self.path)
    }
}

/// In-memory settings, counting how often they were saved
#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    settings: Settings,
    saves: usize,
}

impl MemorySettingsStore {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self { settings, saves: 0 }
    }

    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl SettingsStore for MemorySettingsStore {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    fn save(&mut self) -> Result<(), ConfigError> {
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_backend_expectations() {
        let settings = Settings::default();
        assert_eq!(settings.service.host, "::1");
        assert_eq!(settings.service.port, 0);
        assert_eq!(settings.service.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(settings.service.request_timeout(), Duration::from_secs(10));
        assert_eq!(settings.service.search_timeout(), Duration::from_secs(20));
        assert_eq!(settings.service.page_size, 200);
        assert_eq!(settings.collection.kind.as_deref(), Some("org.mixxx"));
        assert!(settings.collection.uid.is_none());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [service]
            port = 8080

            [collection]
            uid = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(settings.service.port, 8080);
        assert_eq!(settings.service.host, "::1");
        assert_eq!(settings.collection.uid.as_deref(), Some("abc"));
        assert_eq!(settings.collection.kind.as_deref(), Some("org.mixxx"));
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "[service\nport = ").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn database_path_defaults_into_settings_dir() {
        let service = ServiceConfig::default();
        assert_eq!(
            service.database_path(Path::new("/home/dj/.config/aoide-link")),
            PathBuf::from("/home/dj/.config/aoide-link/aoide.sqlite")
        );
        let service = ServiceConfig {
            database: Some(PathBuf::from("/data/lib.sqlite")),
            ..ServiceConfig::default()
        };
        assert_eq!(
            service.database_path(Path::new("/ignored")),
            PathBuf::from("/data/lib.sqlite")
        );
    }

    #[test]
    fn file_store_persists_collection_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let mut store = FileSettingsStore::open(&path).unwrap();
        store.set_collection_uid("col-1").unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("toml.tmp").exists());

        let reopened = FileSettingsStore::open(&path).unwrap();
        assert_eq!(reopened.collection_uid().as_deref(), Some("col-1"));
        assert_eq!(reopened.settings_dir(), dir.path().join("nested"));
    }

    #[test]
    fn memory_store_skips_redundant_saves() {
        let mut store = MemorySettingsStore::default();
        store.set_collection_uid("a").unwrap();
        store.set_collection_uid("a").unwrap();
        store.set_collection_uid("b").unwrap();
        assert_eq!(store.saves(), 2);
        assert_eq!(store.collection_uid().as_deref(), Some("b"));
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
