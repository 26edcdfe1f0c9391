//! aoide-link: command line client for the aoide music library backend
//!
//! Every command launches `aoide-websrv`, waits for its handshake and the
//! collection listing, runs a single request and shuts the backend down
//! again, waiting for pending writes (exports) to finish first.

use anyhow::{Context, anyhow, bail};
use aoide_link_core::config::{FileSettingsStore, LogFormat, SettingsStore};
use aoide_link_core::logging::init_logging;
use aoide_link_core::query::{OverlayFilter, Pagination, TrackQuery};
use aoide_link_core::result_cache::{PaginatedResultCache, RowRecord, TrackRow};
use aoide_link_core::subsystem::DISCONNECT_TIMEOUT;
use aoide_link_core::supervisor::LaunchPaths;
use aoide_link_core::task::{Task, TaskCompletion};
use aoide_link_core::transport::HttpConnector;
use aoide_link_core::{ConnectionState, Error, Subsystem};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// The first launch may migrate the database
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Exports copy files and may take a while
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Grace period on top of a task's own timeout
const COMPLETION_SLACK: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "aoide-link",
    about = "Query and export an aoide music library through a supervised aoide-websrv backend",
    version
)]
struct Cli {
    /// Settings file [default: <config dir>/aoide-link/aoide-link.toml]
    #[arg(long, global = true, env = "AOIDE_LINK_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level filter, overrides the settings file
    #[arg(long = "log-level", global = true, env = "AOIDE_LINK_LOG_LEVEL", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "json-log", global = true)]
    json_log: bool,

    /// Collection to use instead of the remembered one
    #[arg(long, global = true, value_name = "UID")]
    collection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the collections of the configured kind
    Collections,

    /// Search tracks in the active collection
    Search(SearchArgs),

    /// List the playlists of the active collection
    Playlists {
        /// Only playlists of this kind
        #[arg(long)]
        kind: Option<String>,
    },

    /// Copy the files of matching tracks into a directory
    Export {
        /// Target directory; files not part of the export are purged
        target_root: PathBuf,

        /// JSON file with a track filter [default: all tracks]
        #[arg(long, value_name = "FILE")]
        filter: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Free text, split into terms on whitespace
    text: Vec<String>,

    /// Ordering, e.g. `-musicTempoBpm,+titles`
    #[arg(long)]
    sort: Option<String>,

    #[arg(long, value_name = "BPM")]
    min_bpm: Option<f64>,

    #[arg(long, value_name = "BPM")]
    max_bpm: Option<f64>,

    /// Match any of these genres (repeatable)
    #[arg(long = "genre", value_name = "LABEL")]
    genres: Vec<String>,

    /// Require all of these hashtags (repeatable)
    #[arg(long = "hashtag", value_name = "LABEL")]
    hashtags: Vec<String>,

    /// Require all of these comment terms (repeatable)
    #[arg(long = "comment", value_name = "TERM")]
    comments: Vec<String>,

    /// JSON file with the base query
    #[arg(long = "query", value_name = "FILE")]
    query_file: Option<PathBuf>,

    /// Stop after this many rows
    #[arg(long, default_value_t = 200)]
    max_rows: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = err.downcast_ref::<Error>().and_then(Error::remediation) {
                eprintln!("\n{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let store = match &cli.config {
        Some(path) => FileSettingsStore::open(path),
        None => FileSettingsStore::open_default(),
    }
    .map_err(Error::from)?;

    let mut log_config = store.settings().logging.clone();
    if let Some(level) = &cli.log_level {
        log_config.level.clone_from(level);
    }
    if cli.json_log {
        log_config.format = LogFormat::Json;
    }
    init_logging(&log_config).context("failed to initialize logging")?;
    tracing::debug!(settings = %store.path().display(), "Loaded settings");

    let paths = LaunchPaths::new(store.settings_dir()).with_current_exe_dir();
    let (mut subsystem, _notifications) =
        Subsystem::new(Box::new(store), paths, Arc::new(HttpConnector));
    subsystem.establish_connection().map_err(anyhow::Error::from)?;

    let result = run_connected(&mut subsystem, cli).await;
    if !subsystem
        .finish_pending_tasks_and_disconnect(DISCONNECT_TIMEOUT)
        .await
    {
        tracing::warn!("Backend did not shut down in time");
    }
    result
}

async fn run_connected(subsystem: &mut Subsystem, cli: Cli) -> anyhow::Result<()> {
    let ready = subsystem
        .process_events_until(STARTUP_TIMEOUT, |subsystem| {
            subsystem.connection_state() == ConnectionState::Disconnected
                || (subsystem.is_backend_running() && !subsystem.is_refreshing_collections())
        })
        .await;
    if !ready || !subsystem.is_backend_running() {
        bail!("backend did not become ready");
    }
    if let Some(uid) = &cli.collection {
        subsystem.select_active_collection(uid);
    }

    let output = match cli.command {
        Command::Collections => list_collections(subsystem),
        Command::Search(args) => search(subsystem, args).await?,
        Command::Playlists { kind } => {
            let task = subsystem.list_playlists(kind.as_deref(), Pagination::unlimited())?;
            let timeout = request_timeout(subsystem);
            run_task(subsystem, task, timeout).await?
        }
        Command::Export {
            target_root,
            filter,
        } => export(subsystem, &target_root, filter.as_deref()).await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn request_timeout(subsystem: &Subsystem) -> Duration {
    subsystem.settings_store().settings().service.request_timeout()
}

fn list_collections(subsystem: &Subsystem) -> Value {
    let active = subsystem.active_collection().map(|c| c.uid.as_str());
    subsystem
        .all_collections()
        .iter()
        .map(|collection| {
            json!({
                "uid": collection.uid,
                "title": collection.title,
                "kind": collection.kind,
                "pathKind": collection.content_path.path_kind as u8,
                "rootUrl": collection.content_path.root_url,
                "active": Some(collection.uid.as_str()) == active,
            })
        })
        .collect()
}

fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text)
        .map_err(Error::from)
        .with_context(|| format!("invalid JSON in {}", path.display()))
}

fn remember_query_file(subsystem: &mut Subsystem, path: &Path) {
    let store = subsystem.settings_store_mut();
    store.settings_mut().export.last_query_file = Some(path.to_path_buf());
    if let Err(err) = store.save() {
        tracing::warn!(error = %err, "Failed to remember query file");
    }
}

async fn run_task(subsystem: &mut Subsystem, task: Task, timeout: Duration) -> anyhow::Result<Value> {
    let handle = subsystem.start_task(task, Some(timeout));
    let completion = subsystem
        .wait_for_task(handle.id(), timeout + COMPLETION_SLACK)
        .await
        .ok_or_else(|| anyhow!("no reply from backend for {}", handle.id()))?;
    into_content(completion)
}

fn into_content(completion: TaskCompletion) -> anyhow::Result<Value> {
    completion
        .outcome
        .map_err(|failure| Error::Task(failure).into())
}

async fn search(subsystem: &mut Subsystem, args: SearchArgs) -> anyhow::Result<Value> {
    let base_query = match &args.query_file {
        Some(path) => {
            let base = read_json_file(path)?;
            remember_query_file(subsystem, path);
            match base {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                _ => bail!("base query must be a JSON object"),
            }
        }
        None => Map::new(),
    };
    let overlay = OverlayFilter {
        min_bpm: args.min_bpm,
        max_bpm: args.max_bpm,
        any_genre_labels: args.genres,
        all_hashtag_labels: args.hashtags,
        all_comment_terms: args.comments,
        ..OverlayFilter::default()
    };
    let mut query = TrackQuery::new(base_query)
        .with_overlay(overlay)
        .with_search_text(&args.text.join(" "));
    if let Some(sort) = args.sort {
        query = query.with_sort(sort);
    }
    tracing::debug!(?query, "Searching tracks");

    let service = subsystem.settings_store().settings().service.clone();
    let mut source = subsystem.page_source()?;
    let mut cache = PaginatedResultCache::<TrackRow>::new(service.page_size);
    cache.set_query(&mut source, Some(query))?;
    while let Some(id) = cache.pending_task_id() {
        let completion = subsystem
            .wait_for_task(id, service.search_timeout() + COMPLETION_SLACK)
            .await
            .ok_or_else(|| anyhow!("no reply from backend for search {id}"))?;
        cache.on_task_completed(&completion);
        into_content(completion)?;
        if cache.row_count() >= args.max_rows {
            break;
        }
        cache.fetch_more(&mut source)?;
    }
    cache.abort_pending();

    let rows: Vec<Value> = (0..cache.row_count().min(args.max_rows))
        .filter_map(|index| cache.row(index))
        .map(|row| {
            json!({
                "uid": row.uid,
                "contentUrl": row.content_url,
                "identity": row.identity(),
                "genres": row.genres,
                "comment": row.comment,
                "entity": row.entity,
            })
        })
        .collect();
    Ok(Value::Array(rows))
}

async fn export(
    subsystem: &mut Subsystem,
    target_root: &Path,
    filter_file: Option<&Path>,
) -> anyhow::Result<Value> {
    let filter = match filter_file {
        Some(path) => {
            let filter = read_json_file(path)?;
            remember_query_file(subsystem, path);
            Some(filter).filter(|filter| !filter.is_null())
        }
        None => None,
    };
    let target_root = std::path::absolute(target_root)
        .with_context(|| format!("invalid target directory {}", target_root.display()))?;
    let task = subsystem.export_track_files(filter, &target_root)?;
    run_task(subsystem, task, EXPORT_TIMEOUT).await
}
