//! Shared test infrastructure for aoide-link-core integration tests.
//!
//! [`ScriptedBackend`] answers gateway requests in memory the way
//! `aoide-websrv` would: a fixed collection listing, paged track search
//! results, an empty playlist listing and a shutdown acknowledgement.
//! Exports are held until the test releases them, so write barrier
//! behavior can be observed deterministically.

#![allow(dead_code)]

use aoide_link_core::api::WebRequest;
use aoide_link_core::error::GatewayError;
use aoide_link_core::transport::{Connector, JsonResponse, Transport, TransportError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const SHUTDOWN_PATH: &str = "/api/app/shutdown";

/// `[header, body]` entity of a collection
pub fn collection_entity(uid: &str, title: &str, path_kind: u8) -> Value {
    json!([
        [uid, 1],
        {
            "title": title,
            "kind": "org.mixxx",
            "mediaSourceConfig": {
                "contentPath": {
                    "pathKind": path_kind,
                    "rootUrl": format!("file:///music/{uid}/"),
                }
            }
        }
    ])
}

/// `[header, body]` entity of the track at `index`
pub fn track_entity(index: u64) -> Value {
    json!([
        [format!("track-{index:04}"), 1],
        {
            "contentUrl": format!("file:///music/{index:04}.mp3"),
            "track": {
                "titles": [{ "name": format!("Track {index}") }],
                "tags": {
                    "gnre": [["House", 0.5], ["Techno", 0.9]],
                    "comm": ["first pressing"],
                }
            }
        }
    ])
}

/// In-memory stand-in for the backend's HTTP API
#[derive(Debug)]
pub struct ScriptedBackend {
    collections: Value,
    track_count: u64,
    export_gate: Arc<Semaphore>,
    requests: Mutex<Vec<WebRequest>>,
}

impl ScriptedBackend {
    pub fn new(collections: Vec<Value>, track_count: u64) -> Arc<Self> {
        Arc::new(Self {
            collections: Value::Array(collections),
            track_count,
            export_gate: Arc::new(Semaphore::new(0)),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Let `count` held exports finish
    pub fn release_exports(&self, count: usize) {
        self.export_gate.add_permits(count);
    }

    /// Paths of all requests received so far
    pub fn paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.path.clone())
            .collect()
    }

    pub fn count(&self, suffix: &str) -> usize {
        self.paths()
            .iter()
            .filter(|path| path.ends_with(suffix))
            .count()
    }

    pub fn requests(&self) -> Vec<WebRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn search_page(&self, request: &WebRequest) -> Value {
        let offset = request
            .query_value("offset")
            .and_then(|offset| offset.parse::<u64>().ok())
            .unwrap_or(0);
        let limit = request
            .query_value("limit")
            .and_then(|limit| limit.parse::<u64>().ok())
            .unwrap_or(self.track_count);
        let end = offset.saturating_add(limit).min(self.track_count);
        Value::Array((offset..end).map(track_entity).collect())
    }
}

#[async_trait]
impl Transport for ScriptedBackend {
    async fn exchange(
        &self,
        request: &WebRequest,
        _timeout: Duration,
    ) -> Result<JsonResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let path = request.path.as_str();
        let content = if path == "/api/c" {
            self.collections.clone()
        } else if path.ends_with("/t/search") {
            self.search_page(request)
        } else if path.ends_with("/p/query") {
            json!([])
        } else if path.ends_with("/t/export-vfs") {
            let permit = self
                .export_gate
                .acquire()
                .await
                .map_err(|err| TransportError::Request(err.to_string()))?;
            permit.forget();
            json!({ "exported": 0, "purged": 0 })
        } else if path == SHUTDOWN_PATH {
            json!({})
        } else {
            return Ok(JsonResponse {
                status: 404,
                content: json!({ "error": format!("no route for {path}") }),
            });
        };
        Ok(JsonResponse::ok(content))
    }
}

/// Hands out the same [`ScriptedBackend`] for every endpoint
#[derive(Debug)]
pub struct ScriptedConnector {
    backend: Arc<ScriptedBackend>,
    endpoints: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new(backend: Arc<ScriptedBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    /// Endpoints announced by handshakes, in order
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, GatewayError> {
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        Ok(Arc::clone(&self.backend) as Arc<dyn Transport>)
    }
}

// =============================================================================
// Fake backend executables
// =============================================================================

#[cfg(unix)]
pub mod fake_backend {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Writing an executable while another test forks can leave the file
    /// open in the child and make exec fail with ETXTBSY.
    pub static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    /// Write `body` as an executable shell script into `dir`
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut permissions = std::fs::metadata(&path)
            .expect("script metadata")
            .permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("make script executable");
        path
    }

    /// Announces an endpoint and then idles until killed
    pub const IDLE_AFTER_HANDSHAKE: &str = "echo 'listening' >&2\necho ''\necho '127.0.0.1:9'\nexec sleep 30";

    /// Announces an endpoint without a host and idles until killed
    pub const INVALID_HANDSHAKE: &str = "echo 'http://'\nexec sleep 30";

    /// Exits before printing anything
    pub const EXIT_BEFORE_HANDSHAKE: &str = "echo 'database is locked' >&2\nexit 3";

    /// Announces an endpoint and exits a moment later
    pub const EXIT_AFTER_HANDSHAKE: &str = "echo '127.0.0.1:9'\nsleep 1\nexit 0";
}
