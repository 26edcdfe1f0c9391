//! Request catalogue for the aoide web API.
//!
//! Every request the client sends is built here as a transport-agnostic
//! [`WebRequest`] that also records which JSON shape a successful response
//! must have. Response validation lives next to the builders so that each
//! endpoint's contract is stated in one place.

use crate::query::{Pagination, TrackQuery};
use crate::task::TaskFailure;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Tag facet of genre labels
pub const FACET_GENRE: &str = "gnre";

/// Tag facet of comments
pub const FACET_COMMENT: &str = "comm";

/// HTTP status of a regular successful response
pub const HTTP_STATUS_OK: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// JSON shape a successful response must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseShape {
    Array,
    Object,
    /// Anything, including an empty body; any 2xx status is accepted
    Any,
}

impl ResponseShape {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    fn matches(self, content: &Value) -> bool {
        match self {
            Self::Array => content.is_array(),
            Self::Object => content.is_object(),
            Self::Any => true,
        }
    }
}

/// One HTTP exchange with the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebRequest {
    pub method: HttpMethod,
    /// Absolute path below the endpoint, e.g. `/api/c`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub expect: ResponseShape,
}

impl WebRequest {
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>, expect: ResponseShape) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            expect,
        }
    }

    #[must_use]
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.query.extend(pagination.to_query_pairs());
        self
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Value of the first query parameter named `key`
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Validate a response against this request's contract
    pub fn check_response(&self, status: u16, content: Value) -> Result<Value, TaskFailure> {
        if !(200..300).contains(&status) {
            return Err(TaskFailure::Status { status, content });
        }
        if self.expect == ResponseShape::Any {
            return Ok(content);
        }
        if status != HTTP_STATUS_OK {
            return Err(TaskFailure::Status { status, content });
        }
        if !self.expect.matches(&content) {
            return Err(TaskFailure::InvalidContent {
                expected: self.expect.as_str(),
                content,
            });
        }
        Ok(content)
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// `GET /api/c`: collections, optionally restricted to one kind
#[must_use]
pub fn list_collections(kind: Option<&str>, pagination: Pagination) -> WebRequest {
    let mut request = WebRequest::new(HttpMethod::Get, "/api/c", ResponseShape::Array);
    if let Some(kind) = kind.filter(|kind| !kind.is_empty()) {
        request = request.query_param("kind", kind);
    }
    request.pagination(pagination)
}

/// `POST /api/c/{uid}/t/search`: one page of tracks
#[must_use]
pub fn search_tracks(
    collection_uid: &str,
    query: &TrackQuery,
    pagination: Pagination,
) -> WebRequest {
    WebRequest::new(
        HttpMethod::Post,
        format!("/api/c/{collection_uid}/t/search"),
        ResponseShape::Array,
    )
    .query_param("resolveUrlFromContentPath", "true")
    .query_param("encodeGigtags", "true")
    .pagination(pagination)
    .body(search_params(query))
}

/// `POST /api/c/{uid}/p/query`: playlists, optionally of one kind
#[must_use]
pub fn list_playlists(
    collection_uid: &str,
    kind: Option<&str>,
    pagination: Pagination,
) -> WebRequest {
    let mut params = Map::new();
    if let Some(kind) = kind.filter(|kind| !kind.is_empty()) {
        params.insert("filter".to_string(), json!({ "kind": kind }));
    }
    WebRequest::new(
        HttpMethod::Post,
        format!("/api/c/{collection_uid}/p/query"),
        ResponseShape::Array,
    )
    .pagination(pagination)
    .body(Value::Object(params))
}

/// `POST /api/c/{uid}/t/export-vfs`: copy matching track files into a
/// directory tree, removing everything else below the target
#[must_use]
pub fn export_track_files(
    collection_uid: &str,
    track_filter: Option<Value>,
    target_root_path: &str,
) -> WebRequest {
    WebRequest::new(
        HttpMethod::Post,
        format!("/api/c/{collection_uid}/t/export-vfs"),
        ResponseShape::Object,
    )
    .body(json!({
        "filter": track_filter.unwrap_or(Value::Null),
        "targetRootPath": target_root_path,
        "purgeOtherFiles": true,
    }))
}

/// `POST /api/app/shutdown`
#[must_use]
pub fn shutdown() -> WebRequest {
    WebRequest::new(HttpMethod::Post, "/api/app/shutdown", ResponseShape::Any)
}

// =============================================================================
// Search parameters
// =============================================================================

fn tag_filter(facets: Option<&[&str]>, label: Value) -> Value {
    let mut tag = Map::new();
    if let Some(facets) = facets {
        tag.insert("facets".to_string(), json!({ "anyOf": facets }));
    }
    tag.insert("label".to_string(), label);
    json!({ "tag": tag })
}

/// Body of a search request: `{"filter": {"all": [...]}, "ordering": [...]}`
#[must_use]
pub fn search_params(query: &TrackQuery) -> Value {
    let overlay = &query.overlay;
    let mut all_filters: Vec<Value> = Vec::new();

    if let Some(base_filter) = query.base_filter() {
        all_filters.push(Value::Object(base_filter.clone()));
    }
    if let Some(min_bpm) = overlay.min_bpm {
        all_filters.push(json!({ "numeric": ["musicTempoBpm", { "ge": min_bpm }] }));
    }
    if let Some(max_bpm) = overlay.max_bpm {
        all_filters.push(json!({ "numeric": ["musicTempoBpm", { "le": max_bpm }] }));
    }
    if !overlay.any_genre_labels.is_empty() {
        let genre_filters: Vec<Value> = overlay
            .any_genre_labels
            .iter()
            .map(|label| tag_filter(Some(&[FACET_GENRE]), json!({ "matches": label })))
            .collect();
        all_filters.push(json!({ "any": genre_filters }));
    }
    for label in &overlay.all_hashtag_labels {
        all_filters.push(tag_filter(Some(&[]), json!({ "matches": label })));
    }
    for term in &overlay.all_comment_terms {
        all_filters.push(tag_filter(Some(&[FACET_COMMENT]), json!({ "contains": term })));
    }
    if !overlay.any_comment_terms.is_empty() {
        let comment_filters: Vec<Value> = overlay
            .any_comment_terms
            .iter()
            .map(|term| tag_filter(Some(&[FACET_COMMENT]), json!({ "contains": term })))
            .collect();
        all_filters.push(json!({ "any": comment_filters }));
    }
    for term in query.search_terms.iter().filter(|term| !term.is_empty()) {
        // Any string field, or any tag label regardless of its facet
        all_filters.push(json!({
            "any": [
                { "phrase": [[], [term]] },
                tag_filter(None, json!({ "contains": term })),
            ]
        }));
    }

    let mut params = Map::new();
    if !all_filters.is_empty() {
        params.insert("filter".to_string(), json!({ "all": all_filters }));
    }
    let ordering = query.sort().map(parse_ordering).unwrap_or_default();
    if !ordering.is_empty() {
        params.insert("ordering".to_string(), Value::Array(ordering));
    }
    Value::Object(params)
}

/// Parse `"+field,-field"` into `[["field","asc"],["field","desc"]]`
#[must_use]
pub fn parse_ordering(sort: &str) -> Vec<Value> {
    sort.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| {
            let (field, direction) = if let Some(field) = field.strip_prefix('+') {
                (field.trim(), "asc")
            } else if let Some(field) = field.strip_prefix('-') {
                (field.trim(), "desc")
            } else {
                tracing::warn!(sort_field = field, "Missing direction for sort field");
                (field, "")
            };
            json!([field, direction])
        })
        .collect()
}
