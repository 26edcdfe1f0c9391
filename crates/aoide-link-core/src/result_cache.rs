//! Paginated, append-only cache of search results.
//!
//! # States
//!
//! ```text
//!          set_query(q)              page.len() == limit
//!  Idle ───────────────► Fetching ─────────────────────► Ready ──fetch_more()──► Fetching
//!   ▲                        │                                                      │
//!   │ set_query(None)        │ page.len() < limit                                   │
//!   └────────────────────    ▼                                                      │
//!                        Exhausted ◄────────────────────────────────────────────────┘
//! ```
//!
//! Pages are requested through a [`PageSource`] and arrive later as
//! [`TaskCompletion`]s. A completion is only merged if it belongs to the
//! single fetch in flight and starts exactly at the current row count, so
//! replies of superseded fetches can never corrupt the cache.

use crate::error::Result;
use crate::query::{Pagination, TrackQuery};
use crate::task::{TaskCompletion, TaskHandle, TaskId};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Rows requested per page unless configured otherwise
pub const DEFAULT_PAGE_SIZE: u64 = 200;

const GENRE_SEPARATOR: &str = ";";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheState {
    #[default]
    Idle,
    Fetching,
    Ready,
    Exhausted,
}

/// A decoded result row
pub trait RowRecord: Sized {
    fn from_json(value: Value) -> std::result::Result<Self, String>;

    /// Stable identity used for point invalidation
    fn identity(&self) -> Option<&str>;
}

impl RowRecord for Value {
    fn from_json(value: Value) -> std::result::Result<Self, String> {
        Ok(value)
    }

    fn identity(&self) -> Option<&str> {
        None
    }
}

/// Track search result with its tag summaries extracted once on insertion
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRow {
    pub uid: String,
    pub content_url: Option<String>,
    pub genres: Option<String>,
    pub comment: Option<String>,
    /// The `[header, body]` entity without its tags
    pub entity: Value,
}

fn tag_labels(tags: &Value, facet: &str) -> Vec<String> {
    let Some(items) = tags.get(facet).and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut scored: Vec<(String, f64)> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(label) => Some((label.clone(), 1.0)),
            Value::Array(parts) => parts.first().and_then(Value::as_str).map(|label| {
                (
                    label.to_string(),
                    parts.get(1).and_then(Value::as_f64).unwrap_or(1.0),
                )
            }),
            Value::Object(_) => item.get("label").and_then(Value::as_str).map(|label| {
                (
                    label.to_string(),
                    item.get("score").and_then(Value::as_f64).unwrap_or(1.0),
                )
            }),
            _ => None,
        })
        .filter(|(label, _)| !label.is_empty())
        .collect();
    scored.sort_by(|(_, lhs), (_, rhs)| rhs.total_cmp(lhs));
    scored.into_iter().map(|(label, _)| label).collect()
}

impl RowRecord for TrackRow {
    fn from_json(mut value: Value) -> std::result::Result<Self, String> {
        let uid = match value.get(0) {
            Some(Value::Array(header)) => header.first().and_then(Value::as_str),
            Some(header @ Value::Object(_)) => header.get("uid").and_then(Value::as_str),
            _ => None,
        }
        .map(str::to_string)
        .ok_or_else(|| "missing track uid".to_string())?;
        let body = value
            .get_mut(1)
            .filter(|body| body.is_object())
            .ok_or_else(|| format!("missing body of track {uid}"))?;
        let content_url = body
            .get("contentUrl")
            .and_then(Value::as_str)
            .map(str::to_string);
        let tags = body
            .get_mut("track")
            .and_then(Value::as_object_mut)
            .and_then(|track| track.remove("tags"))
            .unwrap_or(Value::Null);
        let genres = tag_labels(&tags, crate::api::FACET_GENRE);
        let comment = tag_labels(&tags, crate::api::FACET_COMMENT).into_iter().next();
        Ok(Self {
            uid,
            content_url,
            genres: (!genres.is_empty()).then(|| genres.join(GENRE_SEPARATOR)),
            comment,
            entity: value,
        })
    }

    fn identity(&self) -> Option<&str> {
        Some(self.content_url.as_deref().unwrap_or(&self.uid))
    }
}

/// Issues page requests on behalf of a cache
pub trait PageSource {
    fn request_page(&mut self, query: &TrackQuery, pagination: Pagination) -> Result<TaskHandle>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage<R> {
    pub first_row: usize,
    pub rows: Vec<R>,
}

/// Change notifications for whoever renders the rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Rows `first..=last` were appended
    RowsInserted { first: usize, last: usize },
    /// All rows were dropped
    RowsReset,
    /// A row became stale
    RowsChanged { row: usize },
    QueryChanged,
    FetchFailed { offset: u64 },
}

#[derive(Debug)]
struct PendingFetch {
    handle: TaskHandle,
    query: TrackQuery,
    pagination: Pagination,
}

#[derive(Debug)]
pub struct PaginatedResultCache<R> {
    page_size: u64,
    state: CacheState,
    query: Option<TrackQuery>,
    pending: Option<PendingFetch>,
    pages: Vec<ResultPage<R>>,
    row_count: usize,
    identity_index: Option<HashMap<String, usize>>,
    stale_identities: HashSet<String>,
    stale_rows: BTreeSet<usize>,
    events: Vec<CacheEvent>,
}

impl<R: RowRecord> Default for PaginatedResultCache<R> {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl<R: RowRecord> PaginatedResultCache<R> {
    #[must_use]
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size: page_size.max(1),
            state: CacheState::Idle,
            query: None,
            pending: None,
            pages: Vec::new(),
            row_count: 0,
            identity_index: None,
            stale_identities: HashSet::new(),
            stale_rows: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        self.state
    }

    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Query of the cached rows
    #[must_use]
    pub fn query(&self) -> Option<&TrackQuery> {
        self.query.as_ref()
    }

    #[must_use]
    pub fn pages(&self) -> &[ResultPage<R>] {
        &self.pages
    }

    #[must_use]
    pub fn pending_task_id(&self) -> Option<TaskId> {
        self.pending.as_ref().map(|pending| pending.handle.id())
    }

    #[must_use]
    pub fn can_fetch_more(&self) -> bool {
        self.state == CacheState::Ready
    }

    /// Notifications accumulated since the last call
    pub fn take_events(&mut self) -> Vec<CacheEvent> {
        std::mem::take(&mut self.events)
    }

    /// Switch to `query` and fetch its first page.
    ///
    /// Returns whether a request was issued: equal queries (in flight or
    /// already cached) are deduplicated, `None` resets the cache.
    pub fn set_query(
        &mut self,
        source: &mut dyn PageSource,
        query: Option<TrackQuery>,
    ) -> Result<bool> {
        let Some(query) = query.map(TrackQuery::normalized) else {
            self.reset();
            return Ok(false);
        };
        if let Some(pending) = &self.pending {
            if pending.query == query {
                tracing::debug!(task_id = %pending.handle.id(), "Query already in flight");
                return Ok(false);
            }
            self.abort_pending();
        } else if self.query.as_ref() == Some(&query)
            && matches!(self.state, CacheState::Ready | CacheState::Exhausted)
        {
            tracing::debug!("Query already cached");
            return Ok(false);
        }

        self.clear_rows();
        self.query = Some(query.clone());
        self.state = CacheState::Idle;
        self.events.push(CacheEvent::QueryChanged);
        self.start_fetch(source, query, 0)?;
        Ok(true)
    }

    /// Request the next page. A no-op unless more rows are available and
    /// nothing is in flight.
    pub fn fetch_more(&mut self, source: &mut dyn PageSource) -> Result<bool> {
        if self.state != CacheState::Ready || self.pending.is_some() {
            tracing::debug!(state = ?self.state, "No more rows to fetch");
            return Ok(false);
        }
        let Some(query) = self.query.clone() else {
            return Ok(false);
        };
        self.start_fetch(source, query, self.row_count as u64)?;
        Ok(true)
    }

    fn start_fetch(
        &mut self,
        source: &mut dyn PageSource,
        query: TrackQuery,
        offset: u64,
    ) -> Result<()> {
        let pagination = Pagination::new(offset, self.page_size);
        let handle = source.request_page(&query, pagination)?;
        tracing::debug!(
            task_id = %handle.id(),
            offset,
            limit = self.page_size,
            "Fetching result page"
        );
        self.pending = Some(PendingFetch {
            handle,
            query,
            pagination,
        });
        self.state = CacheState::Fetching;
        Ok(())
    }

    /// Abort the fetch in flight, if any; the rows cached so far are kept
    pub fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
            self.settle();
        }
    }

    /// Drop the query and all rows
    pub fn reset(&mut self) {
        self.abort_pending();
        self.clear_rows();
        if self.query.take().is_some() {
            self.events.push(CacheEvent::QueryChanged);
        }
        self.state = CacheState::Idle;
    }

    // State after a fetch ended without adding rows
    fn settle(&mut self) {
        self.state = if self.row_count > 0 {
            CacheState::Ready
        } else {
            CacheState::Idle
        };
    }

    fn clear_rows(&mut self) {
        let had_rows = self.row_count > 0;
        self.pages.clear();
        self.row_count = 0;
        self.identity_index = None;
        self.stale_identities.clear();
        self.stale_rows.clear();
        if had_rows {
            self.events.push(CacheEvent::RowsReset);
        }
    }

    /// Merge the reply of the fetch in flight.
    ///
    /// Returns `false` if the completion belongs to some other task.
    pub fn on_task_completed(&mut self, completion: &TaskCompletion) -> bool {
        let pending = match self.pending.take() {
            Some(pending) if pending.handle.id() == completion.id => pending,
            other => {
                self.pending = other;
                return false;
            }
        };
        let offset = pending.pagination.offset;
        match &completion.outcome {
            Ok(content) => {
                if let Err(reason) = self.accept_page(&pending, content) {
                    tracing::warn!(task_id = %completion.id, offset, reason = %reason, "Discarding result page");
                    self.settle();
                    self.events.push(CacheEvent::FetchFailed { offset });
                }
            }
            Err(failure) => {
                tracing::warn!(task_id = %completion.id, offset, error = %failure, "Failed to fetch result page");
                self.settle();
                self.events.push(CacheEvent::FetchFailed { offset });
            }
        }
        true
    }

    fn accept_page(&mut self, pending: &PendingFetch, content: &Value) -> std::result::Result<(), String> {
        let expected = self.row_count as u64;
        // Replies are matched by task id and every row change drops the
        // pending fetch, so a matched reply always continues the rows
        debug_assert_eq!(pending.pagination.offset, expected);
        let items = content
            .as_array()
            .ok_or_else(|| "expected an array of rows".to_string())?;
        let limit = pending.pagination.limit.unwrap_or(self.page_size);
        if items.len() as u64 > limit {
            return Err(format!("{} rows exceed the limit of {limit}", items.len()));
        }
        let rows = items
            .iter()
            .cloned()
            .map(R::from_json)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let exhausted = (rows.len() as u64) < limit;
        tracing::debug!(offset = expected, rows = rows.len(), exhausted, "Received result page");

        if !rows.is_empty() {
            let first = self.row_count;
            let last = first + rows.len() - 1;
            let page = ResultPage {
                first_row: first,
                rows,
            };
            if self.identity_index.is_some() {
                let identities = Self::page_identities(&page);
                for (identity, row) in identities {
                    self.index_row(identity, row);
                }
            }
            self.row_count = last + 1;
            self.pages.push(page);
            self.events.push(CacheEvent::RowsInserted { first, last });
        }
        self.state = if exhausted {
            CacheState::Exhausted
        } else {
            CacheState::Ready
        };
        Ok(())
    }

    /// Row at `index`, located by binary search over the page offsets
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&R> {
        let page_index = self.pages.partition_point(|page| page.first_row <= index);
        let page = self.pages.get(page_index.checked_sub(1)?)?;
        page.rows.get(index - page.first_row)
    }

    fn page_identities(page: &ResultPage<R>) -> Vec<(String, usize)> {
        page.rows
            .iter()
            .enumerate()
            .filter_map(|(offset, row)| {
                row.identity()
                    .map(|identity| (identity.to_string(), page.first_row + offset))
            })
            .collect()
    }

    fn index_row(&mut self, identity: String, row: usize) {
        let index = self.identity_index.get_or_insert_with(HashMap::new);
        if let Some(existing) = index.get(&identity) {
            tracing::debug!(identity = %identity, existing, row, "Duplicate row identity");
            return;
        }
        if self.stale_identities.contains(&identity) && self.stale_rows.insert(row) {
            self.events.push(CacheEvent::RowsChanged { row });
        }
        index.insert(identity, row);
    }

    fn ensure_identity_index(&mut self) {
        if self.identity_index.is_some() {
            return;
        }
        self.identity_index = Some(HashMap::with_capacity(self.row_count));
        let identities: Vec<_> = self.pages.iter().flat_map(Self::page_identities).collect();
        for (identity, row) in identities {
            self.index_row(identity, row);
        }
    }

    /// Row index of the row with `identity`; builds the index on first use
    pub fn row_of_identity(&mut self, identity: &str) -> Option<usize> {
        self.ensure_identity_index();
        self.identity_index
            .as_ref()
            .and_then(|index| index.get(identity).copied())
    }

    /// Mark the row with `identity` as stale without dropping any rows
    pub fn invalidate(&mut self, identity: &str) {
        self.stale_identities.insert(identity.to_string());
        self.ensure_identity_index();
        let row = self
            .identity_index
            .as_ref()
            .and_then(|index| index.get(identity).copied());
        if let Some(row) = row {
            if self.stale_rows.insert(row) {
                self.events.push(CacheEvent::RowsChanged { row });
            }
        }
    }

    #[must_use]
    pub fn is_row_stale(&self, row: usize) -> bool {
        self.stale_rows.contains(&row)
    }
}
