//! Track queries and pagination.
//!
//! A [`TrackQuery`] is the unit of deduplication for the result cache: two
//! queries compare equal iff their base query, overlay filter and search
//! terms are equal after [`TrackQuery::normalize`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client-side constraints merged with the base query before dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlayFilter {
    pub min_bpm: Option<f64>,
    pub max_bpm: Option<f64>,
    /// Matches if any of the genre labels matches
    pub any_genre_labels: Vec<String>,
    /// Each label must match a plain tag
    pub all_hashtag_labels: Vec<String>,
    /// Each term must be contained in the comment
    pub all_comment_terms: Vec<String>,
    /// At least one term must be contained in the comment
    pub any_comment_terms: Vec<String>,
}

impl OverlayFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min_bpm.is_none()
            && self.max_bpm.is_none()
            && self.any_genre_labels.is_empty()
            && self.all_hashtag_labels.is_empty()
            && self.all_comment_terms.is_empty()
            && self.any_comment_terms.is_empty()
    }

    /// Trim and deduplicate all labels, drop non-finite tempo bounds
    pub fn normalize(&mut self) {
        self.min_bpm = self.min_bpm.filter(|bpm| bpm.is_finite());
        self.max_bpm = self.max_bpm.filter(|bpm| bpm.is_finite());
        normalize_terms(&mut self.any_genre_labels);
        normalize_terms(&mut self.all_hashtag_labels);
        normalize_terms(&mut self.all_comment_terms);
        normalize_terms(&mut self.any_comment_terms);
    }
}

/// Trim terms, drop empty ones and remove duplicates keeping the first one
pub fn normalize_terms(terms: &mut Vec<String>) {
    let mut normalized: Vec<String> = Vec::with_capacity(terms.len());
    for term in terms.drain(..) {
        let trimmed = term.trim();
        if trimmed.is_empty() || normalized.iter().any(|t| t == trimmed) {
            continue;
        }
        normalized.push(trimmed.to_string());
    }
    *terms = normalized;
}

/// Split free text on whitespace into normalized search terms
#[must_use]
pub fn split_search_text(text: &str) -> Vec<String> {
    let mut terms = text.split_whitespace().map(str::to_string).collect();
    normalize_terms(&mut terms);
    terms
}

/// A search against the tracks of one collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackQuery {
    /// Opaque base query with optional `filter` and `sort` members
    pub base_query: Map<String, Value>,
    pub overlay: OverlayFilter,
    pub search_terms: Vec<String>,
}

impl TrackQuery {
    #[must_use]
    pub fn new(base_query: Map<String, Value>) -> Self {
        Self {
            base_query,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_overlay(mut self, overlay: OverlayFilter) -> Self {
        self.overlay = overlay;
        self
    }

    /// Replace the search terms with the whitespace separated words of `text`
    #[must_use]
    pub fn with_search_text(mut self, text: &str) -> Self {
        self.search_terms = split_search_text(text);
        self
    }

    /// Set the `sort` member of the base query (e.g. `"+artist,-bpm"`)
    #[must_use]
    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.base_query
            .insert("sort".to_string(), Value::String(sort.into()));
        self
    }

    pub fn normalize(&mut self) {
        self.overlay.normalize();
        normalize_terms(&mut self.search_terms);
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// The base filter, if the base query carries a non-empty one
    #[must_use]
    pub fn base_filter(&self) -> Option<&Map<String, Value>> {
        self.base_query
            .get("filter")
            .and_then(Value::as_object)
            .filter(|filter| !filter.is_empty())
    }

    #[must_use]
    pub fn sort(&self) -> Option<&str> {
        self.base_query.get("sort").and_then(Value::as_str)
    }
}

/// Pagination cursor sent as `offset`/`limit` query parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Pagination {
    #[must_use]
    pub const fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// No pagination at all: everything starting from the first row
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            offset: 0,
            limit: None,
        }
    }

    #[must_use]
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(2);
        if self.offset > 0 || self.limit.is_some() {
            pairs.push(("offset".to_string(), self.offset.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}
