//! Known collections and the active selection.
//!
//! The registry mirrors the last listing fetched from the backend and keeps
//! at most one of its entries active. The active uid is persisted through the
//! [`SettingsStore`] so it can be restored on the next run.

use crate::config::SettingsStore;
use crate::gateway::GatewayHandle;
use crate::query::Pagination;
use crate::task::{CompletionSender, TaskCompletion, TaskHandle, TaskId};
use serde_json::Value;
use std::time::Duration;

/// How track locations are addressed inside a collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PathKind {
    #[default]
    Uri = 0,
    Url = 1,
    FileUrl = 2,
    /// Relative to the collection's root URL
    VirtualFilePath = 3,
}

impl PathKind {
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Uri),
            1 => Some(Self::Url),
            2 => Some(Self::FileUrl),
            3 => Some(Self::VirtualFilePath),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentPath {
    pub path_kind: PathKind,
    pub root_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub uid: String,
    pub rev: Option<u64>,
    pub title: String,
    pub kind: Option<String>,
    pub notes: Option<String>,
    pub color: Option<String>,
    pub content_path: ContentPath,
}

fn optional_string(object: &Value, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Collection {
    /// Decode a `[header, body]` collection entity
    pub fn from_entity(entity: &Value) -> Result<Self, String> {
        let (header, body) = match entity.as_array().map(Vec::as_slice) {
            Some([header, body]) => (header, body),
            _ => return Err(format!("expected [header, body], got {entity}")),
        };
        let (uid, rev) = match header {
            Value::Array(parts) => (
                parts.first().and_then(Value::as_str),
                parts.get(1).and_then(Value::as_u64),
            ),
            Value::Object(_) => (
                header.get("uid").and_then(Value::as_str),
                header.get("rev").and_then(Value::as_u64),
            ),
            _ => (None, None),
        };
        let uid = uid
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| format!("missing collection uid in {header}"))?;
        if !body.is_object() {
            return Err(format!("expected collection object, got {body}"));
        }
        let content_path = body
            .pointer("/mediaSourceConfig/contentPath")
            .map(|config| ContentPath {
                path_kind: config
                    .get("pathKind")
                    .and_then(Value::as_i64)
                    .and_then(PathKind::from_code)
                    .unwrap_or_default(),
                root_url: optional_string(config, "rootUrl"),
            })
            .unwrap_or_default();
        Ok(Self {
            uid: uid.to_string(),
            rev,
            title: optional_string(body, "title").unwrap_or_default(),
            kind: optional_string(body, "kind"),
            notes: optional_string(body, "notes"),
            color: optional_string(body, "color"),
            content_path,
        })
    }
}

/// Decode a collection listing; any malformed entity fails the whole listing
pub fn decode_collections(content: &Value) -> Result<Vec<Collection>, String> {
    content
        .as_array()
        .ok_or_else(|| "expected an array of collections".to_string())?
        .iter()
        .map(Collection::from_entity)
        .collect()
}

/// Collection preferred when nothing was selected before: the first one
/// with virtual file paths, otherwise the first one with file URLs.
#[must_use]
pub fn fallback_selection(collections: &[Collection]) -> Option<&Collection> {
    [PathKind::VirtualFilePath, PathKind::FileUrl]
        .into_iter()
        .find_map(|kind| {
            collections
                .iter()
                .find(|collection| collection.content_path.path_kind == kind)
        })
}

/// What a registry update changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CollectionsChanged(u8);

impl CollectionsChanged {
    pub const ALL_COLLECTIONS: Self = Self(1);
    pub const ACTIVE_COLLECTION: Self = Self(2);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CollectionsChanged {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CollectionsChanged {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Default)]
pub struct CollectionRegistry {
    all: Vec<Collection>,
    active: Option<Collection>,
    pending_refresh: Option<TaskHandle>,
}

impl CollectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn all(&self) -> &[Collection] {
        &self.all
    }

    #[must_use]
    pub fn active(&self) -> Option<&Collection> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn active_uid(&self) -> Option<&str> {
        self.active.as_ref().map(|collection| collection.uid.as_str())
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.pending_refresh.is_some()
    }

    #[must_use]
    pub fn owns_task(&self, id: TaskId) -> bool {
        self.pending_refresh
            .as_ref()
            .is_some_and(|handle| handle.id() == id)
    }

    /// Fetch all collections of `kind`, superseding a refresh in flight
    pub fn refresh(
        &mut self,
        gateway: &GatewayHandle,
        kind: Option<&str>,
        timeout: Option<Duration>,
        reply_to: CompletionSender,
    ) -> TaskId {
        if let Some(previous) = self.pending_refresh.take() {
            previous.abort();
        }
        let handle = gateway
            .list_collections(kind, Pagination::unlimited())
            .start(timeout, reply_to);
        let id = handle.id();
        tracing::debug!(task_id = %id, kind = ?kind, "Refreshing collections");
        self.pending_refresh = Some(handle);
        id
    }

    /// Forget a refresh in flight, e.g. after a disconnect
    pub fn abort_refresh(&mut self) {
        if let Some(handle) = self.pending_refresh.take() {
            handle.abort();
        }
    }

    /// Handle the completion of a refresh task; completions of other tasks
    /// are ignored.
    pub fn on_task_completed(
        &mut self,
        completion: &TaskCompletion,
        store: &mut dyn SettingsStore,
    ) -> Option<CollectionsChanged> {
        if !self.owns_task(completion.id) {
            return None;
        }
        self.pending_refresh = None;
        let content = match &completion.outcome {
            Ok(content) => content,
            Err(failure) => {
                tracing::warn!(task_id = %completion.id, error = %failure, "Failed to load collections");
                return None;
            }
        };
        match decode_collections(content) {
            Ok(collections) => Some(self.apply_listing(collections, store)),
            Err(err) => {
                tracing::warn!(task_id = %completion.id, error = %err, "Invalid collections listing");
                None
            }
        }
    }

    /// Replace the known collections and re-validate the active selection
    pub fn apply_listing(
        &mut self,
        collections: Vec<Collection>,
        store: &mut dyn SettingsStore,
    ) -> CollectionsChanged {
        tracing::info!(count = collections.len(), "Loaded collections");
        self.all = collections;
        let mut changed = CollectionsChanged::ALL_COLLECTIONS;

        if let Some(active_uid) = self.active_uid().map(str::to_string) {
            match self.find(&active_uid).cloned() {
                Some(current) => self.active = Some(current),
                None => {
                    tracing::info!(collection_uid = %active_uid, "Active collection is gone");
                    self.active = None;
                    changed |= CollectionsChanged::ACTIVE_COLLECTION;
                }
            }
            return changed;
        }

        let restored = store
            .collection_uid()
            .and_then(|uid| self.find(&uid).cloned());
        let selected = restored.or_else(|| {
            let fallback = fallback_selection(&self.all).cloned();
            if fallback.is_none() {
                tracing::info!("No suitable collection available");
            }
            fallback
        });
        if let Some(collection) = selected {
            tracing::info!(collection_uid = %collection.uid, title = %collection.title, "Selected active collection");
            persist_selection(store, &collection.uid);
            self.active = Some(collection);
            changed |= CollectionsChanged::ACTIVE_COLLECTION;
        }
        changed
    }

    /// Make `uid` the active collection. Unknown uids clear the selection.
    pub fn select(
        &mut self,
        uid: &str,
        store: &mut dyn SettingsStore,
    ) -> Option<CollectionsChanged> {
        let selected = self.find(uid).cloned();
        if selected.is_none() {
            tracing::warn!(collection_uid = uid, "Cannot select unknown collection");
        }
        if self.active_uid() == selected.as_ref().map(|c| c.uid.as_str()) {
            return None;
        }
        if let Some(collection) = &selected {
            tracing::info!(collection_uid = %collection.uid, "Selected active collection");
            persist_selection(store, &collection.uid);
        }
        self.active = selected;
        Some(CollectionsChanged::ACTIVE_COLLECTION)
    }

    /// Forget everything, e.g. after the backend is gone
    pub fn clear(&mut self) -> Option<CollectionsChanged> {
        self.abort_refresh();
        let mut changed = CollectionsChanged::default();
        if !self.all.is_empty() {
            self.all.clear();
            changed |= CollectionsChanged::ALL_COLLECTIONS;
        }
        if self.active.take().is_some() {
            changed |= CollectionsChanged::ACTIVE_COLLECTION;
        }
        (!changed.is_empty()).then_some(changed)
    }

    fn find(&self, uid: &str) -> Option<&Collection> {
        self.all.iter().find(|collection| collection.uid == uid)
    }
}

fn persist_selection(store: &mut dyn SettingsStore, uid: &str) {
    if let Err(err) = store.set_collection_uid(uid) {
        tracing::warn!(collection_uid = uid, error = %err, "Failed to persist selected collection");
    }
}
