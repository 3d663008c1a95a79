//! The boundary to the search and bulk services.
//!
//! The query layer never talks to the network itself. It drives a
//! [`SearchService`] for paged searches, counts and fetches by id, and a
//! [`BulkService`] for mutations. Transport concerns (connection reuse,
//! authentication, retry with backoff) belong to the implementor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ordering::OrderBy;
use crate::restriction::Restriction;
use crate::schema::FieldPath;

/// Identifier of a record, with the change key when the service supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changekey: Option<String>,
}

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            changekey: None,
        }
    }

    pub fn with_changekey(mut self, changekey: impl Into<String>) -> Self {
        self.changekey = Some(changekey.into());
        self
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Identifier of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderId(pub String);

impl FolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The folders a query searches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Collection {
    pub folders: Vec<FolderId>,
}

impl Collection {
    pub fn folder(id: impl Into<String>) -> Self {
        Self {
            folders: vec![FolderId::new(id)],
        }
    }

    pub fn folders<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            folders: ids.into_iter().map(FolderId::new).collect(),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, folder) in self.folders.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", folder)?;
        }
        Ok(())
    }
}

/// A record as returned by the service, before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: ItemId,
    /// Type discriminant, e.g. `Message` or `CalendarItem`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    /// Field name to wire value.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(id: ItemId) -> Self {
        Self {
            id,
            item_type: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = Some(item_type.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Which fields a request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// The service's default field set.
    AllFields,
    /// Identifiers only.
    IdOnly,
    /// Exactly these fields, plus identifiers.
    Fields(Vec<FieldPath>),
}

impl Projection {
    pub fn is_id_only(&self) -> bool {
        matches!(self, Projection::IdOnly)
    }
}

/// What the service can do; consulted when planning a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Most sort fields the service honours in one request.
    pub max_sort_fields: usize,
    /// Whether `IgnoreCase` containment is supported.
    pub case_insensitive_match: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_sort_fields: 1,
            case_insensitive_match: true,
        }
    }
}

/// A calendar view over `[start, end]`.
///
/// Unlike a filter on `start` and `end`, a view expands recurring calendar
/// items into their occurrences. Every item overlapping the span is
/// returned, including items that end exactly at `start`. The service does
/// not sort views, so ordering a view always happens on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarView {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CalendarView {
    /// Whether an item spanning `[start, end]` falls in the view.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start <= self.end && end >= self.start
    }
}

impl fmt::Display for CalendarView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// One paged search request.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub collection: &'a Collection,
    pub restriction: &'a Restriction,
    pub projection: &'a Projection,
    /// Server-side sort; empty for unsorted.
    pub order: &'a [OrderBy],
    /// Calendar view to expand, instead of plain item paging.
    pub view: Option<&'a CalendarView>,
    pub offset: usize,
    pub page_size: usize,
}

/// One batch of search results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Where the next page starts; `None` when the server is exhausted.
    pub next_offset: Option<usize>,
    /// Total matches, when the server reports it.
    pub total: Option<usize>,
}

/// Per-identifier result of a bulk fetch.
pub type FetchResult = Result<RawRecord, ItemError>;

/// Paged search, count and fetch-by-id.
pub trait SearchService {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Fetches one page of matching records.
    fn find(&self, request: &PageRequest<'_>) -> Result<Page, TransportError>;

    /// Counts matching records without returning them.
    fn count(&self, collection: &Collection, restriction: &Restriction) -> Result<usize, TransportError>;

    /// Fetches records by identifier. The result has one entry per id, in
    /// request order.
    fn fetch(&self, ids: &[ItemId], projection: &Projection) -> Result<Vec<FetchResult>, TransportError>;
}

/// Bulk mutations. Results have one entry per id, in request order.
pub trait BulkService {
    fn delete(&self, ids: &[ItemId]) -> Result<Vec<Result<(), ItemError>>, TransportError>;

    /// Moves records; successes carry the record's new identifier.
    fn move_items(
        &self,
        ids: &[ItemId],
        to: &FolderId,
    ) -> Result<Vec<Result<ItemId, ItemError>>, TransportError>;
}

/// An error that applies to a whole request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("authorization failed: {0}")]
    Unauthorized(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The service asked the client to back off and retries were exhausted.
    #[error("server busy")]
    ServerBusy { retry_after_secs: Option<u64> },

    /// The target folder itself is invalid.
    #[error("invalid collection '{0}'")]
    InvalidCollection(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// A typed marker for a single record that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("item '{id}' not found")]
    NotFound { id: String },

    #[error("invalid item id '{id}'")]
    InvalidId { id: String },

    #[error("access denied to item '{id}'")]
    AccessDenied { id: String },

    #[error("{code} on item '{id}': {message}")]
    Other {
        id: String,
        code: String,
        message: String,
    },
}

impl ItemError {
    /// Identifier of the failed record.
    pub fn id(&self) -> &str {
        match self {
            ItemError::NotFound { id }
            | ItemError::InvalidId { id }
            | ItemError::AccessDenied { id }
            | ItemError::Other { id, .. } => id,
        }
    }
}
