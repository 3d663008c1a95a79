//! In-process fake search backend for mailquery.
//!
//! [`FakeMailbox`] implements [`SearchService`] and [`BulkService`] over an
//! in-memory list of raw records. It behaves like a real server in the ways
//! query sets care about:
//!
//! - the server part of a restriction is evaluated, the residual is not
//! - server-side ordering honours the first order clause only
//! - complex fields are never returned by `find`, only by `fetch`
//! - a calendar view keeps items whose `start`/`end` span overlaps it
//! - pages report the next offset until the matches are exhausted
//!
//! Every call is recorded so tests can assert on network behaviour.
//!
//! ```
//! use std::sync::Arc;
//! use mailquery::{Collection, QuerySet};
//! use mailquery_test::{numbered_messages, Call, FakeMailbox};
//!
//! let mailbox = Arc::new(FakeMailbox::new(numbered_messages(3)));
//! let qs = QuerySet::new(Arc::clone(&mailbox), Collection::folder("inbox"));
//!
//! assert_eq!(qs.to_vec().unwrap().len(), 3);
//! assert_eq!(mailbox.find_count(), 1);
//! assert!(matches!(mailbox.calls()[0], Call::Find { offset: 0, .. }));
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use mailquery::{
    BulkService, CalendarView, Capabilities, Collection, DecodedRecord, Decoder, FetchResult, FieldSource,
    FolderId, ItemError, ItemId, OrderBy, Page, PageRequest, Projection, RawRecord, Restriction,
    SchemaTable, SearchService, TransportError,
};
use serde_json::json;

/// One simulated network call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Find {
        offset: usize,
        page_size: usize,
        projection: Projection,
        order: Vec<OrderBy>,
        /// Whether a server restriction was sent.
        restricted: bool,
    },
    Count,
    Fetch { ids: Vec<String> },
    Delete { ids: Vec<String> },
    Move { ids: Vec<String>, to: String },
}

/// A fake mailbox holding one folder of records.
pub struct FakeMailbox {
    schema: SchemaTable,
    folder: FolderId,
    records: RefCell<Vec<RawRecord>>,
    calls: RefCell<Vec<Call>>,
    failures: RefCell<VecDeque<TransportError>>,
    capabilities: Capabilities,
}

impl FakeMailbox {
    /// A mailbox with the built-in schema and a single folder named `inbox`.
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            schema: SchemaTable::mailbox(),
            folder: FolderId::new("inbox"),
            records: RefCell::new(records),
            calls: RefCell::new(Vec::new()),
            failures: RefCell::new(VecDeque::new()),
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_schema(mut self, schema: SchemaTable) -> Self {
        self.schema = schema;
        self
    }

    /// The next call fails with `err` instead of answering.
    pub fn fail_next(&self, err: TransportError) {
        self.failures.borrow_mut().push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn find_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, Call::Find { .. }))
            .count()
    }

    /// Page sizes of every `find` call, in order.
    pub fn find_page_sizes(&self) -> Vec<usize> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Find { page_size, .. } => Some(*page_size),
                _ => None,
            })
            .collect()
    }

    /// Identifiers currently stored.
    pub fn ids(&self) -> Vec<String> {
        self.records.borrow().iter().map(|r| r.id.id.clone()).collect()
    }

    fn record(&self, call: Call) -> Result<(), TransportError> {
        self.calls.borrow_mut().push(call);
        match self.failures.borrow_mut().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_collection(&self, collection: &Collection) -> Result<(), TransportError> {
        if collection.folders.contains(&self.folder) {
            Ok(())
        } else {
            Err(TransportError::InvalidCollection(collection.to_string()))
        }
    }

    /// Matching records, decoded alongside their raw form.
    fn matching(
        &self,
        restriction: &Restriction,
        view: Option<&CalendarView>,
    ) -> Result<Vec<(DecodedRecord, RawRecord)>, TransportError> {
        let decoder = Decoder::new(&self.schema);
        let mut out = Vec::new();
        for raw in self.records.borrow().iter() {
            let decoded = decoder
                .decode(raw.clone())
                .map_err(|e| TransportError::Other(format!("fixture does not decode: {}", e)))?;
            let server_ok = restriction
                .server
                .as_ref()
                .map_or(true, |expr| expr.matches(&decoded));
            let query_ok = restriction
                .query_string
                .as_deref()
                .map_or(true, |q| query_string_matches(&decoded, q));
            let view_ok = view.map_or(true, |view| in_view(&decoded, view));
            if server_ok && query_ok && view_ok {
                out.push((decoded, raw.clone()));
            }
        }
        Ok(out)
    }

    fn is_complex(&self, name: &str) -> bool {
        self.schema.field(name).is_some_and(|d| d.complex)
    }

    fn project(&self, raw: &RawRecord, projection: &Projection, keep_complex: bool) -> RawRecord {
        let mut out = RawRecord::new(raw.id.clone());
        out.item_type = raw.item_type.clone();
        if projection.is_id_only() {
            return out;
        }
        for (name, value) in &raw.fields {
            if !keep_complex && self.is_complex(name) {
                continue;
            }
            let wanted = match projection {
                Projection::Fields(paths) => paths.iter().any(|p| &p.field == name),
                _ => true,
            };
            if wanted {
                out.fields.insert(name.clone(), value.clone());
            }
        }
        out
    }

    fn check_id(&self, id: &ItemId) -> Result<usize, ItemError> {
        if id.id.is_empty() || id.id.starts_with('!') {
            return Err(ItemError::InvalidId { id: id.id.clone() });
        }
        self.records
            .borrow()
            .iter()
            .position(|r| r.id.id == id.id)
            .ok_or_else(|| ItemError::NotFound { id: id.id.clone() })
    }
}

/// Calendar items overlapping the view; anything without a span is left out.
fn in_view(record: &DecodedRecord, view: &CalendarView) -> bool {
    let at = |name: &str| {
        record
            .field_value(&mailquery::FieldPath::new(name))
            .and_then(|v| v.as_datetime())
    };
    match (at("start"), at("end")) {
        (Some(start), Some(end)) => view.overlaps(start, end),
        _ => false,
    }
}

/// A query string matches when the subject contains it, ignoring case.
fn query_string_matches(record: &DecodedRecord, query: &str) -> bool {
    let subject = mailquery::FieldPath::new("subject");
    record
        .field_value(&subject)
        .and_then(|v| v.as_str())
        .is_some_and(|s| s.to_lowercase().contains(&query.to_lowercase()))
}

impl SearchService for FakeMailbox {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn find(&self, request: &PageRequest<'_>) -> Result<Page, TransportError> {
        self.record(Call::Find {
            offset: request.offset,
            page_size: request.page_size,
            projection: request.projection.clone(),
            order: request.order.to_vec(),
            restricted: request.restriction.server.is_some(),
        })?;
        self.check_collection(request.collection)?;
        if request.order.len() > self.capabilities.max_sort_fields {
            return Err(TransportError::MalformedRequest(format!(
                "at most {} sort fields",
                self.capabilities.max_sort_fields
            )));
        }

        if request.view.is_some() && !request.order.is_empty() {
            return Err(TransportError::MalformedRequest(
                "calendar views cannot be sorted".into(),
            ));
        }
        let mut matches = self.matching(request.restriction, request.view)?;
        if let Some(order) = request.order.first() {
            matches.sort_by(|(a, _), (b, _)| order.compare(a, b));
        }
        let total = matches.len();
        let records: Vec<RawRecord> = matches
            .iter()
            .skip(request.offset)
            .take(request.page_size)
            .map(|(_, raw)| self.project(raw, request.projection, false))
            .collect();
        let end = request.offset + records.len();
        let next_offset = (end < total).then_some(end);
        tracing::trace!(offset = request.offset, returned = records.len(), total, "fake find");
        Ok(Page {
            records,
            next_offset,
            total: Some(total),
        })
    }

    fn count(&self, collection: &Collection, restriction: &Restriction) -> Result<usize, TransportError> {
        self.record(Call::Count)?;
        self.check_collection(collection)?;
        Ok(self.matching(restriction, None)?.len())
    }

    fn fetch(&self, ids: &[ItemId], projection: &Projection) -> Result<Vec<FetchResult>, TransportError> {
        self.record(Call::Fetch {
            ids: ids.iter().map(|id| id.id.clone()).collect(),
        })?;
        Ok(ids
            .iter()
            .map(|id| -> FetchResult {
                let index = self.check_id(id)?;
                Ok(self.project(&self.records.borrow()[index], projection, true))
            })
            .collect())
    }
}

impl BulkService for FakeMailbox {
    fn delete(&self, ids: &[ItemId]) -> Result<Vec<Result<(), ItemError>>, TransportError> {
        self.record(Call::Delete {
            ids: ids.iter().map(|id| id.id.clone()).collect(),
        })?;
        Ok(ids
            .iter()
            .map(|id| -> Result<(), ItemError> {
                let index = self.check_id(id)?;
                self.records.borrow_mut().remove(index);
                Ok(())
            })
            .collect())
    }

    fn move_items(
        &self,
        ids: &[ItemId],
        to: &FolderId,
    ) -> Result<Vec<Result<ItemId, ItemError>>, TransportError> {
        self.record(Call::Move {
            ids: ids.iter().map(|id| id.id.clone()).collect(),
            to: to.to_string(),
        })?;
        Ok(ids
            .iter()
            .map(|id| -> Result<ItemId, ItemError> {
                let index = self.check_id(id)?;
                let moved = self.records.borrow_mut().remove(index);
                Ok(ItemId::new(format!("{}@{}", moved.id.id, to)))
            })
            .collect())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// The collection every fake mailbox serves.
pub fn inbox() -> Collection {
    Collection::folder("inbox")
}

/// Midnight UTC on 2024-01-01 plus `minutes`.
pub fn at_minute(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
        + Duration::minutes(minutes)
}

fn wire_datetime(dt: DateTime<Utc>) -> serde_json::Value {
    json!(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// A message with an id and subject.
pub fn message(id: &str, subject: &str) -> RawRecord {
    RawRecord::new(ItemId::new(id).with_changekey(format!("ck-{}", id)))
        .with_type("Message")
        .with_field("subject", json!(subject))
}

/// `n` messages `m000`, `m001`, ... with increasing size and received time.
///
/// Even-numbered messages are read; every third has the `work` category;
/// each carries a body, which is a complex field.
pub fn numbered_messages(n: usize) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            let categories = if i % 3 == 0 { json!(["work"]) } else { json!([]) };
            message(&format!("m{:03}", i), &format!("message {:03}", i))
                .with_field("size", json!(i * 10))
                .with_field("is_read", json!(i % 2 == 0))
                .with_field("datetime_received", wire_datetime(at_minute(i as i64)))
                .with_field("categories", categories)
                .with_field("importance", json!("Normal"))
                .with_field("body", json!(format!("body of message {}", i)))
        })
        .collect()
}

/// Messages with a category and a size, for multi-key ordering.
pub fn ranked_messages(rows: &[(&str, &str, i64)]) -> Vec<RawRecord> {
    rows.iter()
        .map(|(id, importance, size)| {
            message(id, id)
                .with_field("importance", json!(importance))
                .with_field("size", json!(size))
        })
        .collect()
}

/// A contact with a mobile number and a home city.
pub fn contact(id: &str, name: &str, mobile: &str, city: &str) -> RawRecord {
    RawRecord::new(ItemId::new(id))
        .with_type("Contact")
        .with_field("display_name", json!(name))
        .with_field("phone_numbers", json!({ "MobilePhone": mobile }))
        .with_field("physical_addresses", json!({ "Home": { "city": city } }))
}

/// A calendar item spanning `start` to `end`, in minutes from [`at_minute`].
pub fn event(id: &str, subject: &str, start: i64, end: i64) -> RawRecord {
    RawRecord::new(ItemId::new(id))
        .with_type("CalendarItem")
        .with_field("subject", json!(subject))
        .with_field("start", wire_datetime(at_minute(start)))
        .with_field("end", wire_datetime(at_minute(end)))
}
