//! The paging cursor: drives successive page requests against a
//! [`SearchService`] and yields decoded records.
//!
//! Pages are fetched only when the consumer asks for the next record. The
//! cursor stops when the server reports no further pages or when `max_items`
//! results have been yielded. When the restriction has a residual, every
//! record is checked against it before being yielded, so the number of pages
//! fetched is not bounded by the number of results.
//!
//! Transport errors end the cursor. Retries belong to the service.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{QueryError, Result};
use crate::materialize::{DecodedRecord, Decoder};
use crate::ordering::OrderBy;
use crate::restriction::Restriction;
use crate::schema::SchemaTable;
use crate::service::{
    CalendarView, Collection, ItemId, PageRequest, Projection, SearchService, TransportError,
};

static ID_ONLY: Projection = Projection::IdOnly;

/// A resumable, pull-based page loop.
pub struct PagingCursor<S: SearchService + ?Sized> {
    service: Arc<S>,
    schema: Arc<SchemaTable>,
    collection: Collection,
    restriction: Restriction,
    projection: Projection,
    /// When set, search returns ids only and full records come from `fetch`.
    fetch_projection: Option<Projection>,
    order: Vec<OrderBy>,
    view: Option<CalendarView>,
    page_size: usize,
    offset: usize,
    max_items: Option<usize>,
    yielded: usize,
    pages: usize,
    buffer: VecDeque<Result<DecodedRecord>>,
    done: bool,
}

impl<S: SearchService + ?Sized> PagingCursor<S> {
    /// A cursor over every record in `collection` matching `restriction`,
    /// with all fields, the default page size and no limit.
    pub fn new(
        service: Arc<S>,
        schema: Arc<SchemaTable>,
        collection: Collection,
        restriction: Restriction,
    ) -> Self {
        Self {
            service,
            schema,
            collection,
            restriction,
            projection: Projection::AllFields,
            fetch_projection: None,
            order: Vec::new(),
            view: None,
            page_size: crate::config::DEFAULT_PAGE_SIZE,
            offset: 0,
            max_items: None,
            yielded: 0,
            pages: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Fields to request in each search page.
    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Searches for ids only, then fetches each page of records by id with
    /// `projection`.
    pub fn fetch_by_id(mut self, projection: Projection) -> Self {
        self.fetch_projection = Some(projection);
        self
    }

    /// Server-side sort order.
    pub fn order(mut self, order: Vec<OrderBy>) -> Self {
        self.order = order;
        self
    }

    /// Records per search request. Zero is treated as one.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Expands a calendar view instead of paging plain items.
    pub fn view(mut self, view: Option<CalendarView>) -> Self {
        self.view = view;
        self
    }

    /// Server offset of the first record.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Stops after this many yielded results.
    pub fn max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    /// Number of search pages requested so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn remaining(&self) -> Option<usize> {
        self.max_items.map(|max| max.saturating_sub(self.yielded))
    }

    fn fetch_page(&mut self) -> Result<()> {
        let mut page_size = self.page_size;
        if self.restriction.residual.is_none() {
            if let Some(remaining) = self.remaining() {
                page_size = page_size.min(remaining);
            }
        }
        let search_projection = if self.fetch_projection.is_some() {
            &ID_ONLY
        } else {
            &self.projection
        };
        let request = PageRequest {
            collection: &self.collection,
            restriction: &self.restriction,
            projection: search_projection,
            order: &self.order,
            view: self.view.as_ref(),
            offset: self.offset,
            page_size,
        };
        tracing::debug!(
            offset = self.offset,
            page_size,
            max_items = ?self.max_items,
            "requesting page"
        );
        let page = self.service.find(&request)?;
        self.pages += 1;

        let received = page.records.len();
        tracing::debug!(
            records = received,
            next_offset = ?page.next_offset,
            total = ?page.total,
            "received page"
        );
        match page.next_offset {
            Some(next) if received > 0 => {
                let expected = self.offset + received;
                if next != expected {
                    tracing::warn!(
                        expected,
                        next,
                        "paging offset mismatch; the folder changed while paging"
                    );
                }
                self.offset = next;
            }
            _ => self.done = true,
        }

        let decoder = Decoder::new(&self.schema);
        let records: Vec<Result<_>> = match &self.fetch_projection {
            Some(projection) => {
                let ids: Vec<ItemId> = page.records.into_iter().map(|r| r.id).collect();
                if ids.is_empty() {
                    Vec::new()
                } else {
                    let fetched = self.service.fetch(&ids, projection)?;
                    if fetched.len() != ids.len() {
                        return Err(TransportError::MalformedResponse(format!(
                            "fetch returned {} results for {} ids",
                            fetched.len(),
                            ids.len()
                        ))
                        .into());
                    }
                    fetched
                        .into_iter()
                        .map(|result| match result {
                            Ok(raw) => Ok(raw),
                            Err(source) => Err(QueryError::Item {
                                id: source.id().to_string(),
                                source,
                            }),
                        })
                        .collect()
                }
            }
            None => page.records.into_iter().map(Ok).collect(),
        };

        for raw in records {
            let decoded = raw.and_then(|raw| decoder.decode(raw).map_err(QueryError::from));
            match decoded {
                Ok(record) if !self.restriction.residual_matches(&record) => {}
                other => self.buffer.push_back(other),
            }
        }
        Ok(())
    }
}

impl<S: SearchService + ?Sized> Iterator for PagingCursor<S> {
    type Item = Result<DecodedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining() == Some(0) {
                return None;
            }
            if let Some(record) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(record);
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.done = true;
                self.buffer.clear();
                return Some(Err(err));
            }
        }
    }
}
