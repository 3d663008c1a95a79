//! The lazy, chainable query set.
//!
//! A [`QuerySet`] is an immutable descriptor: a collection, a filter, a
//! projection, an ordering and a page size. Chaining methods return a new
//! query set with an empty cache and never touch the network. Terminal
//! methods plan the query (compile the restriction, decide between server
//! and client sorting, pick a projection) and drive a [`PagingCursor`].
//!
//! # Caching
//!
//! The first complete pass of [`QuerySet::iter`] stores the results; later
//! passes replay them without network activity. [`QuerySet::iterator`]
//! never reads or fills the cache. The cache lives in a `RefCell`, so a
//! query set is not `Sync`; derive separate query sets per thread instead.
//!
//! # Efficiency cliffs
//!
//! These are correct but fetch more than the result needs:
//!
//! - ordering by more fields than the service can sort, or by a field it
//!   cannot sort, fetches every match and sorts on the client;
//! - negative indices and slice bounds issue a count request first;
//! - a slice step other than 1 materializes the whole result;
//! - a filter with a client-side residual pages until enough records pass;
//! - without [`only`](QuerySet::only), records are searched by id and then
//!   fetched by id when the schema has complex fields, since a search never
//!   returns them. Listing plain fields in `only` keeps one request per page;
//! - a calendar view is filtered and ordered entirely on the client.
//!
//! ```
//! use std::sync::Arc;
//! use mailquery::{q, Collection, QuerySet};
//! # use mailquery::{
//! #     FetchResult, ItemId, Page, PageRequest, Projection, Restriction,
//! #     SearchService, TransportError,
//! # };
//! # struct Empty;
//! # impl SearchService for Empty {
//! #     fn find(&self, _: &PageRequest<'_>) -> Result<Page, TransportError> { Ok(Page::default()) }
//! #     fn count(&self, _: &Collection, _: &Restriction) -> Result<usize, TransportError> { Ok(0) }
//! #     fn fetch(&self, _: &[ItemId], _: &Projection) -> Result<Vec<FetchResult>, TransportError> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//! let inbox = QuerySet::new(Arc::new(Empty), Collection::folder("inbox"));
//! let unread = inbox
//!     .filter(q!(is_read = false)?)?
//!     .order_by(&["-datetime_received"])?;
//! assert_eq!(unread.count()?, 0);
//! # Ok::<(), mailquery::QueryError>(())
//! ```

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::bulk;
use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::expr::{and_of, not_of, Expr, Filter};
use crate::materialize::{DecodedRecord, Decoder, Flat, Items, Shape, Values, ValuesList};
use crate::ordering::{sort_records, OrderBy};
use crate::paging::PagingCursor;
use crate::restriction::{Restriction, RestrictionCompiler};
use crate::schema::{FieldPath, SchemaTable};
use crate::service::{
    BulkService, CalendarView, Collection, FolderId, ItemError, ItemId, Projection, SearchService,
    TransportError,
};
use crate::slice::Slice;

/// Execution state of a query set's result cache.
enum State<T> {
    /// Never fully iterated.
    Pending,
    /// A caching iteration is in progress.
    Executing,
    Cached(Vec<T>),
}

/// A lazy, chainable query over a collection.
///
/// `S` is the search service. `M` is the output shape: typed
/// [`Item`](crate::Item)s by default, or plain values after
/// [`values`](QuerySet::values) and friends.
pub struct QuerySet<S: SearchService + ?Sized, M: Shape = Items> {
    service: Arc<S>,
    schema: Arc<SchemaTable>,
    collection: Collection,
    filter: Filter,
    only: Vec<FieldPath>,
    order: Vec<OrderBy>,
    view: Option<CalendarView>,
    page_size: usize,
    config: QueryConfig,
    shape: M,
    state: RefCell<State<M::Output>>,
}

impl<S: SearchService + ?Sized, M: Shape> Clone for QuerySet<S, M> {
    /// Copies the descriptor. The copy starts with an empty cache.
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            schema: Arc::clone(&self.schema),
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            only: self.only.clone(),
            order: self.order.clone(),
            view: self.view,
            page_size: self.page_size,
            config: self.config.clone(),
            shape: self.shape.clone(),
            state: RefCell::new(State::Pending),
        }
    }
}

impl<S: SearchService + ?Sized> QuerySet<S, Items> {
    /// A query set over `collection` using the built-in mailbox schema and
    /// the global configuration.
    pub fn new(service: Arc<S>, collection: Collection) -> Self {
        Self::with_schema(service, Arc::new(SchemaTable::mailbox()), collection)
    }

    /// A query set over `collection` using a custom schema, for services
    /// whose fields differ from the built-in mailbox table.
    pub fn with_schema(service: Arc<S>, schema: Arc<SchemaTable>, collection: Collection) -> Self {
        let config = QueryConfig::global();
        Self {
            service,
            schema,
            collection,
            filter: Filter::default(),
            only: Vec::new(),
            order: Vec::new(),
            view: None,
            page_size: config.page_size,
            config,
            shape: Items,
            state: RefCell::new(State::Pending),
        }
    }
}

/// Offset and limit of the results a terminal operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    offset: usize,
    limit: Option<usize>,
}

impl Window {
    const ALL: Window = Window {
        offset: 0,
        limit: None,
    };
}

/// How a query will run.
struct Plan {
    restriction: Restriction,
    server_order: Vec<OrderBy>,
    /// Non-empty when sorting happens on the client.
    client_order: Vec<OrderBy>,
    projection: Projection,
    /// Search for ids, then fetch records by id.
    fetch_by_id: bool,
    /// Fields to keep when extra fields were fetched for sorting or
    /// residual filtering.
    keep: Option<BTreeSet<String>>,
}

impl<S: SearchService + ?Sized, M: Shape> QuerySet<S, M> {
    fn derive<N: Shape>(&self, shape: N) -> QuerySet<S, N> {
        QuerySet {
            service: Arc::clone(&self.service),
            schema: Arc::clone(&self.schema),
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            only: self.only.clone(),
            order: self.order.clone(),
            view: self.view,
            page_size: self.page_size,
            config: self.config.clone(),
            shape,
            state: RefCell::new(State::Pending),
        }
    }

    // =========================================================================
    // Chaining
    // =========================================================================

    /// A copy without new restrictions.
    pub fn all(&self) -> Self {
        self.clone()
    }

    /// A query set that matches nothing and never contacts the service.
    pub fn none(&self) -> Self {
        let mut qs = self.clone();
        qs.filter = Filter::Nothing;
        qs
    }

    /// ANDs `expr` onto the filter.
    ///
    /// # Errors
    ///
    /// Construction-time errors for unknown fields or incompatible lookups,
    /// and [`QueryError::InvalidArgument`] when combined with a query string.
    pub fn filter(&self, expr: Expr) -> Result<Self> {
        expr.validate(&self.schema)?;
        let mut qs = self.clone();
        qs.filter = self.filter.clone().and(expr)?;
        Ok(qs)
    }

    /// ANDs the negation of `expr` onto the filter.
    pub fn exclude(&self, expr: Expr) -> Result<Self> {
        self.filter(not_of(expr))
    }

    /// Filters by a server-native query string instead of lookups.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] when lookups, another query string
    /// or a calendar view are already present.
    pub fn filter_query_string(&self, query: &str) -> Result<Self> {
        if self.view.is_some() {
            return Err(QueryError::InvalidArgument(
                "a query string cannot be combined with a calendar view".into(),
            ));
        }
        let mut qs = self.clone();
        qs.filter = self.filter.clone().with_query_string(query)?;
        Ok(qs)
    }

    /// Restricts the fields fetched for each record.
    pub fn only(&self, paths: &[&str]) -> Result<Self> {
        let mut qs = self.clone();
        qs.only = self.parse_paths(paths, "only()")?;
        Ok(qs)
    }

    /// Sets the ordering. A leading `-` sorts descending.
    ///
    /// Multi-field orderings beyond what the service can sort, and fields the
    /// service cannot sort, are sorted on the client after fetching every
    /// match.
    pub fn order_by(&self, keys: &[&str]) -> Result<Self> {
        let order = keys
            .iter()
            .map(|key| OrderBy::parse(key, &self.schema))
            .collect::<Result<Vec<_>>>()?;
        let mut qs = self.clone();
        qs.order = order;
        Ok(qs)
    }

    /// Inverts every ordering clause.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] when no ordering is set.
    pub fn reverse(&self) -> Result<Self> {
        if self.order.is_empty() {
            return Err(QueryError::InvalidArgument(
                "reverse() requires an ordering".into(),
            ));
        }
        let mut qs = self.clone();
        qs.order = self.order.iter().map(OrderBy::reverse).collect();
        Ok(qs)
    }

    /// Restricts the query to a calendar view over `[start, end]`.
    ///
    /// Recurring items are expanded into occurrences, and every item that
    /// overlaps the span is returned. The service neither sorts nor filters
    /// views, so any ordering and lookups on the query set are applied on the
    /// client.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] when `end` precedes `start` or the
    /// query set filters by a query string.
    pub fn view(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(QueryError::InvalidArgument(format!(
                "calendar view ends ({}) before it starts ({})",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        if let Filter::QueryString(_) = self.filter {
            return Err(QueryError::InvalidArgument(
                "a query string cannot be combined with a calendar view".into(),
            ));
        }
        let mut qs = self.clone();
        qs.view = Some(CalendarView { start, end });
        Ok(qs)
    }

    /// Overrides the page size for this query set.
    pub fn page_size(&self, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(QueryError::InvalidArgument(
                "page size must be positive".into(),
            ));
        }
        let mut qs = self.clone();
        qs.page_size = page_size;
        Ok(qs)
    }

    /// Results as maps from path to value.
    pub fn values(&self, paths: &[&str]) -> Result<QuerySet<S, Values>> {
        let paths = self.value_paths(paths, "values()")?;
        let mut qs = self.derive(Values {
            paths: paths.clone(),
        });
        qs.only = paths;
        Ok(qs)
    }

    /// Results as value tuples in path order.
    pub fn values_list(&self, paths: &[&str]) -> Result<QuerySet<S, ValuesList>> {
        let paths = self.value_paths(paths, "values_list()")?;
        let mut qs = self.derive(ValuesList {
            paths: paths.clone(),
        });
        qs.only = paths;
        Ok(qs)
    }

    /// Results as bare values of a single path.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] unless exactly one path is given.
    pub fn values_list_flat(&self, paths: &[&str]) -> Result<QuerySet<S, Flat>> {
        let [path] = paths else {
            return Err(QueryError::InvalidArgument(
                "flat values_list() takes exactly one field".into(),
            ));
        };
        let path = self.schema.parse_path(path, "values_list()")?;
        let mut qs = self.derive(Flat { path: path.clone() });
        qs.only = vec![path];
        Ok(qs)
    }

    fn parse_paths(&self, paths: &[&str], context: &str) -> Result<Vec<FieldPath>> {
        paths
            .iter()
            .map(|p| self.schema.parse_path(p, context))
            .collect()
    }

    fn value_paths(&self, paths: &[&str], context: &str) -> Result<Vec<FieldPath>> {
        if paths.is_empty() {
            return Err(QueryError::InvalidArgument(format!(
                "{} requires at least one field",
                context
            )));
        }
        self.parse_paths(paths, context)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// The accumulated filter.
    pub fn filter_expr(&self) -> &Filter {
        &self.filter
    }

    /// Ordering clauses, as given to [`order_by`](QuerySet::order_by).
    pub fn ordering(&self) -> &[OrderBy] {
        &self.order
    }

    /// The folders this query searches.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// The calendar view, if one is set.
    pub fn calendar_view(&self) -> Option<&CalendarView> {
        self.view.as_ref()
    }

    /// Configuration captured when the query set was created.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Whether a full iteration has populated the cache.
    pub fn is_cached(&self) -> bool {
        matches!(*self.state.borrow(), State::Cached(_))
    }

    /// Drops cached results.
    pub fn invalidate(&self) {
        *self.state.borrow_mut() = State::Pending;
    }

    // =========================================================================
    // Planning
    // =========================================================================

    fn plan(&self) -> Result<Plan> {
        let caps = self.service.capabilities();
        let mut restriction =
            RestrictionCompiler::new(&self.schema, &caps).compile(&self.filter)?;
        if self.view.is_some() {
            if let Some(server) = restriction.server.take() {
                tracing::debug!(filter = %server, "calendar view; filtering on the client");
                restriction.residual = Some(match restriction.residual.take() {
                    Some(residual) => and_of([server, residual]),
                    None => server,
                });
                restriction.xml = None;
            }
        }

        let server_sortable = self.view.is_none()
            && self.order.len() <= caps.max_sort_fields
            && self.order.iter().all(|o| {
                o.path.label.is_none() && self.schema.resolve(&o.path).is_some_and(|d| d.sortable)
            });
        let (server_order, client_order) = if server_sortable {
            (self.order.clone(), Vec::new())
        } else {
            tracing::debug!(
                order = ?self.order.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "ordering on the client; fetching every match"
            );
            (Vec::new(), self.order.clone())
        };

        let (projection, keep) = if self.only.is_empty() {
            (Projection::AllFields, None)
        } else {
            let requested: BTreeSet<FieldPath> = self
                .only
                .iter()
                .map(|p| FieldPath::new(p.field.clone()))
                .collect();
            let mut fields = requested.clone();
            if let Some(residual) = &restriction.residual {
                fields.extend(residual.field_paths());
            }
            fields.extend(client_order.iter().map(|o| FieldPath::new(o.path.field.clone())));
            let keep = (fields.len() > requested.len())
                .then(|| requested.into_iter().map(|p| p.field).collect());
            (Projection::Fields(fields.into_iter().collect()), keep)
        };
        // A search never returns complex fields, so asking for every field
        // means fetching records by id whenever the schema has any.
        let fetch_by_id = match &projection {
            Projection::Fields(fields) => self.schema.has_complex_fields(fields),
            Projection::AllFields => self.schema.fields().any(|def| def.complex),
            Projection::IdOnly => false,
        };

        Ok(Plan {
            restriction,
            server_order,
            client_order,
            projection,
            fetch_by_id,
            keep,
        })
    }

    fn cursor(&self, plan: &Plan, order: Vec<OrderBy>) -> PagingCursor<S> {
        let cursor = PagingCursor::new(
            Arc::clone(&self.service),
            Arc::clone(&self.schema),
            self.collection.clone(),
            plan.restriction.clone(),
        )
        .order(order)
        .view(self.view)
        .page_size(self.page_size);
        if plan.fetch_by_id {
            cursor.fetch_by_id(plan.projection.clone())
        } else {
            cursor.projection(plan.projection.clone())
        }
    }

    /// A cursor that fetches only ids plus the fields the residual needs.
    fn id_cursor(&self, plan: &Plan, page_size: usize) -> PagingCursor<S> {
        let projection = match &plan.restriction.residual {
            Some(residual) => Projection::Fields(residual.field_paths().into_iter().collect()),
            None => Projection::IdOnly,
        };
        let cursor = PagingCursor::new(
            Arc::clone(&self.service),
            Arc::clone(&self.schema),
            self.collection.clone(),
            plan.restriction.clone(),
        )
        .view(self.view)
        .page_size(page_size);
        match projection {
            Projection::Fields(fields) if self.schema.has_complex_fields(&fields) => {
                cursor.fetch_by_id(Projection::Fields(fields))
            }
            projection => cursor.projection(projection),
        }
    }

    fn execute(&self, window: Window) -> Result<Execution<S, M>> {
        let mut exec = Execution {
            source: Source::Empty,
            skip: 0,
            shape: self.shape.clone(),
            keep: None,
            generic_fallback: self.config.generic_item_fallback,
        };
        if let Filter::Nothing = self.filter {
            return Ok(exec);
        }
        let plan = self.plan()?;
        exec.keep = plan.keep.clone();

        if !plan.client_order.is_empty() {
            let mut records = Vec::new();
            let mut failures: Vec<Result<DecodedRecord>> = Vec::new();
            for record in self.cursor(&plan, Vec::new()) {
                match record {
                    Ok(record) => records.push(record),
                    Err(err @ QueryError::Item { .. }) => failures.push(Err(err)),
                    Err(err) => return Err(err),
                }
            }
            sort_records(&mut records, &plan.client_order);
            let selected: Vec<_> = records
                .into_iter()
                .map(Ok)
                .chain(failures)
                .skip(window.offset)
                .take(window.limit.unwrap_or(usize::MAX))
                .collect();
            exec.source = Source::Sorted(selected.into_iter());
        } else if plan.restriction.residual.is_some() {
            // The server offset counts records before client-side filtering.
            let max_items = window.limit.map(|limit| limit + window.offset);
            let cursor = self.cursor(&plan, plan.server_order.clone()).max_items(max_items);
            exec.skip = window.offset;
            exec.source = Source::Cursor(cursor);
        } else {
            let cursor = self
                .cursor(&plan, plan.server_order.clone())
                .offset(window.offset)
                .max_items(window.limit);
            exec.source = Source::Cursor(cursor);
        }
        Ok(exec)
    }

    // =========================================================================
    // Terminal operations
    // =========================================================================

    /// Iterates the results, filling the cache on a complete pass and
    /// replaying it afterwards.
    ///
    /// No request is made until the first call to `next()`. Dropping the
    /// iterator early leaves the cache empty.
    pub fn iter(&self) -> Rows<'_, S, M> {
        let mode = match *self.state.borrow() {
            State::Cached(_) => Mode::Replay(0),
            // Nested iteration while another pass fills the cache.
            State::Executing => Mode::Uncached(None),
            State::Pending => Mode::Filling {
                exec: None,
                buffer: Vec::new(),
                tainted: false,
            },
        };
        if let Mode::Filling { .. } = mode {
            *self.state.borrow_mut() = State::Executing;
        }
        Rows { qs: self, mode }
    }

    /// Iterates the results without using the cache. Every call re-executes
    /// the query.
    pub fn iterator(&self) -> Rows<'_, S, M> {
        Rows {
            qs: self,
            mode: Mode::Uncached(None),
        }
    }

    /// Collects every result, filling the cache.
    pub fn to_vec(&self) -> Result<Vec<M::Output>> {
        self.iter().collect()
    }

    /// Number of matching records.
    ///
    /// Uses the cache when populated, the service's count otherwise. With a
    /// client-side residual or a calendar view, counts on the client over an
    /// id-only pass.
    pub fn count(&self) -> Result<usize> {
        if let State::Cached(rows) = &*self.state.borrow() {
            return Ok(rows.len());
        }
        if let Filter::Nothing = self.filter {
            return Ok(0);
        }
        let plan = self.plan()?;
        if plan.restriction.residual.is_none() && self.view.is_none() {
            return Ok(self.service.count(&self.collection, &plan.restriction)?);
        }
        let mut count = 0;
        for record in self.id_cursor(&plan, self.config.count_page_size) {
            record?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether any record matches. Requests at most one record unless a
    /// residual filter forces paging.
    pub fn exists(&self) -> Result<bool> {
        if let State::Cached(rows) = &*self.state.borrow() {
            return Ok(!rows.is_empty());
        }
        if let Filter::Nothing = self.filter {
            return Ok(false);
        }
        let plan = self.plan()?;
        let page_size = if plan.restriction.residual.is_some() {
            self.page_size
        } else {
            1
        };
        let first = self
            .id_cursor(&plan, page_size)
            .max_items(Some(1))
            .next()
            .transpose()?;
        Ok(first.is_some())
    }

    /// The single record matching `expr`.
    ///
    /// With [`Expr::all`] and a populated cache, the cached results are
    /// checked without a request.
    ///
    /// # Errors
    ///
    /// [`QueryError::DoesNotExist`] for no match and
    /// [`QueryError::MultipleObjectsReturned`] for more than one.
    pub fn get(&self, expr: Expr) -> Result<M::Output> {
        if expr.is_all() {
            if let State::Cached(rows) = &*self.state.borrow() {
                return exactly_one(rows);
            }
        }
        exactly_one(&self.filter(expr)?.to_vec()?)
    }

    /// The record at `index`. Negative indices count from the end and cost
    /// a count request first.
    pub fn at(&self, index: isize) -> Result<M::Output> {
        if let State::Cached(rows) = &*self.state.borrow() {
            let len = rows.len();
            return resolve_index(index, len)
                .and_then(|i| rows.get(i).cloned())
                .ok_or(QueryError::IndexOutOfRange { index, len });
        }
        let position = if index < 0 {
            let len = self.count()?;
            tracing::debug!(index, len, "negative index resolved with a count request");
            resolve_index(index, len).ok_or(QueryError::IndexOutOfRange { index, len })?
        } else {
            index as usize
        };
        let window = Window {
            offset: position,
            limit: Some(1),
        };
        match self.execute(window)?.next() {
            Some(row) => row,
            None => Err(QueryError::IndexOutOfRange {
                index,
                len: self.count()?,
            }),
        }
    }

    /// The records selected by `slice`, with sequence-slicing semantics.
    ///
    /// Forward slices fetch only their window. Negative bounds add a count
    /// request; a step other than 1 materializes every result.
    pub fn slice(&self, slice: impl Into<Slice>) -> Result<Vec<M::Output>> {
        let slice = slice.into();
        if slice.step == 0 {
            return Err(QueryError::InvalidArgument(
                "slice step cannot be zero".into(),
            ));
        }
        if let State::Cached(rows) = &*self.state.borrow() {
            return Ok(pick(rows, &slice));
        }
        if slice.step != 1 {
            tracing::debug!(step = slice.step, "stepped slice; materializing every result");
            let rows = self.to_vec()?;
            return Ok(pick(&rows, &slice));
        }
        let slice = if slice.has_negative_bound() {
            let len = self.count()?;
            tracing::debug!(len, "negative slice bound resolved with a count request");
            slice.resolve(len)
        } else {
            slice
        };
        let Some((offset, limit)) = slice.forward_window() else {
            return Ok(Vec::new());
        };
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        self.execute(Window { offset, limit })?.collect()
    }

    /// Fetches one record by id, bypassing the filter.
    pub fn get_by_id(&self, id: &ItemId) -> Result<M::Output> {
        let projection = if self.only.is_empty() {
            Projection::AllFields
        } else {
            Projection::Fields(self.only.clone())
        };
        let mut results = self.service.fetch(std::slice::from_ref(id), &projection)?;
        if results.len() != 1 {
            return Err(TransportError::MalformedResponse(format!(
                "fetch returned {} results for 1 id",
                results.len()
            ))
            .into());
        }
        let raw = results.remove(0).map_err(|source| QueryError::Item {
            id: id.id.clone(),
            source,
        })?;
        let record = Decoder::new(&self.schema).decode(raw)?;
        Ok(self.shape.shape(record, self.config.generic_item_fallback)?)
    }

    fn matching_ids(&self) -> Result<Vec<ItemId>> {
        if let Filter::Nothing = self.filter {
            return Ok(Vec::new());
        }
        let plan = self.plan()?;
        self.id_cursor(&plan, self.config.count_page_size)
            .map(|record| record.map(|r| r.id))
            .collect()
    }
}

impl<S, M> QuerySet<S, M>
where
    S: SearchService + BulkService + ?Sized,
    M: Shape,
{
    /// Deletes every matching record.
    ///
    /// Returns one outcome per record; per-record failures do not abort the
    /// batch. Clears the cache.
    pub fn delete(&self) -> Result<Vec<Result<(), ItemError>>> {
        let ids = self.matching_ids()?;
        let outcomes = bulk::delete_items(&*self.service, &ids, self.config.bulk_chunk_size)?;
        self.invalidate();
        Ok(outcomes)
    }

    /// Moves every matching record to `folder`. Successes carry the new id.
    pub fn move_to(&self, folder: &FolderId) -> Result<Vec<Result<ItemId, ItemError>>> {
        let ids = self.matching_ids()?;
        let outcomes =
            bulk::move_items(&*self.service, &ids, folder, self.config.bulk_chunk_size)?;
        self.invalidate();
        Ok(outcomes)
    }
}

impl<S: SearchService + ?Sized, M: Shape> fmt::Display for QuerySet<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuerySet(q={}, folders=[{}])", self.filter, self.collection)
    }
}

impl<S: SearchService + ?Sized, M: Shape> fmt::Debug for QuerySet<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("filter", &self.filter)
            .field("collection", &self.collection)
            .field("only", &self.only)
            .field("order", &self.order)
            .field("view", &self.view)
            .field("page_size", &self.page_size)
            .field("cached", &self.is_cached())
            .finish()
    }
}

impl<'q, S: SearchService + ?Sized, M: Shape> IntoIterator for &'q QuerySet<S, M> {
    type Item = Result<M::Output>;
    type IntoIter = Rows<'q, S, M>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn resolve_index(index: isize, len: usize) -> Option<usize> {
    if index >= 0 {
        let i = index as usize;
        (i < len).then_some(i)
    } else {
        len.checked_sub(index.unsigned_abs())
    }
}

fn exactly_one<T: Clone>(rows: &[T]) -> Result<T> {
    match rows {
        [] => Err(QueryError::DoesNotExist),
        [row] => Ok(row.clone()),
        _ => Err(QueryError::MultipleObjectsReturned { count: rows.len() }),
    }
}

fn pick<T: Clone>(rows: &[T], slice: &Slice) -> Vec<T> {
    slice
        .indices(rows.len())
        .into_iter()
        .map(|i| rows[i].clone())
        .collect()
}

// =============================================================================
// Execution
// =============================================================================

enum Source<S: SearchService + ?Sized> {
    Empty,
    Cursor(PagingCursor<S>),
    Sorted(std::vec::IntoIter<Result<DecodedRecord>>),
}

/// One run of a query: records from a source, trimmed and shaped.
struct Execution<S: SearchService + ?Sized, M: Shape> {
    source: Source<S>,
    /// Results to drop before yielding, for offsets applied after
    /// client-side filtering.
    skip: usize,
    shape: M,
    keep: Option<BTreeSet<String>>,
    generic_fallback: bool,
}

impl<S: SearchService + ?Sized, M: Shape> Iterator for Execution<S, M> {
    type Item = Result<M::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match &mut self.source {
                Source::Empty => return None,
                Source::Cursor(cursor) => cursor.next()?,
                Source::Sorted(records) => records.next()?,
            };
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            return Some(record.and_then(|mut record| {
                if let Some(keep) = &self.keep {
                    record.retain_fields(keep);
                }
                Ok(self.shape.shape(record, self.generic_fallback)?)
            }));
        }
    }
}

enum Mode<S: SearchService + ?Sized, M: Shape> {
    Replay(usize),
    Filling {
        exec: Option<Execution<S, M>>,
        buffer: Vec<M::Output>,
        /// A per-record error was yielded; the pass must not be cached.
        tainted: bool,
    },
    Uncached(Option<Execution<S, M>>),
    Done,
}

/// Iterator over a query set's results.
pub struct Rows<'q, S: SearchService + ?Sized, M: Shape> {
    qs: &'q QuerySet<S, M>,
    mode: Mode<S, M>,
}

impl<S: SearchService + ?Sized, M: Shape> Rows<'_, S, M> {
    fn finish_filling(&mut self, buffer: Vec<M::Output>, tainted: bool) {
        let mut state = self.qs.state.borrow_mut();
        if tainted {
            *state = State::Pending;
        } else {
            tracing::debug!(rows = buffer.len(), "query set cached");
            *state = State::Cached(buffer);
        }
    }
}

impl<S: SearchService + ?Sized, M: Shape> Iterator for Rows<'_, S, M> {
    type Item = Result<M::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.mode, Mode::Done) {
            Mode::Done => None,
            Mode::Replay(index) => {
                let row = match &*self.qs.state.borrow() {
                    State::Cached(rows) => rows.get(index).cloned(),
                    _ => None,
                };
                if row.is_some() {
                    self.mode = Mode::Replay(index + 1);
                }
                row.map(Ok)
            }
            Mode::Uncached(exec) => {
                let mut exec = match exec {
                    Some(exec) => exec,
                    None => match self.qs.execute(Window::ALL) {
                        Ok(exec) => exec,
                        Err(err) => return Some(Err(err)),
                    },
                };
                let row = exec.next();
                if matches!(row, Some(Ok(_)) | Some(Err(QueryError::Item { .. }))) {
                    self.mode = Mode::Uncached(Some(exec));
                }
                row
            }
            Mode::Filling {
                exec,
                mut buffer,
                mut tainted,
            } => {
                let mut exec = match exec {
                    Some(exec) => exec,
                    None => match self.qs.execute(Window::ALL) {
                        Ok(exec) => exec,
                        Err(err) => {
                            self.qs.invalidate();
                            return Some(Err(err));
                        }
                    },
                };
                match exec.next() {
                    Some(Ok(row)) => {
                        buffer.push(row.clone());
                        self.mode = Mode::Filling {
                            exec: Some(exec),
                            buffer,
                            tainted,
                        };
                        Some(Ok(row))
                    }
                    Some(Err(err @ QueryError::Item { .. })) => {
                        tainted = true;
                        self.mode = Mode::Filling {
                            exec: Some(exec),
                            buffer,
                            tainted,
                        };
                        Some(Err(err))
                    }
                    Some(Err(err)) => {
                        self.qs.invalidate();
                        Some(Err(err))
                    }
                    None => {
                        self.finish_filling(buffer, tainted);
                        None
                    }
                }
            }
        }
    }
}

impl<S: SearchService + ?Sized, M: Shape> Drop for Rows<'_, S, M> {
    fn drop(&mut self) {
        if let Mode::Filling { .. } = self.mode {
            self.qs.invalidate();
        }
    }
}
