//! Mailquery - Lazy, chainable query sets over a mailbox and calendar search
//! service.
//!
//! Mailquery sits between application code and a remote search service. It
//! provides:
//!
//! - Immutable query descriptors built by chaining `filter`, `exclude`,
//!   `order_by`, `only` and the `values` projections
//! - Keyword lookups (`size__gte`, `subject__icontains`) checked
//!   against a field schema before any request is sent
//! - Compilation of filters into a server restriction, with a client-side
//!   residual for what the server cannot evaluate
//! - Transparent paging, result caching, counting, indexing and slicing
//! - Chunked bulk delete and move with per-record outcomes
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use mailquery::{q, Collection, Page, PageRequest, QuerySet, RawRecord, ItemId};
//! # use mailquery::{FetchResult, Projection, Restriction, SearchService, TransportError};
//!
//! struct OneMessage;
//!
//! fn report() -> RawRecord {
//!     RawRecord::new(ItemId::new("m1"))
//!         .with_type("Message")
//!         .with_field("subject", "Quarterly report".into())
//!         .with_field("body", "Revenue is up.".into())
//! }
//!
//! impl SearchService for OneMessage {
//!     fn find(&self, _: &PageRequest<'_>) -> Result<Page, TransportError> {
//!         Ok(Page { records: vec![report()], next_offset: None, total: Some(1) })
//!     }
//!     fn count(&self, _: &Collection, _: &Restriction) -> Result<usize, TransportError> {
//!         Ok(1)
//!     }
//!     fn fetch(&self, ids: &[ItemId], _: &Projection) -> Result<Vec<FetchResult>, TransportError> {
//!         Ok(ids.iter().map(|_| Ok(report())).collect())
//!     }
//! }
//!
//! let inbox = QuerySet::new(Arc::new(OneMessage), Collection::folder("inbox"));
//! let reports = inbox.filter(q!(subject__icontains = "report")?)?;
//!
//! let items = reports.to_vec()?;
//! assert_eq!(items[0].subject(), Some("Quarterly report"));
//! assert_eq!(items[0].as_message().and_then(|m| m.body()), Some("Revenue is up."));
//! assert!(reports.is_cached());
//! # Ok::<(), mailquery::QueryError>(())
//! ```
//!
//! # Lookups
//!
//! A lookup key is a field path followed by an optional `__operator`
//! suffix. Without a suffix the operator is `exact`.
//!
//! | Operator | Applies to |
//! |----------|------------|
//! | `exact`, `not`, `in` | every field |
//! | `gt`, `gte`, `lt`, `lte`, `range` | integers, decimals, datetimes |
//! | `iexact`, `contains`, `icontains`, `startswith`, `istartswith` | strings, choices |
//! | `contains`, `in` | multi-valued fields |
//! | `exists` | every field |
//!
//! Indexed fields take a label (`phone_numbers.MobilePhone`) and nested
//! indexed fields a label and subfield (`physical_addresses.Home.city`).
//!
//! # Execution
//!
//! Chaining never contacts the service. Terminal operations
//! ([`QuerySet::iter`], [`QuerySet::count`], [`QuerySet::at`],
//! [`QuerySet::slice`] and the rest) compile the filter with
//! [`RestrictionCompiler`] and page through results with a
//! [`PagingCursor`].

mod bulk;
mod config;
mod error;
mod expr;
mod lookup;
mod materialize;
mod ordering;
mod paging;
mod query;
mod restriction;
mod schema;
mod service;
mod slice;
mod traits;
mod value;

pub use bulk::{delete_items, move_items};
pub use config::{ConfigError, QueryConfig, DEFAULT_PAGE_SIZE};
pub use error::{QueryError, Result};
pub use expr::{and_of, not_of, or_of, Expr, Filter};
pub use lookup::{FieldLookup, LookupOp, Operand};
pub use materialize::{
    CalendarItem, Contact, DecodedRecord, Decoder, FieldMap, Flat, GenericItem, Item, Items,
    MaterializationError, Message, Shape, Task, Values, ValuesList,
};
pub use ordering::{compare_values, sort_records, Dir, OrderBy};
pub use paging::PagingCursor;
pub use query::{QuerySet, Rows};
pub use restriction::{Restriction, RestrictionCompiler};
pub use schema::{FieldDef, FieldKind, FieldPath, ItemTypeDef, SchemaTable, SearchSupport};
pub use service::{
    BulkService, CalendarView, Capabilities, Collection, FetchResult, FolderId, ItemError, ItemId,
    Page, PageRequest, Projection, RawRecord, SearchService, TransportError,
};
pub use slice::Slice;
pub use traits::FieldSource;
pub use value::{Number, Value};
