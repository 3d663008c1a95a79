//! Filter expressions: boolean trees of field lookups.
//!
//! Expressions are immutable. The combinators [`and_of`], [`or_of`] and
//! [`not_of`] always build a new tree and simplify as they go:
//!
//! - nested `AND`s (and nested `OR`s) are flattened,
//! - duplicate children are dropped, so `E AND E` is `E`,
//! - double negation cancels, and negating an `exact` leaf yields a `not`
//!   leaf (and the reverse).
//!
//! ```
//! use mailquery::{and_of, not_of, q, Expr};
//!
//! let unread = q!(is_read = false).unwrap();
//! let big = Expr::lookup("size__gt", 1_000_000i64).unwrap();
//! let e = and_of([unread, not_of(big)]);
//! assert_eq!(e.to_string(), "is_read == false AND NOT (size > 1000000)");
//! ```

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{QueryError, Result};
use crate::lookup::{FieldLookup, LookupOp, Operand};
use crate::schema::{FieldPath, SchemaTable};
use crate::traits::FieldSource;
use crate::value::Value;

/// A boolean tree of field lookups.
///
/// `And(vec![])` matches everything and `Or(vec![])` matches nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lookup(FieldLookup),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// The expression that matches every record.
    pub fn all() -> Self {
        Expr::And(Vec::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Expr::And(children) if children.is_empty())
    }

    /// Whether the expression can match no record at all: an empty `OR`,
    /// the negation of [`Expr::all`], or a conjunction holding either.
    pub fn matches_nothing(&self) -> bool {
        match self {
            Expr::Or(children) => children.iter().all(Expr::matches_nothing),
            Expr::And(children) => children.iter().any(Expr::matches_nothing),
            Expr::Not(inner) => inner.is_all(),
            Expr::Lookup(_) => false,
        }
    }

    /// A single keyword lookup, e.g. `Expr::lookup("size__gt", 5i64)`.
    pub fn lookup(key: &str, operand: impl Into<Operand>) -> Result<Self> {
        Ok(Expr::Lookup(FieldLookup::new(key, operand)?))
    }

    /// Several keyword lookups combined with implicit `AND`.
    pub fn lookups<K, I>(items: I) -> Result<Self>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Operand)>,
    {
        let leaves = items
            .into_iter()
            .map(|(key, operand)| Expr::lookup(key.as_ref(), operand))
            .collect::<Result<Vec<_>>>()?;
        Ok(and_of(leaves))
    }

    /// Checks every lookup in the tree against the schema.
    pub fn validate(&self, schema: &SchemaTable) -> Result<()> {
        match self {
            Expr::Lookup(lookup) => lookup.validate(schema),
            Expr::And(children) | Expr::Or(children) => {
                children.iter().try_for_each(|c| c.validate(schema))
            }
            Expr::Not(inner) => inner.validate(schema),
        }
    }

    /// Evaluates the expression against a record on the client.
    pub fn matches<R: FieldSource + ?Sized>(&self, record: &R) -> bool {
        match self {
            Expr::Lookup(lookup) => lookup.matches(record.field_value(&lookup.path)),
            Expr::And(children) => children.iter().all(|c| c.matches(record)),
            Expr::Or(children) => children.iter().any(|c| c.matches(record)),
            Expr::Not(inner) => !inner.matches(record),
        }
    }

    /// All leaves, depth first.
    pub fn lookups_iter(&self) -> Vec<&FieldLookup> {
        let mut out = Vec::new();
        self.collect_lookups(&mut out);
        out
    }

    fn collect_lookups<'a>(&'a self, out: &mut Vec<&'a FieldLookup>) {
        match self {
            Expr::Lookup(lookup) => out.push(lookup),
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_lookups(out);
                }
            }
            Expr::Not(inner) => inner.collect_lookups(out),
        }
    }

    /// Top-level field paths referenced by the expression.
    ///
    /// Labels and subfields are dropped: fetching a field fetches all of it.
    pub fn field_paths(&self) -> BTreeSet<FieldPath> {
        self.lookups_iter()
            .into_iter()
            .map(|l| FieldPath::new(l.path.field.clone()))
            .collect()
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::And(children) | Expr::Or(children) if children.len() > 1 => {
                write!(f, "({})", self)
            }
            _ => write!(f, "{}", self),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Lookup(lookup) => write!(f, "{}", lookup),
            Expr::And(children) if children.is_empty() => f.write_str("ALL"),
            Expr::Or(children) if children.is_empty() => f.write_str("NONE"),
            Expr::And(children) | Expr::Or(children) => {
                let sep = if matches!(self, Expr::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    child.fmt_child(f)?;
                }
                Ok(())
            }
            Expr::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

impl From<FieldLookup> for Expr {
    fn from(lookup: FieldLookup) -> Self {
        Expr::Lookup(lookup)
    }
}

fn push_unique(out: &mut Vec<Expr>, expr: Expr) {
    if !out.contains(&expr) {
        out.push(expr);
    }
}

/// Conjunction of `exprs`, flattened and deduplicated.
pub fn and_of(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    let mut children = Vec::new();
    for expr in exprs {
        match expr {
            Expr::And(inner) => {
                for child in inner {
                    push_unique(&mut children, child);
                }
            }
            other => push_unique(&mut children, other),
        }
    }
    if children.len() == 1 {
        children.remove(0)
    } else {
        Expr::And(children)
    }
}

/// Disjunction of `exprs`, flattened and deduplicated.
///
/// Any child that matches everything makes the whole disjunction match
/// everything.
pub fn or_of(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    let mut children = Vec::new();
    for expr in exprs {
        match expr {
            e if e.is_all() => return Expr::all(),
            Expr::Or(inner) => {
                for child in inner {
                    push_unique(&mut children, child);
                }
            }
            other => push_unique(&mut children, other),
        }
    }
    if children.len() == 1 {
        children.remove(0)
    } else {
        Expr::Or(children)
    }
}

/// Negation of `expr`.
pub fn not_of(expr: Expr) -> Expr {
    match expr {
        Expr::Not(inner) => *inner,
        Expr::Lookup(mut lookup) => match lookup.op {
            LookupOp::Exact => {
                lookup.op = LookupOp::Not;
                Expr::Lookup(lookup)
            }
            LookupOp::Not => {
                lookup.op = LookupOp::Exact;
                Expr::Lookup(lookup)
            }
            LookupOp::Exists => {
                if let Operand::Value(Value::Bool(b)) = &mut lookup.operand {
                    *b = !*b;
                }
                Expr::Lookup(lookup)
            }
            _ => Expr::Not(Box::new(Expr::Lookup(lookup))),
        },
        other => Expr::Not(Box::new(other)),
    }
}

/// Builds an [`Expr`] from keyword-style lookups joined by `AND`.
///
/// Keys are identifiers (`size__gt`) or string literals for dotted paths
/// (`"email_addresses.EmailAddress1"`).
///
/// ```
/// use mailquery::q;
///
/// let e = q!(subject__icontains = "report", size__lt = 10_000i64).unwrap();
/// assert_eq!(e.lookups_iter().len(), 2);
///
/// let e = q!("phone_numbers.MobilePhone" = "555-0100").unwrap();
/// assert_eq!(e.lookups_iter()[0].path.label.as_deref(), Some("MobilePhone"));
/// ```
#[macro_export]
macro_rules! q {
    ($($key:tt = $value:expr),+ $(,)?) => {
        $crate::Expr::lookups([
            $(($crate::__lookup_key!($key), $crate::Operand::from($value))),+
        ])
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __lookup_key {
    ($key:ident) => {
        stringify!($key)
    };
    ($key:literal) => {
        $key
    };
}

/// What a query set filters on.
///
/// Structured expressions and raw query strings are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Expr(Expr),
    /// Server-native query string, passed through uncompiled.
    QueryString(String),
    /// Matches nothing; never reaches the service.
    Nothing,
}

impl Default for Filter {
    fn default() -> Self {
        Filter::Expr(Expr::all())
    }
}

impl Filter {
    /// ANDs `expr` onto the current filter. A result that can match
    /// nothing collapses to [`Filter::Nothing`].
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] when the filter is a query string and
    /// `expr` restricts anything.
    pub fn and(self, expr: Expr) -> Result<Self> {
        match self {
            Filter::Expr(current) => {
                let combined = and_of([current, expr]);
                if combined.matches_nothing() {
                    Ok(Filter::Nothing)
                } else {
                    Ok(Filter::Expr(combined))
                }
            }
            Filter::QueryString(_) if expr.is_all() => Ok(self),
            Filter::QueryString(_) if expr.matches_nothing() => Ok(Filter::Nothing),
            Filter::QueryString(_) => Err(QueryError::InvalidArgument(
                "a query string cannot be combined with field lookups".into(),
            )),
            Filter::Nothing => Ok(Filter::Nothing),
        }
    }

    /// Switches to query-string mode.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidArgument`] when lookups or another query string
    /// are already present.
    pub fn with_query_string(self, query: impl Into<String>) -> Result<Self> {
        match self {
            Filter::Expr(e) if e.is_all() => Ok(Filter::QueryString(query.into())),
            Filter::Expr(_) => Err(QueryError::InvalidArgument(
                "a query string cannot be combined with field lookups".into(),
            )),
            Filter::QueryString(_) => Err(QueryError::InvalidArgument(
                "only one query string is allowed".into(),
            )),
            Filter::Nothing => Ok(Filter::Nothing),
        }
    }

    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            Filter::Expr(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Expr(e) => write!(f, "{}", e),
            Filter::QueryString(s) => write!(f, "querystring({:?})", s),
            Filter::Nothing => f.write_str("NONE"),
        }
    }
}
