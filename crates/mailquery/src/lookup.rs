//! Field lookups: a `(field_path, operator, operand)` triple.
//!
//! Lookups are written keyword style, `field_path__operator`, with the
//! operator defaulting to `exact` when the suffix is absent:
//!
//! ```
//! use mailquery::{FieldLookup, LookupOp};
//!
//! let l = FieldLookup::new("subject__icontains", "invoice").unwrap();
//! assert_eq!(l.op, LookupOp::IContains);
//! assert_eq!(l.path.field, "subject");
//!
//! let l = FieldLookup::new("size", 10i64).unwrap();
//! assert_eq!(l.op, LookupOp::Exact);
//! ```
//!
//! [`FieldLookup::new`] only checks the operand's shape. Type compatibility
//! with the field is checked by [`FieldLookup::validate`] against a schema.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeZone};

use crate::error::{QueryError, Result};
use crate::schema::{FieldDef, FieldKind, FieldPath, SchemaTable};
use crate::value::Value;

/// Lookup operator.
///
/// Operators are grouped by the field kinds they support:
/// - **Universal**: `Exact`, `Not`, `In`, `Exists`
/// - **String**: `IExact`, `Contains`, `IContains`, `StartsWith`, `IStartsWith`
/// - **Orderable** (numbers, datetimes): `Gt`, `Gte`, `Lt`, `Lte`, `Range`
///
/// On list-valued fields only `Contains`, `In` and `Exists` apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LookupOp {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Inclusive on both bounds.
    Range,
    /// Value is one of the given set.
    In,
    /// Not equal.
    Not,
    /// Presence of the field, independent of its value.
    Exists,
}

impl LookupOp {
    /// All operators, in declaration order.
    pub const ALL: [LookupOp; 14] = [
        LookupOp::Exact,
        LookupOp::IExact,
        LookupOp::Contains,
        LookupOp::IContains,
        LookupOp::StartsWith,
        LookupOp::IStartsWith,
        LookupOp::Gt,
        LookupOp::Gte,
        LookupOp::Lt,
        LookupOp::Lte,
        LookupOp::Range,
        LookupOp::In,
        LookupOp::Not,
        LookupOp::Exists,
    ];

    /// Parses the `__operator` suffix of a lookup key.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.as_str() == s)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LookupOp::Exact => "exact",
            LookupOp::IExact => "iexact",
            LookupOp::Contains => "contains",
            LookupOp::IContains => "icontains",
            LookupOp::StartsWith => "startswith",
            LookupOp::IStartsWith => "istartswith",
            LookupOp::Gt => "gt",
            LookupOp::Gte => "gte",
            LookupOp::Lt => "lt",
            LookupOp::Lte => "lte",
            LookupOp::Range => "range",
            LookupOp::In => "in",
            LookupOp::Not => "not",
            LookupOp::Exists => "exists",
        }
    }

    /// Operator as it appears in a rendered expression.
    pub fn symbol(self) -> &'static str {
        match self {
            LookupOp::Exact => "==",
            LookupOp::Not => "!=",
            LookupOp::Gt => ">",
            LookupOp::Gte => ">=",
            LookupOp::Lt => "<",
            LookupOp::Lte => "<=",
            other => other.as_str(),
        }
    }

    /// Returns `true` if this operator only applies to string-like fields.
    pub fn is_string_op(self) -> bool {
        matches!(
            self,
            LookupOp::IExact
                | LookupOp::Contains
                | LookupOp::IContains
                | LookupOp::StartsWith
                | LookupOp::IStartsWith
        )
    }

    /// Returns `true` if this operator needs an orderable field.
    pub fn is_ordering_op(self) -> bool {
        matches!(
            self,
            LookupOp::Gt | LookupOp::Gte | LookupOp::Lt | LookupOp::Lte | LookupOp::Range
        )
    }

    pub fn is_case_insensitive(self) -> bool {
        matches!(
            self,
            LookupOp::IExact | LookupOp::IContains | LookupOp::IStartsWith
        )
    }

    /// Evaluates an ordering-based operator given the field-vs-operand
    /// comparison.
    pub fn eval_ordering(self, ordering: Ordering) -> bool {
        match self {
            LookupOp::Exact => ordering == Ordering::Equal,
            LookupOp::Not => ordering != Ordering::Equal,
            LookupOp::Gt => ordering == Ordering::Greater,
            LookupOp::Gte => ordering != Ordering::Less,
            LookupOp::Lt => ordering == Ordering::Less,
            LookupOp::Lte => ordering != Ordering::Greater,
            _ => false,
        }
    }
}

impl fmt::Display for LookupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The right-hand side of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A single scalar.
    Value(Value),
    /// Operand of `in`, or of `contains` on a list field.
    List(Vec<Value>),
    /// Inclusive `(lower, upper)` bounds for `range`.
    Range(Value, Value),
}

impl Operand {
    /// The scalar, if this is a single-value operand.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Operand::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Every value carried by the operand.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Operand::Value(v) => vec![v],
            Operand::List(items) => items.iter().collect(),
            Operand::Range(lo, hi) => vec![lo, hi],
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(v) => write!(f, "{}", v),
            Operand::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Operand::Range(lo, hi) => write!(f, "({}, {})", lo, hi),
        }
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        match v {
            Value::List(items) => Operand::List(items),
            other => Operand::Value(other),
        }
    }
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Operand::Value(Value::from(s))
    }
}

impl From<String> for Operand {
    fn from(s: String) -> Self {
        Operand::Value(Value::from(s))
    }
}

impl From<bool> for Operand {
    fn from(b: bool) -> Self {
        Operand::Value(Value::Bool(b))
    }
}

impl From<i32> for Operand {
    fn from(n: i32) -> Self {
        Operand::Value(Value::from(n))
    }
}

impl From<i64> for Operand {
    fn from(n: i64) -> Self {
        Operand::Value(Value::from(n))
    }
}

impl From<u32> for Operand {
    fn from(n: u32) -> Self {
        Operand::Value(Value::from(n))
    }
}

impl From<u64> for Operand {
    fn from(n: u64) -> Self {
        Operand::Value(Value::from(n))
    }
}

impl From<usize> for Operand {
    fn from(n: usize) -> Self {
        Operand::Value(Value::from(n))
    }
}

impl From<f64> for Operand {
    fn from(n: f64) -> Self {
        Operand::Value(Value::from(n))
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for Operand {
    fn from(dt: DateTime<Tz>) -> Self {
        Operand::Value(Value::from(dt))
    }
}

impl From<Vec<Value>> for Operand {
    fn from(items: Vec<Value>) -> Self {
        Operand::List(items)
    }
}

impl From<Vec<&str>> for Operand {
    fn from(items: Vec<&str>) -> Self {
        Operand::List(items.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<String>> for Operand {
    fn from(items: Vec<String>) -> Self {
        Operand::List(items.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<i64>> for Operand {
    fn from(items: Vec<i64>) -> Self {
        Operand::List(items.into_iter().map(Value::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Operand {
    fn from(items: [&str; N]) -> Self {
        Operand::List(items.into_iter().map(Value::from).collect())
    }
}

impl From<(i64, i64)> for Operand {
    fn from((lo, hi): (i64, i64)) -> Self {
        Operand::Range(Value::from(lo), Value::from(hi))
    }
}

impl From<(f64, f64)> for Operand {
    fn from((lo, hi): (f64, f64)) -> Self {
        Operand::Range(Value::from(lo), Value::from(hi))
    }
}

impl<Tz: TimeZone> From<(DateTime<Tz>, DateTime<Tz>)> for Operand {
    fn from((lo, hi): (DateTime<Tz>, DateTime<Tz>)) -> Self {
        Operand::Range(Value::from(lo), Value::from(hi))
    }
}

impl From<(Value, Value)> for Operand {
    fn from((lo, hi): (Value, Value)) -> Self {
        Operand::Range(lo, hi)
    }
}

/// A single `(field_path, operator, operand)` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLookup {
    pub path: FieldPath,
    pub op: LookupOp,
    pub operand: Operand,
}

impl FieldLookup {
    /// Parses a `field_path__operator` key and checks the operand's shape.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidLookup`] when the path is malformed, `range`
    /// lacks a `(lower, upper)` pair, `in` lacks a non-empty list, `exists`
    /// lacks a boolean, or a scalar operator receives a list.
    pub fn new(key: &str, operand: impl Into<Operand>) -> Result<Self> {
        let (field, op) = split_key(key);
        let path = FieldPath::parse(field)
            .ok_or_else(|| QueryError::invalid_lookup(key, "malformed field path"))?;
        let lookup = Self {
            path,
            op,
            operand: operand.into(),
        };
        lookup.check_shape()?;
        Ok(lookup)
    }

    /// Builds a lookup from parts, checking the operand's shape.
    pub fn from_parts(path: FieldPath, op: LookupOp, operand: impl Into<Operand>) -> Result<Self> {
        let lookup = Self {
            path,
            op,
            operand: operand.into(),
        };
        lookup.check_shape()?;
        Ok(lookup)
    }

    /// The keyword form of this lookup, e.g. `size__gt`.
    pub fn key(&self) -> String {
        match self.op {
            LookupOp::Exact => self.path.to_string(),
            op => format!("{}__{}", self.path, op),
        }
    }

    fn fail(&self, reason: impl Into<String>) -> QueryError {
        QueryError::invalid_lookup(self.key(), reason)
    }

    fn check_shape(&self) -> Result<()> {
        match (self.op, &self.operand) {
            (LookupOp::Range, Operand::Range(lo, hi)) => {
                if lo.is_list() || hi.is_list() || lo.is_none() || hi.is_none() {
                    return Err(self.fail("range bounds must be scalars"));
                }
                Ok(())
            }
            (LookupOp::Range, _) => Err(self.fail("range requires a (lower, upper) pair")),
            (LookupOp::In, Operand::List(items)) if items.is_empty() => {
                Err(self.fail("in requires a non-empty list"))
            }
            (LookupOp::In, Operand::List(_)) => Ok(()),
            (LookupOp::In, _) => Err(self.fail("in requires a list operand")),
            (LookupOp::Exists, Operand::Value(Value::Bool(_))) => Ok(()),
            (LookupOp::Exists, _) => Err(self.fail("exists requires a boolean")),
            (LookupOp::Contains, Operand::List(items)) if items.is_empty() => {
                Err(self.fail("contains requires a non-empty list"))
            }
            (LookupOp::Contains, Operand::List(_)) => Ok(()),
            (_, Operand::Value(v)) if v.is_none() => {
                Err(self.fail("null operand; use exists=false to match a missing field"))
            }
            (_, Operand::Value(Value::Map(_))) => Err(self.fail("operand must be a scalar")),
            (_, Operand::Value(_)) => Ok(()),
            (op, _) => Err(self.fail(format!("{} requires a single value", op))),
        }
    }

    /// Checks the lookup against the schema: the field must exist and the
    /// operator and operand must fit its kind.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidField`] for unknown paths and
    /// [`QueryError::InvalidLookup`] for incompatible operators or operands.
    pub fn validate(&self, schema: &SchemaTable) -> Result<()> {
        let def = schema.validate_path(&self.path, "filter()")?;
        if self.op == LookupOp::Exists {
            return Ok(());
        }
        if def.is_indexed() && self.path.label.is_none() {
            return Err(self.fail("indexed field requires a label"));
        }
        if matches!(def.kind, FieldKind::Nested { .. }) && self.path.subfield.is_none() {
            return Err(self.fail("nested field requires a subfield"));
        }

        if def.is_list_path(&self.path) {
            return self.validate_list(def);
        }

        let kind = def.leaf_kind(&self.path);
        if self.op.is_string_op() && !kind.is_string_like() {
            return Err(self.fail(format!("{} is not valid for {} fields", self.op, kind)));
        }
        if self.op.is_ordering_op() && !kind.is_orderable() {
            return Err(self.fail(format!("{} is not valid for {} fields", self.op, kind)));
        }
        if let Operand::List(_) = self.operand {
            if self.op != LookupOp::In {
                return Err(self.fail(format!("{} on a single-valued field takes a scalar", self.op)));
            }
        }
        let check_choices = matches!(self.op, LookupOp::Exact | LookupOp::Not | LookupOp::In);
        for value in self.operand.values() {
            check_operand(kind, value, check_choices).map_err(|reason| self.fail(reason))?;
        }
        Ok(())
    }

    fn validate_list(&self, def: &FieldDef) -> Result<()> {
        match (self.op, &self.operand) {
            (LookupOp::Contains | LookupOp::In, Operand::List(items)) => {
                for value in items {
                    check_operand(&def.kind, value, true).map_err(|reason| self.fail(reason))?;
                }
                Ok(())
            }
            (LookupOp::Contains | LookupOp::In, _) => {
                Err(self.fail("list fields require a list operand"))
            }
            (op, _) => Err(self.fail(format!(
                "{} is not valid for list fields; use contains, in or exists",
                op
            ))),
        }
    }

    /// Evaluates the lookup against a decoded field value.
    ///
    /// `None` means the field is absent from the record.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !is_empty(v));
        if let LookupOp::Exists = self.op {
            let wanted = matches!(self.operand, Operand::Value(Value::Bool(true)));
            return value.is_some() == wanted;
        }
        let Some(value) = value else {
            return self.op == LookupOp::Not;
        };

        match (&self.operand, value) {
            (Operand::List(wanted), Value::List(have)) => match self.op {
                LookupOp::Contains => wanted.iter().all(|w| have.iter().any(|h| h.loose_eq(w))),
                LookupOp::In => have.iter().any(|h| wanted.iter().any(|w| h.loose_eq(w))),
                _ => false,
            },
            (Operand::List(wanted), scalar) => {
                self.op == LookupOp::In && wanted.iter().any(|w| scalar.loose_eq(w))
            }
            (Operand::Range(lo, hi), scalar) => {
                scalar.partial_compare(lo).is_some_and(|o| o != Ordering::Less)
                    && scalar.partial_compare(hi).is_some_and(|o| o != Ordering::Greater)
            }
            (Operand::Value(wanted), have) => self.matches_scalar(have, wanted),
        }
    }

    fn matches_scalar(&self, have: &Value, wanted: &Value) -> bool {
        if self.op.is_string_op() {
            let (Some(h), Some(w)) = (have.as_str(), wanted.as_str()) else {
                return false;
            };
            return match self.op {
                LookupOp::IExact => h.to_lowercase() == w.to_lowercase(),
                LookupOp::Contains => h.contains(w),
                LookupOp::IContains => h.to_lowercase().contains(&w.to_lowercase()),
                LookupOp::StartsWith => h.starts_with(w),
                LookupOp::IStartsWith => h.to_lowercase().starts_with(&w.to_lowercase()),
                _ => false,
            };
        }
        match self.op {
            LookupOp::Exact => have.loose_eq(wanted),
            LookupOp::Not => !have.loose_eq(wanted),
            op => have
                .partial_compare(wanted)
                .is_some_and(|ordering| op.eval_ordering(ordering)),
        }
    }
}

impl fmt::Display for FieldLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.path, self.op.symbol(), self.operand)
    }
}

/// Splits `field__op` on the last `__`. Unknown suffixes are part of the
/// field path and imply `exact`.
fn split_key(key: &str) -> (&str, LookupOp) {
    match key.rsplit_once("__") {
        Some((field, suffix)) => match LookupOp::parse(suffix) {
            Some(op) => (field, op),
            None => (key, LookupOp::Exact),
        },
        None => (key, LookupOp::Exact),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::None => true,
        Value::List(items) => items.is_empty(),
        Value::Map(entries) => entries.is_empty(),
        _ => false,
    }
}

fn check_operand(kind: &FieldKind, value: &Value, check_choices: bool) -> std::result::Result<(), String> {
    let ok = match (kind, value) {
        (FieldKind::String, Value::String(_)) => true,
        (FieldKind::Choice(choices), Value::String(s)) => {
            if check_choices && !choices.iter().any(|c| c == s) {
                return Err(format!(
                    "'{}' is not a valid choice (expected one of {})",
                    s,
                    choices.join(", ")
                ));
            }
            true
        }
        (FieldKind::Integer, Value::Number(n)) => n.is_integer(),
        (FieldKind::Decimal, Value::Number(_)) => true,
        (FieldKind::Boolean, Value::Bool(_)) => true,
        (FieldKind::DateTime, Value::DateTime(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "{} operand is not valid for a {} field",
            value.type_name(),
            kind
        ))
    }
}
