//! Ordering: sort direction, `-field` parsing and client-side sorting.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Result;
use crate::schema::{FieldPath, SchemaTable};
use crate::traits::FieldSource;
use crate::value::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dir {
    /// Ascending order (smallest first).
    #[default]
    Asc,
    /// Descending order (largest first).
    Desc,
}

impl Dir {
    pub fn is_desc(self) -> bool {
        matches!(self, Dir::Desc)
    }

    /// Applies this direction to an ordering.
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Dir::Asc => ordering,
            Dir::Desc => ordering.reverse(),
        }
    }

    pub fn reverse(self) -> Dir {
        match self {
            Dir::Asc => Dir::Desc,
            Dir::Desc => Dir::Asc,
        }
    }

    /// Wire name used in sort requests.
    pub fn as_wire(self) -> &'static str {
        match self {
            Dir::Asc => "Ascending",
            Dir::Desc => "Descending",
        }
    }
}

/// A single ordering clause: a field path and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub path: FieldPath,
    pub dir: Dir,
}

impl OrderBy {
    pub fn new(path: FieldPath, dir: Dir) -> Self {
        Self { path, dir }
    }

    /// Parses `field` or `-field` (descending) and validates the path.
    pub fn parse(key: &str, schema: &SchemaTable) -> Result<Self> {
        let (dir, path) = match key.strip_prefix('-') {
            Some(rest) => (Dir::Desc, rest),
            None => (Dir::Asc, key),
        };
        let path = schema.parse_path(path, "order_by()")?;
        Ok(Self { path, dir })
    }

    pub fn reverse(&self) -> Self {
        Self {
            path: self.path.clone(),
            dir: self.dir.reverse(),
        }
    }

    /// Compares two records by this clause.
    ///
    /// Missing values sort last in either direction.
    pub fn compare<R: FieldSource + ?Sized>(&self, a: &R, b: &R) -> Ordering {
        let a = a.field_value(&self.path).filter(|v| !v.is_none());
        let b = b.field_value(&self.path).filter(|v| !v.is_none());
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => self.dir.apply(compare_values(a, b)),
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir.is_desc() {
            f.write_str("-")?;
        }
        write!(f, "{}", self.path)
    }
}

/// Compares two present values. Incomparable values (type mismatch, NaN)
/// compare equal so the stable sort keeps their relative order.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    a.partial_compare(b).unwrap_or(Ordering::Equal)
}

/// Compares two records using a list of clauses, first clause first.
pub fn compare_by_orderings<R: FieldSource + ?Sized>(a: &R, b: &R, orderings: &[OrderBy]) -> Ordering {
    for order_by in orderings {
        let ordering = order_by.compare(a, b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Stable multi-key sort.
pub fn sort_records<R: FieldSource>(records: &mut [R], orderings: &[OrderBy]) {
    if orderings.is_empty() {
        return;
    }
    records.sort_by(|a, b| compare_by_orderings(a, b, orderings));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rec(a: i64, b: Option<&str>) -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        m.insert("size".to_string(), Value::from(a));
        if let Some(b) = b {
            m.insert("subject".to_string(), Value::from(b));
        }
        m
    }

    #[test]
    fn parse_minus_prefix() {
        let schema = SchemaTable::mailbox();
        let o = OrderBy::parse("-size", &schema).unwrap();
        assert_eq!(o.dir, Dir::Desc);
        assert_eq!(o.path.field, "size");
        assert_eq!(o.to_string(), "-size");
        assert_eq!(o.reverse().to_string(), "size");
        assert!(OrderBy::parse("-nope", &schema).is_err());
    }

    #[test]
    fn multi_key_sort_is_stable() {
        let schema = SchemaTable::mailbox();
        let mut records = vec![
            rec(2, Some("b")),
            rec(1, Some("z")),
            rec(2, Some("a")),
            rec(1, Some("z")),
            rec(1, None),
        ];
        records[1].insert("marker".into(), Value::from(1i64));
        let orderings = vec![
            OrderBy::parse("size", &schema).unwrap(),
            OrderBy::parse("subject", &schema).unwrap(),
        ];
        sort_records(&mut records, &orderings);

        let keys: Vec<_> = records
            .iter()
            .map(|r| (r["size"].clone(), r.get("subject").cloned()))
            .collect();
        assert_eq!(keys[0], (Value::from(1i64), Some(Value::from("z"))));
        assert_eq!(keys[2], (Value::from(1i64), None));
        assert_eq!(keys[3], (Value::from(2i64), Some(Value::from("a"))));
        // Equal keys keep input order.
        assert!(records[0].contains_key("marker"));
    }

    #[test]
    fn missing_values_sort_last_in_both_directions() {
        let schema = SchemaTable::mailbox();
        let mut records = vec![rec(1, None), rec(2, Some("a")), rec(3, Some("b"))];
        sort_records(&mut records, &[OrderBy::parse("-subject", &schema).unwrap()]);
        assert_eq!(records[0]["size"], Value::from(3i64));
        assert_eq!(records[2]["size"], Value::from(1i64));
    }
}
