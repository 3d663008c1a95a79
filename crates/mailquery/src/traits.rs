//! Field access for client-side evaluation.
//!
//! The [`FieldSource`] trait is how residual filters and client-side sorts
//! read values out of a record without knowing its concrete type.

use std::collections::BTreeMap;

use crate::schema::FieldPath;
use crate::value::Value;

/// Types whose fields can be read by [`FieldPath`].
///
/// Implemented for decoded records, typed items and plain field maps.
///
/// ```
/// use std::collections::BTreeMap;
/// use mailquery::{FieldPath, FieldSource, Value};
///
/// let mut fields = BTreeMap::new();
/// fields.insert("subject".to_string(), Value::from("hi"));
///
/// let path = FieldPath::new("subject");
/// assert_eq!(fields.field_value(&path), Some(&Value::from("hi")));
/// ```
pub trait FieldSource {
    /// Returns the value at `path`, or `None` when the record lacks it.
    fn field_value(&self, path: &FieldPath) -> Option<&Value>;
}

impl FieldSource for BTreeMap<String, Value> {
    fn field_value(&self, path: &FieldPath) -> Option<&Value> {
        let mut value = self.get(&path.field)?;
        if let Some(label) = &path.label {
            value = value.as_map()?.get(label)?;
        }
        if let Some(subfield) = &path.subfield {
            value = value.as_map()?.get(subfield)?;
        }
        Some(value)
    }
}

impl<T: FieldSource + ?Sized> FieldSource for &T {
    fn field_value(&self, path: &FieldPath) -> Option<&Value> {
        (**self).field_value(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_labels_and_subfields() {
        let mut home = BTreeMap::new();
        home.insert("city".to_string(), Value::from("Oslo"));
        let mut addresses = BTreeMap::new();
        addresses.insert("Home".to_string(), Value::Map(home));
        let mut fields = BTreeMap::new();
        fields.insert("physical_addresses".to_string(), Value::Map(addresses));

        let path = FieldPath::parse("physical_addresses.Home.city").unwrap();
        assert_eq!(fields.field_value(&path), Some(&Value::from("Oslo")));

        let path = FieldPath::parse("physical_addresses.Business.city").unwrap();
        assert_eq!(fields.field_value(&path), None);
        assert_eq!(fields.field_value(&FieldPath::new("subject")), None);
    }
}
