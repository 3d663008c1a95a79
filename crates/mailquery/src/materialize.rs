//! Turning raw records into decoded records, typed items or plain values.
//!
//! Decoding runs every wire value through the codec of its schema field.
//! Shaping then picks the output form a query set asked for: typed
//! [`Item`]s (the default), field maps ([`Values`]), tuples
//! ([`ValuesList`]) or bare scalars ([`Flat`]).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::schema::{FieldDef, FieldKind, FieldPath, SchemaTable};
use crate::service::{ItemId, RawRecord};
use crate::traits::FieldSource;
use crate::value::{Number, Value};

/// Decoded field values keyed by field name.
pub type FieldMap = BTreeMap<String, Value>;

/// A raw record could not be converted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MaterializationError {
    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// The type discriminant is unknown and no generic fallback is enabled.
    #[error("unknown item type '{tag}'")]
    UnknownItemType { tag: String },
}

fn invalid(def: &FieldDef, reason: impl Into<String>) -> MaterializationError {
    MaterializationError::InvalidValue {
        field: def.name.clone(),
        reason: reason.into(),
    }
}

/// A record whose fields have been decoded, before shaping.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub id: ItemId,
    pub item_type: Option<String>,
    /// Includes `id` and `changekey` entries.
    pub fields: FieldMap,
}

impl DecodedRecord {
    /// Drops every field not in `keep`, except the identifiers.
    pub fn retain_fields(&mut self, keep: &BTreeSet<String>) {
        self.fields
            .retain(|name, _| name == "id" || name == "changekey" || keep.contains(name));
    }
}

impl FieldSource for DecodedRecord {
    fn field_value(&self, path: &FieldPath) -> Option<&Value> {
        self.fields.field_value(path)
    }
}

/// Decodes raw records through the schema's per-field codecs.
#[derive(Debug, Clone, Copy)]
pub struct Decoder<'a> {
    schema: &'a SchemaTable,
}

impl<'a> Decoder<'a> {
    pub fn new(schema: &'a SchemaTable) -> Self {
        Self { schema }
    }

    /// Decodes one record. Fields unknown to the schema are skipped.
    pub fn decode(&self, raw: RawRecord) -> Result<DecodedRecord, MaterializationError> {
        let mut fields = FieldMap::new();
        fields.insert("id".into(), Value::String(raw.id.id.clone()));
        if let Some(changekey) = &raw.id.changekey {
            fields.insert("changekey".into(), Value::String(changekey.clone()));
        }
        for (name, wire) in raw.fields {
            let Some(def) = self.schema.field(&name) else {
                tracing::trace!(field = %name, "skipping field not in schema");
                continue;
            };
            if def.attribute {
                continue;
            }
            let value = decode_field(def, &wire)?;
            fields.insert(name, value);
        }
        Ok(DecodedRecord {
            id: raw.id,
            item_type: raw.item_type,
            fields,
        })
    }
}

fn decode_field(def: &FieldDef, wire: &serde_json::Value) -> Result<Value, MaterializationError> {
    if wire.is_null() {
        return Ok(Value::None);
    }
    if def.is_indexed() {
        let entries = wire
            .as_object()
            .ok_or_else(|| invalid(def, "indexed field must be an object keyed by label"))?;
        let mut out = BTreeMap::new();
        for (label, entry) in entries {
            if !def.labels.iter().any(|l| l == label) {
                return Err(invalid(def, format!("unknown label '{}'", label)));
            }
            out.insert(label.clone(), decode_single(def, entry)?);
        }
        return Ok(Value::Map(out));
    }
    if def.multi_valued {
        let items = wire
            .as_array()
            .ok_or_else(|| invalid(def, "list field must be an array"))?;
        return items
            .iter()
            .map(|item| decode_single(def, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List);
    }
    decode_single(def, wire)
}

fn decode_single(def: &FieldDef, wire: &serde_json::Value) -> Result<Value, MaterializationError> {
    use serde_json::Value as Json;

    if wire.is_null() {
        return Ok(Value::None);
    }
    match (&def.kind, wire) {
        (FieldKind::String, Json::String(s)) => Ok(Value::String(s.clone())),
        (FieldKind::Choice(choices), Json::String(s)) => {
            if choices.iter().any(|c| c == s) {
                Ok(Value::String(s.clone()))
            } else {
                Err(invalid(def, format!("'{}' is not a valid choice", s)))
            }
        }
        (FieldKind::Integer, Json::Number(n)) => n
            .as_i64()
            .map(Number::I64)
            .or_else(|| n.as_u64().map(Number::U64))
            .map(Value::Number)
            .ok_or_else(|| invalid(def, format!("{} is not an integer", n))),
        (FieldKind::Integer, Json::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| invalid(def, e.to_string())),
        (FieldKind::Decimal, Json::Number(n)) => n
            .as_f64()
            .map(Value::from)
            .ok_or_else(|| invalid(def, format!("{} is not a number", n))),
        (FieldKind::Decimal, Json::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|e| invalid(def, e.to_string())),
        (FieldKind::Boolean, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldKind::Boolean, Json::String(s)) => match s.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(invalid(def, format!("'{}' is not a boolean", other))),
        },
        (FieldKind::DateTime, Json::String(s)) => decode_datetime(def, s),
        (FieldKind::Nested { subfields }, Json::Object(entries)) => {
            let mut out = BTreeMap::new();
            for (name, entry) in entries {
                if !subfields.iter().any(|(sub, _)| sub == name) {
                    return Err(invalid(def, format!("unknown subfield '{}'", name)));
                }
                let text = match entry {
                    Json::String(s) => Value::String(s.clone()),
                    Json::Null => Value::None,
                    other => {
                        return Err(invalid(def, format!("subfield '{}' is {}", name, other)))
                    }
                };
                out.insert(name.clone(), text);
            }
            Ok(Value::Map(out))
        }
        (kind, other) => Err(invalid(
            def,
            format!("expected {} value, got {}", kind, other),
        )),
    }
}

fn decode_datetime(def: &FieldDef, s: &str) -> Result<Value, MaterializationError> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Ok(Value::DateTime(dt.with_timezone(&Utc))),
        Err(e) => {
            if NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok() {
                Err(invalid(def, format!("datetime '{}' has no timezone", s)))
            } else {
                Err(invalid(def, e.to_string()))
            }
        }
    }
}

// =============================================================================
// Typed items
// =============================================================================

macro_rules! accessor {
    ($field:ident, str) => {
        pub fn $field(&self) -> Option<&str> {
            self.fields.get(stringify!($field)).and_then(Value::as_str)
        }
    };
    ($field:ident, bool) => {
        pub fn $field(&self) -> Option<bool> {
            self.fields.get(stringify!($field)).and_then(Value::as_bool)
        }
    };
    ($field:ident, number) => {
        pub fn $field(&self) -> Option<Number> {
            self.fields.get(stringify!($field)).and_then(Value::as_number)
        }
    };
    ($field:ident, datetime) => {
        pub fn $field(&self) -> Option<DateTime<Utc>> {
            self.fields.get(stringify!($field)).and_then(Value::as_datetime)
        }
    };
    ($field:ident, list) => {
        pub fn $field(&self) -> &[Value] {
            self.fields
                .get(stringify!($field))
                .and_then(Value::as_list)
                .unwrap_or(&[])
        }
    };
    ($field:ident, map) => {
        pub fn $field(&self) -> Option<&BTreeMap<String, Value>> {
            self.fields.get(stringify!($field)).and_then(Value::as_map)
        }
    };
}

macro_rules! typed_item {
    ($(#[$meta:meta])* $name:ident { $($field:ident: $kind:ident),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            pub id: ItemId,
            pub fields: FieldMap,
        }

        impl $name {
            accessor!(subject, str);
            $(accessor!($field, $kind);)*
        }
    };
}

typed_item!(
    /// An email message, or a meeting message.
    Message {
        sender: str,
        is_read: bool,
        to_recipients: list,
        datetime_received: datetime,
        importance: str,
        categories: list,
        body: str,
        size: number,
        has_attachments: bool,
    }
);

typed_item!(
    /// A calendar appointment or meeting.
    CalendarItem {
        start: datetime,
        end: datetime,
        location: str,
        is_all_day: bool,
        required_attendees: list,
        legacy_free_busy_status: str,
        body: str,
    }
);

typed_item!(
    /// An address-book contact.
    Contact {
        given_name: str,
        surname: str,
        display_name: str,
        company_name: str,
        email_addresses: map,
        phone_numbers: map,
        physical_addresses: map,
        companies: list,
    }
);

typed_item!(
    Task {
        status: str,
        percent_complete: number,
        due_date: datetime,
        body: str,
    }
);

/// Any item whose type has no dedicated variant.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericItem {
    pub id: ItemId,
    /// The discriminant as received, if any.
    pub item_type: Option<String>,
    pub fields: FieldMap,
}

impl GenericItem {
    accessor!(subject, str);
}

/// A typed item, chosen by the record's type discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Message(Message),
    CalendarItem(CalendarItem),
    Contact(Contact),
    Task(Task),
    Generic(GenericItem),
}

type Constructor = fn(ItemId, FieldMap) -> Item;

/// Discriminant to variant. Meeting messages are messages.
static ITEM_TYPES: &[(&str, Constructor)] = &[
    ("Message", Item::message),
    ("MeetingRequest", Item::message),
    ("MeetingResponse", Item::message),
    ("MeetingCancellation", Item::message),
    ("CalendarItem", Item::calendar_item),
    ("Contact", Item::contact),
    ("Task", Item::task),
];

impl Item {
    fn message(id: ItemId, fields: FieldMap) -> Item {
        Item::Message(Message { id, fields })
    }

    fn calendar_item(id: ItemId, fields: FieldMap) -> Item {
        Item::CalendarItem(CalendarItem { id, fields })
    }

    fn contact(id: ItemId, fields: FieldMap) -> Item {
        Item::Contact(Contact { id, fields })
    }

    fn task(id: ItemId, fields: FieldMap) -> Item {
        Item::Task(Task { id, fields })
    }

    /// Builds the variant for a decoded record.
    ///
    /// Records without a discriminant, or tagged `Item`, become
    /// [`Item::Generic`]. Unknown tags do too when `generic_fallback` is set
    /// and fail otherwise.
    pub fn from_record(
        record: DecodedRecord,
        generic_fallback: bool,
    ) -> Result<Item, MaterializationError> {
        let DecodedRecord {
            id,
            item_type,
            fields,
        } = record;
        let tag = match item_type.as_deref() {
            None | Some("Item") => None,
            Some(tag) => Some(tag),
        };
        if let Some(tag) = tag {
            if let Some((_, build)) = ITEM_TYPES.iter().find(|(t, _)| *t == tag) {
                return Ok(build(id, fields));
            }
            if !generic_fallback {
                return Err(MaterializationError::UnknownItemType { tag: tag.into() });
            }
        }
        Ok(Item::Generic(GenericItem {
            id,
            item_type,
            fields,
        }))
    }

    pub fn id(&self) -> &ItemId {
        match self {
            Item::Message(i) => &i.id,
            Item::CalendarItem(i) => &i.id,
            Item::Contact(i) => &i.id,
            Item::Task(i) => &i.id,
            Item::Generic(i) => &i.id,
        }
    }

    pub fn fields(&self) -> &FieldMap {
        match self {
            Item::Message(i) => &i.fields,
            Item::CalendarItem(i) => &i.fields,
            Item::Contact(i) => &i.fields,
            Item::Task(i) => &i.fields,
            Item::Generic(i) => &i.fields,
        }
    }

    /// The variant's discriminant tag.
    pub fn type_name(&self) -> &str {
        match self {
            Item::Message(_) => "Message",
            Item::CalendarItem(_) => "CalendarItem",
            Item::Contact(_) => "Contact",
            Item::Task(_) => "Task",
            Item::Generic(i) => i.item_type.as_deref().unwrap_or("Item"),
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.fields().get("subject").and_then(Value::as_str)
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Item::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_calendar_item(&self) -> Option<&CalendarItem> {
        match self {
            Item::CalendarItem(c) => Some(c),
            _ => None,
        }
    }
}

impl FieldSource for Item {
    fn field_value(&self, path: &FieldPath) -> Option<&Value> {
        self.fields().field_value(path)
    }
}

// =============================================================================
// Output shapes
// =============================================================================

/// How a query set turns decoded records into results.
pub trait Shape: Clone {
    type Output: Clone;

    fn shape(
        &self,
        record: DecodedRecord,
        generic_fallback: bool,
    ) -> Result<Self::Output, MaterializationError>;
}

/// Typed [`Item`]s. The default shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Items;

impl Shape for Items {
    type Output = Item;

    fn shape(&self, record: DecodedRecord, generic_fallback: bool) -> Result<Item, MaterializationError> {
        Item::from_record(record, generic_fallback)
    }
}

/// Plain maps from path to value, as produced by `values()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Values {
    pub paths: Vec<FieldPath>,
}

impl Shape for Values {
    type Output = BTreeMap<String, Value>;

    fn shape(&self, record: DecodedRecord, _: bool) -> Result<Self::Output, MaterializationError> {
        Ok(self
            .paths
            .iter()
            .map(|p| (p.to_string(), lookup_or_none(&record, p)))
            .collect())
    }
}

/// Values in projection order, as produced by `values_list()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuesList {
    pub paths: Vec<FieldPath>,
}

impl Shape for ValuesList {
    type Output = Vec<Value>;

    fn shape(&self, record: DecodedRecord, _: bool) -> Result<Self::Output, MaterializationError> {
        Ok(self
            .paths
            .iter()
            .map(|p| lookup_or_none(&record, p))
            .collect())
    }
}

/// A single bare value per record, as produced by `values_list_flat()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flat {
    pub path: FieldPath,
}

impl Shape for Flat {
    type Output = Value;

    fn shape(&self, record: DecodedRecord, _: bool) -> Result<Value, MaterializationError> {
        Ok(lookup_or_none(&record, &self.path))
    }
}

fn lookup_or_none(record: &DecodedRecord, path: &FieldPath) -> Value {
    record.field_value(path).cloned().unwrap_or(Value::None)
}
