//! Field schema: which fields exist, how they are typed, and what the
//! search service can do with them.
//!
//! The query layer treats the schema as a runtime-loaded capability table.
//! [`SchemaTable::mailbox`] provides a built-in table covering the common
//! item types so the crate is usable without a schema loader.

use std::collections::HashMap;
use std::fmt;

use crate::error::{QueryError, Result};

/// The value type of a field, used to pick a codec and to type-check lookups.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Integer,
    Decimal,
    Boolean,
    /// Timezone-aware datetime.
    DateTime,
    /// Enumerated value; the vector lists the accepted wire names.
    Choice(Vec<String>),
    /// Structured value with string subfields, as `(name, wire token)` pairs.
    Nested { subfields: Vec<(String, String)> },
}

static STRING_KIND: FieldKind = FieldKind::String;

impl FieldKind {
    /// String-matching operators apply to these kinds.
    pub fn is_string_like(&self) -> bool {
        matches!(self, FieldKind::String | FieldKind::Choice(_))
    }

    /// Range and comparison operators apply to these kinds.
    pub fn is_orderable(&self) -> bool {
        matches!(
            self,
            FieldKind::Integer | FieldKind::Decimal | FieldKind::DateTime
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Boolean => "boolean",
            FieldKind::DateTime => "datetime",
            FieldKind::Choice(_) => "choice",
            FieldKind::Nested { .. } => "nested",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where lookups on a field can be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSupport {
    /// The search service evaluates restrictions on this field.
    Server,
    /// Only the client-side fallback can evaluate it.
    Client,
    /// Not filterable at all.
    None,
}

/// One entry of the schema table.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    /// Field URI used in restrictions, e.g. `item:Subject`.
    pub wire_name: String,
    pub kind: FieldKind,
    pub search: SearchSupport,
    pub sortable: bool,
    /// The field holds a list of values.
    pub multi_valued: bool,
    /// The search service cannot return this field; it must be fetched by id.
    pub complex: bool,
    /// Carried on the record envelope rather than in the field set.
    pub attribute: bool,
    /// Index labels for indexed fields, e.g. `EmailAddress1`.
    pub labels: Vec<String>,
}

impl FieldDef {
    /// Creates a server-searchable, sortable, single-valued field.
    pub fn new(name: impl Into<String>, wire_name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            wire_name: wire_name.into(),
            kind,
            search: SearchSupport::Server,
            sortable: true,
            multi_valued: false,
            complex: false,
            attribute: false,
            labels: Vec::new(),
        }
    }

    pub fn search(mut self, search: SearchSupport) -> Self {
        self.search = search;
        self
    }

    pub fn sortable(mut self, sortable: bool) -> Self {
        self.sortable = sortable;
        self
    }

    /// Marks the field as list-valued. List fields are never sortable.
    pub fn multi_valued(mut self) -> Self {
        self.multi_valued = true;
        self.sortable = false;
        self
    }

    pub fn complex(mut self) -> Self {
        self.complex = true;
        self
    }

    pub fn attribute(mut self) -> Self {
        self.attribute = true;
        self
    }

    /// Makes the field indexed by the given labels.
    pub fn indexed<I, L>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self.sortable = false;
        self
    }

    pub fn is_indexed(&self) -> bool {
        !self.labels.is_empty()
    }

    /// Wire token for a nested subfield.
    pub fn subfield_wire_name(&self, subfield: &str) -> Option<&str> {
        match &self.kind {
            FieldKind::Nested { subfields } => subfields
                .iter()
                .find(|(name, _)| name == subfield)
                .map(|(_, wire)| wire.as_str()),
            _ => None,
        }
    }

    /// The kind of the value addressed by `path`.
    ///
    /// Subfields of nested structures are always strings.
    pub fn leaf_kind(&self, path: &FieldPath) -> &FieldKind {
        if path.subfield.is_some() {
            &STRING_KIND
        } else {
            &self.kind
        }
    }

    /// Whether `path` addresses a list of values rather than a scalar.
    pub fn is_list_path(&self, path: &FieldPath) -> bool {
        self.multi_valued && path.label.is_none()
    }
}

/// A dotted path into a possibly indexed or nested field:
/// `field`, `field.label` or `field.label.subfield`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath {
    pub field: String,
    pub label: Option<String>,
    pub subfield: Option<String>,
}

impl FieldPath {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            label: None,
            subfield: None,
        }
    }

    /// Splits a dotted path without consulting a schema.
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.split('.');
        let field = parts.next().filter(|s| !s.is_empty())?;
        let label = match parts.next() {
            Some("") => return None,
            other => other.map(str::to_string),
        };
        let subfield = match parts.next() {
            Some("") => return None,
            other => other.map(str::to_string),
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            field: field.to_string(),
            label,
            subfield,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.field)?;
        if let Some(label) = &self.label {
            write!(f, ".{}", label)?;
        }
        if let Some(subfield) = &self.subfield {
            write!(f, ".{}", subfield)?;
        }
        Ok(())
    }
}

/// An item type known to the schema, identified by its discriminant tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemTypeDef {
    pub tag: String,
    pub fields: Vec<String>,
}

/// Field name to definition table, plus the known item types.
#[derive(Debug, Clone)]
pub struct SchemaTable {
    fields: Vec<FieldDef>,
    index: HashMap<String, usize>,
    item_types: Vec<ItemTypeDef>,
}

impl Default for SchemaTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaTable {
    /// Creates a table holding only the `id` and `changekey` attributes.
    pub fn new() -> Self {
        let table = Self {
            fields: Vec::new(),
            index: HashMap::new(),
            item_types: Vec::new(),
        };
        table
            .with_field(
                FieldDef::new("id", "item:ItemId", FieldKind::String)
                    .search(SearchSupport::None)
                    .sortable(false)
                    .attribute(),
            )
            .with_field(
                FieldDef::new("changekey", "item:ChangeKey", FieldKind::String)
                    .search(SearchSupport::None)
                    .sortable(false)
                    .attribute(),
            )
    }

    /// Adds a field, replacing any existing field with the same name.
    pub fn with_field(mut self, def: FieldDef) -> Self {
        match self.index.get(&def.name) {
            Some(&i) => self.fields[i] = def,
            None => {
                self.index.insert(def.name.clone(), self.fields.len());
                self.fields.push(def);
            }
        }
        self
    }

    /// Registers an item type with the fields it carries.
    pub fn with_item_type(mut self, tag: impl Into<String>, fields: &[&str]) -> Self {
        self.item_types.push(ItemTypeDef {
            tag: tag.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    pub fn item_types(&self) -> &[ItemTypeDef] {
        &self.item_types
    }

    pub fn has_item_type(&self, tag: &str) -> bool {
        self.item_types.iter().any(|t| t.tag == tag)
    }

    /// Looks up the definition of a path's top-level field.
    pub fn resolve(&self, path: &FieldPath) -> Option<&FieldDef> {
        self.field(&path.field)
    }

    /// Parses and validates a dotted path.
    ///
    /// `context` names the operation in the resulting error, e.g. `only()`.
    pub fn parse_path(&self, path: &str, context: &str) -> Result<FieldPath> {
        let parsed =
            FieldPath::parse(path).ok_or_else(|| QueryError::invalid_field(path, context))?;
        self.validate_path(&parsed, context)?;
        Ok(parsed)
    }

    /// Checks that a path's field exists and its label and subfield fit the
    /// field's shape.
    pub fn validate_path(&self, path: &FieldPath, context: &str) -> Result<&FieldDef> {
        let invalid = || QueryError::invalid_field(path.to_string(), context);
        let def = self.resolve(path).ok_or_else(invalid)?;
        if let Some(label) = &path.label {
            if !def.labels.iter().any(|l| l == label) {
                return Err(invalid());
            }
        }
        if let Some(subfield) = &path.subfield {
            if path.label.is_none() || def.subfield_wire_name(subfield).is_none() {
                return Err(invalid());
            }
        }
        Ok(def)
    }

    /// Whether any of the paths needs a fetch by id.
    pub fn has_complex_fields<'a>(&self, paths: impl IntoIterator<Item = &'a FieldPath>) -> bool {
        paths
            .into_iter()
            .any(|p| self.resolve(p).is_some_and(|d| d.complex))
    }

    /// Built-in table for mailbox folders holding messages, calendar items,
    /// contacts and tasks.
    pub fn mailbox() -> Self {
        use FieldKind::*;

        let choice = |values: &[&str]| Choice(values.iter().map(|v| v.to_string()).collect());

        Self::new()
            // Common item fields
            .with_field(FieldDef::new("subject", "item:Subject", String))
            .with_field(FieldDef::new("body", "item:Body", String).complex().sortable(false))
            .with_field(FieldDef::new(
                "importance",
                "item:Importance",
                choice(&["Low", "Normal", "High"]),
            ))
            .with_field(FieldDef::new("categories", "item:Categories", String).multi_valued())
            .with_field(FieldDef::new(
                "datetime_received",
                "item:DateTimeReceived",
                DateTime,
            ))
            .with_field(FieldDef::new(
                "datetime_created",
                "item:DateTimeCreated",
                DateTime,
            ))
            .with_field(FieldDef::new("size", "item:Size", Integer))
            .with_field(FieldDef::new(
                "has_attachments",
                "item:HasAttachments",
                Boolean,
            ))
            .with_field(FieldDef::new("item_class", "item:ItemClass", String))
            .with_field(FieldDef::new(
                "sensitivity",
                "item:Sensitivity",
                choice(&["Normal", "Personal", "Private", "Confidential"]),
            ))
            .with_field(
                FieldDef::new("reminder_due_by", "item:ReminderDueBy", DateTime)
                    .search(SearchSupport::Client)
                    .sortable(false),
            )
            .with_field(
                FieldDef::new("last_modified_name", "item:LastModifiedName", String)
                    .search(SearchSupport::Client)
                    .sortable(false),
            )
            // Message
            .with_field(FieldDef::new("sender", "message:Sender", String))
            .with_field(FieldDef::new("is_read", "message:IsRead", Boolean))
            .with_field(
                FieldDef::new("to_recipients", "message:ToRecipients", String)
                    .multi_valued()
                    .complex()
                    .search(SearchSupport::None),
            )
            // Calendar item
            .with_field(FieldDef::new("start", "calendar:Start", DateTime))
            .with_field(FieldDef::new("end", "calendar:End", DateTime))
            .with_field(FieldDef::new("location", "calendar:Location", String))
            .with_field(FieldDef::new("is_all_day", "calendar:IsAllDayEvent", Boolean))
            .with_field(
                FieldDef::new(
                    "required_attendees",
                    "calendar:RequiredAttendees",
                    String,
                )
                .multi_valued()
                .complex()
                .search(SearchSupport::None),
            )
            .with_field(FieldDef::new(
                "legacy_free_busy_status",
                "calendar:LegacyFreeBusyStatus",
                choice(&["Free", "Tentative", "Busy", "OOF", "NoData"]),
            ))
            // Contact
            .with_field(FieldDef::new("given_name", "contacts:GivenName", String))
            .with_field(FieldDef::new("surname", "contacts:Surname", String))
            .with_field(FieldDef::new("display_name", "contacts:DisplayName", String))
            .with_field(FieldDef::new("company_name", "contacts:CompanyName", String))
            .with_field(
                FieldDef::new("email_addresses", "contacts:EmailAddress", String).indexed([
                    "EmailAddress1",
                    "EmailAddress2",
                    "EmailAddress3",
                ]),
            )
            .with_field(
                FieldDef::new("phone_numbers", "contacts:PhoneNumber", String).indexed([
                    "BusinessPhone",
                    "HomePhone",
                    "MobilePhone",
                    "CarPhone",
                ]),
            )
            .with_field(
                FieldDef::new(
                    "physical_addresses",
                    "contacts:PhysicalAddress",
                    Nested {
                        subfields: vec![
                            ("street".into(), "contacts:PhysicalAddress:Street".into()),
                            ("city".into(), "contacts:PhysicalAddress:City".into()),
                            ("state".into(), "contacts:PhysicalAddress:State".into()),
                            (
                                "country".into(),
                                "contacts:PhysicalAddress:CountryOrRegion".into(),
                            ),
                            (
                                "zipcode".into(),
                                "contacts:PhysicalAddress:PostalCode".into(),
                            ),
                        ],
                    },
                )
                .indexed(["Business", "Home", "Other"]),
            )
            .with_field(
                FieldDef::new("companies", "contacts:Companies", String)
                    .multi_valued()
                    .search(SearchSupport::None),
            )
            // Task
            .with_field(
                FieldDef::new(
                    "status",
                    "task:Status",
                    choice(&[
                        "NotStarted",
                        "InProgress",
                        "Completed",
                        "WaitingOnOthers",
                        "Deferred",
                    ]),
                )
                .search(SearchSupport::None),
            )
            .with_field(FieldDef::new(
                "percent_complete",
                "task:PercentComplete",
                Decimal,
            ))
            .with_field(FieldDef::new("due_date", "task:DueDate", DateTime))
            .with_item_type("Message", &MESSAGE_FIELDS)
            .with_item_type("CalendarItem", &CALENDAR_FIELDS)
            .with_item_type("Contact", &CONTACT_FIELDS)
            .with_item_type("Task", &TASK_FIELDS)
            .with_item_type("Item", &COMMON_FIELDS)
    }
}

const COMMON_FIELDS: [&str; 12] = [
    "subject",
    "body",
    "importance",
    "categories",
    "datetime_received",
    "datetime_created",
    "size",
    "has_attachments",
    "item_class",
    "sensitivity",
    "reminder_due_by",
    "last_modified_name",
];

const MESSAGE_FIELDS: [&str; 15] = [
    "subject",
    "body",
    "importance",
    "categories",
    "datetime_received",
    "datetime_created",
    "size",
    "has_attachments",
    "item_class",
    "sensitivity",
    "reminder_due_by",
    "last_modified_name",
    "sender",
    "is_read",
    "to_recipients",
];

const CALENDAR_FIELDS: [&str; 8] = [
    "subject",
    "body",
    "start",
    "end",
    "location",
    "is_all_day",
    "required_attendees",
    "legacy_free_busy_status",
];

const CONTACT_FIELDS: [&str; 9] = [
    "subject",
    "given_name",
    "surname",
    "display_name",
    "company_name",
    "email_addresses",
    "phone_numbers",
    "physical_addresses",
    "companies",
];

const TASK_FIELDS: [&str; 5] = ["subject", "body", "status", "percent_complete", "due_date"];
