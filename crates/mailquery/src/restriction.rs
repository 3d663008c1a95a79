//! The restriction compiler.
//!
//! Splits a filter expression into the part the search service can evaluate
//! and a residual the client evaluates after fetching, then renders the
//! server part as the service's `Restriction` XML element.
//!
//! Splitting happens at the top-level `AND` only. An `OR` or `NOT` node with
//! any child the server cannot evaluate goes to the residual as a whole,
//! since fetching a superset is only correct for conjunctions.

use std::fmt;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::{QueryError, Result};
use crate::expr::{and_of, Expr, Filter};
use crate::lookup::{FieldLookup, LookupOp, Operand};
use crate::schema::{FieldDef, SchemaTable, SearchSupport};
use crate::service::Capabilities;
use crate::traits::FieldSource;
use crate::value::Value;

/// A compiled filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Restriction {
    /// The server-evaluated part. `None` means no server filter.
    pub server: Option<Expr>,
    /// The part left for client-side evaluation.
    pub residual: Option<Expr>,
    /// Raw query string, passed through instead of a restriction.
    pub query_string: Option<String>,
    /// Wire form of `server` or `query_string`.
    pub xml: Option<String>,
}

impl Restriction {
    /// Whether the server evaluates the whole filter.
    pub fn is_fully_server(&self) -> bool {
        self.residual.is_none()
    }

    /// Whether nothing is sent to the server.
    pub fn is_unrestricted(&self) -> bool {
        self.server.is_none() && self.query_string.is_none()
    }

    /// Evaluates the residual, if any, against a record.
    pub fn residual_matches<R: FieldSource + ?Sized>(&self, record: &R) -> bool {
        self.residual.as_ref().map_or(true, |r| r.matches(record))
    }
}

/// Compiles [`Filter`]s for one schema and one service's capabilities.
#[derive(Debug, Clone, Copy)]
pub struct RestrictionCompiler<'a> {
    schema: &'a SchemaTable,
    caps: &'a Capabilities,
}

impl<'a> RestrictionCompiler<'a> {
    pub fn new(schema: &'a SchemaTable, caps: &'a Capabilities) -> Self {
        Self { schema, caps }
    }

    /// Compiles a filter.
    ///
    /// # Errors
    ///
    /// [`QueryError::UnsupportedFilter`] when a referenced field is unknown
    /// or not searchable anywhere.
    pub fn compile(&self, filter: &Filter) -> Result<Restriction> {
        match filter {
            Filter::QueryString(query) => Ok(Restriction {
                query_string: Some(query.clone()),
                xml: Some(render_query_string(query)?),
                ..Restriction::default()
            }),
            // Never sent; the query set short-circuits before any request.
            Filter::Nothing => Ok(Restriction {
                residual: Some(Expr::Or(Vec::new())),
                ..Restriction::default()
            }),
            Filter::Expr(expr) => self.compile_expr(expr),
        }
    }

    fn compile_expr(&self, expr: &Expr) -> Result<Restriction> {
        if expr.is_all() {
            return Ok(Restriction::default());
        }
        let (server, residual) = match expr {
            Expr::And(children) => {
                let mut server = Vec::new();
                let mut residual = Vec::new();
                for child in children {
                    if self.is_server(child)? {
                        server.push(child.clone());
                    } else {
                        residual.push(child.clone());
                    }
                }
                (
                    (!server.is_empty()).then(|| and_of(server)),
                    (!residual.is_empty()).then(|| and_of(residual)),
                )
            }
            other => {
                if self.is_server(other)? {
                    (Some(other.clone()), None)
                } else {
                    (None, Some(other.clone()))
                }
            }
        };

        let xml = match &server {
            Some(server) => Some(self.render(server)?),
            None => None,
        };
        if let Some(residual) = &residual {
            tracing::debug!(residual = %residual, "filter needs client-side evaluation");
        }
        Ok(Restriction {
            server,
            residual,
            query_string: None,
            xml,
        })
    }

    /// Classifies a subtree, visiting every leaf so unsupported fields are
    /// reported even inside residual branches.
    fn is_server(&self, expr: &Expr) -> Result<bool> {
        match expr {
            Expr::Lookup(lookup) => self.lookup_is_server(lookup),
            Expr::Or(children) if children.is_empty() => Ok(false),
            Expr::And(children) | Expr::Or(children) => {
                let mut all = true;
                for child in children {
                    all &= self.is_server(child)?;
                }
                Ok(all)
            }
            Expr::Not(inner) => self.is_server(inner),
        }
    }

    fn lookup_is_server(&self, lookup: &FieldLookup) -> Result<bool> {
        let def = self.field(lookup)?;
        match def.search {
            SearchSupport::None => Err(QueryError::unsupported(
                lookup.path.to_string(),
                "field is not searchable",
            )),
            SearchSupport::Client => Ok(false),
            SearchSupport::Server => {
                Ok(!lookup.op.is_case_insensitive() || self.caps.case_insensitive_match)
            }
        }
    }

    fn field(&self, lookup: &FieldLookup) -> Result<&'a FieldDef> {
        self.schema
            .resolve(&lookup.path)
            .ok_or_else(|| QueryError::unsupported(lookup.path.to_string(), "unknown field"))
    }

    /// Renders a server-evaluable expression as a `m:Restriction` element.
    pub fn render(&self, expr: &Expr) -> Result<String> {
        let mut out = XmlOut::new();
        out.start("m:Restriction", &[])?;
        self.render_node(&mut out, expr)?;
        out.end("m:Restriction")?;
        out.finish()
    }

    fn render_node(&self, out: &mut XmlOut, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Lookup(lookup) => self.render_lookup(out, lookup),
            Expr::And(children) => self.render_group(out, "t:And", children),
            Expr::Or(children) => self.render_group(out, "t:Or", children),
            Expr::Not(inner) => {
                out.start("t:Not", &[])?;
                self.render_node(out, inner)?;
                out.end("t:Not")
            }
        }
    }

    fn render_group(&self, out: &mut XmlOut, tag: &str, children: &[Expr]) -> Result<()> {
        if let [only] = children {
            return self.render_node(out, only);
        }
        out.start(tag, &[])?;
        for child in children {
            self.render_node(out, child)?;
        }
        out.end(tag)
    }

    fn render_lookup(&self, out: &mut XmlOut, lookup: &FieldLookup) -> Result<()> {
        let def = self.field(lookup)?;
        let field = FieldRef::new(def, lookup)?;

        match (lookup.op, &lookup.operand) {
            (LookupOp::Exists, Operand::Value(Value::Bool(present))) => {
                if !present {
                    out.start("t:Not", &[])?;
                }
                out.start("t:Exists", &[])?;
                field.write(out)?;
                out.end("t:Exists")?;
                if !present {
                    out.end("t:Not")?;
                }
                Ok(())
            }
            (LookupOp::Range, Operand::Range(lo, hi)) => {
                out.start("t:And", &[])?;
                compare(out, "t:IsGreaterThanOrEqualTo", &field, lo, lookup)?;
                compare(out, "t:IsLessThanOrEqualTo", &field, hi, lookup)?;
                out.end("t:And")
            }
            (LookupOp::In, Operand::List(items)) => {
                equal_to_each(out, "t:Or", &field, items, lookup)
            }
            (LookupOp::Contains, Operand::List(items)) => {
                equal_to_each(out, "t:And", &field, items, lookup)
            }
            (op, Operand::Value(value)) => match op {
                LookupOp::Exact => compare(out, "t:IsEqualTo", &field, value, lookup),
                LookupOp::Not => compare(out, "t:IsNotEqualTo", &field, value, lookup),
                LookupOp::Gt => compare(out, "t:IsGreaterThan", &field, value, lookup),
                LookupOp::Gte => compare(out, "t:IsGreaterThanOrEqualTo", &field, value, lookup),
                LookupOp::Lt => compare(out, "t:IsLessThan", &field, value, lookup),
                LookupOp::Lte => compare(out, "t:IsLessThanOrEqualTo", &field, value, lookup),
                LookupOp::IExact => contains(out, "FullString", "IgnoreCase", &field, value, lookup),
                LookupOp::Contains => contains(out, "Substring", "Exact", &field, value, lookup),
                LookupOp::IContains => {
                    contains(out, "Substring", "IgnoreCase", &field, value, lookup)
                }
                LookupOp::StartsWith => contains(out, "Prefixed", "Exact", &field, value, lookup),
                LookupOp::IStartsWith => {
                    contains(out, "Prefixed", "IgnoreCase", &field, value, lookup)
                }
                other => Err(unrenderable(lookup, other)),
            },
            (op, _) => Err(unrenderable(lookup, op)),
        }
    }
}

/// A field reference element: `t:FieldURI` or `t:IndexedFieldURI`.
struct FieldRef<'a> {
    uri: &'a str,
    index: Option<&'a str>,
}

impl<'a> FieldRef<'a> {
    fn new(def: &'a FieldDef, lookup: &'a FieldLookup) -> Result<Self> {
        let uri = match &lookup.path.subfield {
            Some(sub) => def.subfield_wire_name(sub).ok_or_else(|| {
                QueryError::unsupported(lookup.path.to_string(), "unknown subfield")
            })?,
            None => def.wire_name.as_str(),
        };
        Ok(Self {
            uri,
            index: lookup.path.label.as_deref(),
        })
    }

    fn write(&self, out: &mut XmlOut) -> Result<()> {
        match self.index {
            Some(index) => out.empty(
                "t:IndexedFieldURI",
                &[("FieldURI", self.uri), ("FieldIndex", index)],
            ),
            None => out.empty("t:FieldURI", &[("FieldURI", self.uri)]),
        }
    }
}

fn wire_text(value: &Value, lookup: &FieldLookup) -> Result<String> {
    value.to_wire_text().ok_or_else(|| {
        QueryError::unsupported(
            lookup.path.to_string(),
            format!("{} operand has no wire form", value.type_name()),
        )
    })
}

fn compare(
    out: &mut XmlOut,
    tag: &str,
    field: &FieldRef<'_>,
    value: &Value,
    lookup: &FieldLookup,
) -> Result<()> {
    let text = wire_text(value, lookup)?;
    out.start(tag, &[])?;
    field.write(out)?;
    out.start("t:FieldURIOrConstant", &[])?;
    out.empty("t:Constant", &[("Value", text.as_str())])?;
    out.end("t:FieldURIOrConstant")?;
    out.end(tag)
}

fn contains(
    out: &mut XmlOut,
    mode: &str,
    comparison: &str,
    field: &FieldRef<'_>,
    value: &Value,
    lookup: &FieldLookup,
) -> Result<()> {
    let text = wire_text(value, lookup)?;
    out.start(
        "t:Contains",
        &[
            ("ContainmentMode", mode),
            ("ContainmentComparison", comparison),
        ],
    )?;
    field.write(out)?;
    out.empty("t:Constant", &[("Value", text.as_str())])?;
    out.end("t:Contains")
}

fn equal_to_each(
    out: &mut XmlOut,
    group: &str,
    field: &FieldRef<'_>,
    items: &[Value],
    lookup: &FieldLookup,
) -> Result<()> {
    if let [only] = items {
        return compare(out, "t:IsEqualTo", field, only, lookup);
    }
    out.start(group, &[])?;
    for item in items {
        compare(out, "t:IsEqualTo", field, item, lookup)?;
    }
    out.end(group)
}

fn unrenderable(lookup: &FieldLookup, op: LookupOp) -> QueryError {
    QueryError::unsupported(
        lookup.path.to_string(),
        format!("operator {} cannot be sent to the server with this operand", op),
    )
}

fn render_query_string(query: &str) -> Result<String> {
    let mut out = XmlOut::new();
    out.start("m:QueryString", &[])?;
    out.text(query)?;
    out.end("m:QueryString")?;
    out.finish()
}

fn render_error(err: impl fmt::Display) -> QueryError {
    QueryError::Render(err.to_string())
}

/// Thin wrapper over the `quick-xml` writer.
struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn element<'b>(name: &'b str, attrs: &[(&'b str, &'b str)]) -> BytesStart<'b> {
        let mut start = BytesStart::new(name);
        for &attr in attrs {
            start.push_attribute(attr);
        }
        start
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.writer
            .write_event(Event::Start(Self::element(name, attrs)))
            .map_err(render_error)
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.writer
            .write_event(Event::Empty(Self::element(name, attrs)))
            .map_err(render_error)
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(render_error)
    }

    fn text(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(render_error)
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner()).map_err(render_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{not_of, or_of};
    use chrono::{TimeZone, Utc};

    fn leaf(key: &str, operand: impl Into<Operand>) -> Expr {
        Expr::lookup(key, operand).unwrap()
    }

    fn compile(expr: Expr) -> Result<Restriction> {
        let schema = SchemaTable::mailbox();
        let caps = Capabilities::default();
        RestrictionCompiler::new(&schema, &caps).compile(&Filter::Expr(expr))
    }

    #[test]
    fn empty_filter_compiles_to_nothing() {
        let r = compile(Expr::all()).unwrap();
        assert!(r.is_unrestricted());
        assert!(r.is_fully_server());
        assert_eq!(r.xml, None);
    }

    #[test]
    fn exact_renders_is_equal_to() {
        let r = compile(leaf("subject", "a&b")).unwrap();
        assert_eq!(
            r.xml.unwrap(),
            "<m:Restriction><t:IsEqualTo><t:FieldURI FieldURI=\"item:Subject\"/>\
             <t:FieldURIOrConstant><t:Constant Value=\"a&amp;b\"/></t:FieldURIOrConstant>\
             </t:IsEqualTo></m:Restriction>"
        );
    }

    #[test]
    fn case_insensitive_contains() {
        let r = compile(leaf("subject__icontains", "x")).unwrap();
        let xml = r.xml.unwrap();
        assert!(xml.contains(
            "<t:Contains ContainmentMode=\"Substring\" ContainmentComparison=\"IgnoreCase\">"
        ));
    }

    #[test]
    fn case_insensitive_falls_back_without_support() {
        let schema = SchemaTable::mailbox();
        let caps = Capabilities {
            case_insensitive_match: false,
            ..Capabilities::default()
        };
        let expr = and_of([leaf("subject__iexact", "x"), leaf("size__gt", 5i64)]);
        let r = RestrictionCompiler::new(&schema, &caps)
            .compile(&Filter::Expr(expr))
            .unwrap();
        assert_eq!(r.server, Some(leaf("size__gt", 5i64)));
        assert_eq!(r.residual, Some(leaf("subject__iexact", "x")));
    }

    #[test]
    fn range_and_in_expand() {
        let xml = compile(leaf("size__range", (1i64, 9i64))).unwrap().xml.unwrap();
        assert!(xml.starts_with("<m:Restriction><t:And><t:IsGreaterThanOrEqualTo>"));
        assert!(xml.contains("<t:IsLessThanOrEqualTo>"));

        let xml = compile(leaf("importance__in", vec!["High", "Low"])).unwrap().xml.unwrap();
        assert!(xml.starts_with("<m:Restriction><t:Or><t:IsEqualTo>"));
        assert_eq!(xml.matches("<t:IsEqualTo>").count(), 2);
    }

    #[test]
    fn list_contains_is_and_of_equalities() {
        let xml = compile(leaf("categories__contains", vec!["a", "b"]))
            .unwrap()
            .xml
            .unwrap();
        assert!(xml.starts_with("<m:Restriction><t:And><t:IsEqualTo>"));
    }

    #[test]
    fn exists_false_wraps_in_not() {
        let xml = compile(leaf("body__exists", false)).unwrap().xml.unwrap();
        assert_eq!(
            xml,
            "<m:Restriction><t:Not><t:Exists><t:FieldURI FieldURI=\"item:Body\"/></t:Exists>\
             </t:Not></m:Restriction>"
        );
    }

    #[test]
    fn indexed_fields_use_indexed_uri() {
        let xml = compile(leaf("physical_addresses.Home.city", "Oslo"))
            .unwrap()
            .xml
            .unwrap();
        assert!(xml.contains(
            "<t:IndexedFieldURI FieldURI=\"contacts:PhysicalAddress:City\" FieldIndex=\"Home\"/>"
        ));
    }

    #[test]
    fn datetimes_are_sent_in_utc() {
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let xml = compile(leaf("start__gte", when)).unwrap().xml.unwrap();
        assert!(xml.contains("Value=\"2024-05-01T08:30:00Z\""));
    }

    #[test]
    fn and_splits_into_server_and_residual() {
        let client = leaf("reminder_due_by__exists", true);
        let server = leaf("subject", "x");
        let r = compile(and_of([server.clone(), client.clone()])).unwrap();
        assert_eq!(r.server, Some(server));
        assert_eq!(r.residual, Some(client));
        assert!(!r.is_fully_server());
    }

    #[test]
    fn or_with_client_child_is_all_residual() {
        let e = or_of([leaf("subject", "x"), leaf("last_modified_name", "bob")]);
        let r = compile(e.clone()).unwrap();
        assert_eq!(r.server, None);
        assert_eq!(r.residual, Some(e));

        let e = not_of(leaf("last_modified_name__icontains", "bob"));
        let r = compile(e.clone()).unwrap();
        assert_eq!(r.residual, Some(e));
    }

    #[test]
    fn unsearchable_fields_are_rejected() {
        let err = compile(leaf("status", "Completed")).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedFilter { ref path, .. } if path == "status"));

        let err = compile(leaf("nope", "x")).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedFilter { .. }));

        // Reported even when nested under a residual OR.
        let e = or_of([leaf("last_modified_name", "bob"), leaf("status", "Completed")]);
        assert!(compile(e).is_err());
    }

    #[test]
    fn query_string_passes_through() {
        let schema = SchemaTable::mailbox();
        let caps = Capabilities::default();
        let filter = Filter::default().with_query_string("subject:<hi>").unwrap();
        let r = RestrictionCompiler::new(&schema, &caps).compile(&filter).unwrap();
        assert_eq!(r.query_string.as_deref(), Some("subject:<hi>"));
        assert_eq!(
            r.xml.unwrap(),
            "<m:QueryString>subject:&lt;hi&gt;</m:QueryString>"
        );
    }
}
