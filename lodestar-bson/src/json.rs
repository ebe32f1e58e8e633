//! Canonical text rendering.
//!
//! Two dialects are supported: [`JsonOutputMode::Strict`], which is valid JSON
//! using `$`-prefixed wrappers for types JSON lacks, and
//! [`JsonOutputMode::Shell`], which uses constructor syntax such as
//! `NumberLong(5)`. Rendering is deterministic and meant for logs and
//! diagnostics; it is never parsed back.

use std::fmt::Write;

use crate::document::Document;
use crate::value::{Binary, Bson, DateTime};

/// Output dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonOutputMode {
    /// JSON with extended-type wrappers.
    #[default]
    Strict,
    /// Interactive shell syntax.
    Shell,
}

/// Settings for [`to_json_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonWriterSettings {
    /// Dialect.
    pub output_mode: JsonOutputMode,
    /// Indentation unit. `None` renders on a single line.
    pub indent: Option<String>,
    /// Line separator used when indenting.
    pub new_line: String,
}

impl Default for JsonWriterSettings {
    fn default() -> Self {
        Self {
            output_mode: JsonOutputMode::Strict,
            indent: None,
            new_line: "\n".to_string(),
        }
    }
}

impl JsonWriterSettings {
    /// Strict dialect on one line.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Shell dialect on one line.
    pub fn shell() -> Self {
        Self {
            output_mode: JsonOutputMode::Shell,
            ..Self::default()
        }
    }

    /// Indent nested documents with `indent`.
    pub fn with_indent(mut self, indent: impl Into<String>) -> Self {
        self.indent = Some(indent.into());
        self
    }

    /// Use `new_line` between indented lines.
    pub fn with_new_line(mut self, new_line: impl Into<String>) -> Self {
        self.new_line = new_line.into();
        self
    }
}

/// Render a value in the strict dialect.
pub fn to_json(value: &Bson) -> String {
    to_json_with(value, &JsonWriterSettings::default())
}

/// Render a document in the strict dialect.
pub fn document_to_json(document: &Document) -> String {
    document_to_json_with(document, &JsonWriterSettings::default())
}

/// Render a value with explicit settings.
pub fn to_json_with(value: &Bson, settings: &JsonWriterSettings) -> String {
    let mut out = String::new();
    JsonRenderer { settings, out: &mut out }.value(value, 0);
    out
}

/// Render a document with explicit settings.
pub fn document_to_json_with(document: &Document, settings: &JsonWriterSettings) -> String {
    let mut out = String::new();
    JsonRenderer { settings, out: &mut out }.document(document, 0);
    out
}

impl Document {
    /// Render with explicit settings.
    pub fn to_json_with(&self, settings: &JsonWriterSettings) -> String {
        document_to_json_with(self, settings)
    }
}

struct JsonRenderer<'a> {
    settings: &'a JsonWriterSettings,
    out: &'a mut String,
}

impl JsonRenderer<'_> {
    fn shell(&self) -> bool {
        self.settings.output_mode == JsonOutputMode::Shell
    }

    fn document(&mut self, document: &Document, depth: usize) {
        if document.is_empty() {
            self.out.push_str("{ }");
            return;
        }
        self.out.push('{');
        let mut first = true;
        for (name, value) in document {
            if !first {
                self.out.push(',');
            }
            first = false;
            self.break_line(depth + 1);
            self.string(name);
            self.out.push_str(" : ");
            self.value(value, depth + 1);
        }
        self.break_line(depth);
        self.out.push('}');
    }

    fn break_line(&mut self, depth: usize) {
        match &self.settings.indent {
            Some(indent) => {
                self.out.push_str(&self.settings.new_line);
                for _ in 0..depth {
                    self.out.push_str(indent);
                }
            }
            None => self.out.push(' '),
        }
    }

    fn value(&mut self, value: &Bson, depth: usize) {
        match value {
            Bson::Double(v) => self.out.push_str(&format_double(*v)),
            Bson::String(s) => self.string(s),
            Bson::Document(d) => self.document(d, depth),
            Bson::Array(items) => {
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.value(item, depth);
                }
                self.out.push(']');
            }
            Bson::Binary(b) => self.binary(b),
            Bson::ObjectId(oid) => {
                if self.shell() {
                    let _ = write!(self.out, "ObjectId(\"{}\")", oid);
                } else {
                    let _ = write!(self.out, "{{ \"$oid\" : \"{}\" }}", oid);
                }
            }
            Bson::Boolean(b) => self.out.push_str(if *b { "true" } else { "false" }),
            Bson::DateTime(dt) => self.datetime(*dt),
            Bson::Null => self.out.push_str("null"),
            Bson::RegularExpression(re) => {
                if self.shell() {
                    let _ = write!(self.out, "/{}/{}", re.pattern.replace('/', "\\/"), re.options);
                } else {
                    self.out.push_str("{ \"$regex\" : ");
                    self.string(&re.pattern);
                    self.out.push_str(", \"$options\" : ");
                    self.string(&re.options);
                    self.out.push_str(" }");
                }
            }
            Bson::JavaScriptCode(code) => {
                self.out.push_str("{ \"$code\" : ");
                self.string(code);
                self.out.push_str(" }");
            }
            Bson::Int32(v) => {
                let _ = write!(self.out, "{}", v);
            }
            Bson::Timestamp(ts) => {
                if self.shell() {
                    let _ = write!(self.out, "Timestamp({}, {})", ts.time, ts.increment);
                } else {
                    let _ = write!(
                        self.out,
                        "{{ \"$timestamp\" : {{ \"t\" : {}, \"i\" : {} }} }}",
                        ts.time, ts.increment
                    );
                }
            }
            Bson::Int64(v) => {
                if self.shell() {
                    let _ = write!(self.out, "NumberLong({})", v);
                } else {
                    let _ = write!(self.out, "{{ \"$numberLong\" : \"{}\" }}", v);
                }
            }
            Bson::MinKey => {
                self.out
                    .push_str(if self.shell() { "MinKey" } else { "{ \"$minKey\" : 1 }" })
            }
            Bson::MaxKey => {
                self.out
                    .push_str(if self.shell() { "MaxKey" } else { "{ \"$maxKey\" : 1 }" })
            }
        }
    }

    fn string(&mut self, s: &str) {
        match serde_json::to_string(s) {
            Ok(quoted) => self.out.push_str(&quoted),
            Err(_) => {
                let _ = write!(self.out, "\"{}\"", s.escape_default());
            }
        }
    }

    fn binary(&mut self, binary: &Binary) {
        let subtype: u8 = binary.subtype.into();
        let data = hex::encode(&binary.bytes);
        if self.shell() {
            let _ = write!(self.out, "HexData({}, \"{}\")", subtype, data);
        } else {
            let _ = write!(
                self.out,
                "{{ \"$binary\" : \"{}\", \"$type\" : \"{:02x}\" }}",
                data, subtype
            );
        }
    }

    fn datetime(&mut self, dt: DateTime) {
        if self.shell() {
            match dt.to_rfc3339() {
                Some(iso) => {
                    let _ = write!(self.out, "ISODate(\"{}\")", iso);
                }
                None => {
                    let _ = write!(self.out, "new Date({})", dt.timestamp_millis());
                }
            }
        } else {
            let _ = write!(self.out, "{{ \"$date\" : {} }}", dt.timestamp_millis());
        }
    }
}

fn format_double(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let s = format!("{:?}", v);
    if s.contains('.') {
        return s;
    }
    // Exponent form such as `1e20` gains a fractional digit.
    match s.find('e') {
        Some(pos) => format!("{}.0{}", &s[..pos], &s[pos..]),
        None => format!("{}.0", s),
    }
}
