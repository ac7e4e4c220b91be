//! The built-in filters applied by `{name|filter}` references.

use std::rc::Rc;

use pct_str::{Encoder, PctString};

use crate::value::Value;

/// A named filter. Filters receive the referenced value (or the output of the
/// previous filter) and return the value to pass on.
pub type FilterFn = Rc<dyn Fn(&Value) -> Value>;

pub(crate) fn builtins() -> Vec<(&'static str, FilterFn)> {
    vec![
        ("h", Rc::new(|v: &Value| text(v, escape_html)) as FilterFn),
        ("j", Rc::new(|v: &Value| text(v, escape_js)) as FilterFn),
        ("u", Rc::new(|v: &Value| text(v, encode_uri)) as FilterFn),
        ("uc", Rc::new(|v: &Value| text(v, encode_uri_component)) as FilterFn),
        ("js", Rc::new(json_stringify) as FilterFn),
        ("jp", Rc::new(json_parse) as FilterFn),
    ]
}

/// Applies a text transform to the value as it would be rendered.
fn text(value: &Value, transform: fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(transform(s)),
        Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::Array(_)
        | Value::Object(_)
        | Value::Function(_) => Value::String(transform(&value.to_string())),
    }
}

/// Escapes `& < > " '` for use in HTML text and attribute values.
pub fn escape_html(s: &str) -> String {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len().saturating_add(8));
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Escapes a string for embedding inside a quoted JavaScript string literal.
pub fn escape_js(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            '\n' => out.push_str("\\n"),
            '\u{0c}' => out.push_str("\\f"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Characters left alone by both URI encoders.
const fn unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')')
}

/// Encodes everything except unreserved characters and URI delimiters.
struct UriEncoder;

impl Encoder for UriEncoder {
    fn encode(&self, c: char) -> bool {
        !(unreserved(c)
            || matches!(
                c,
                ';' | ',' | '/' | '?' | ':' | '@' | '&' | '=' | '+' | '$' | '#'
            ))
    }
}

/// Encodes everything except unreserved characters.
struct UriComponentEncoder;

impl Encoder for UriComponentEncoder {
    fn encode(&self, c: char) -> bool {
        !unreserved(c)
    }
}

pub fn encode_uri(s: &str) -> String {
    PctString::encode(s.chars(), UriEncoder).to_string()
}

pub fn encode_uri_component(s: &str) -> String {
    PctString::encode(s.chars(), UriComponentEncoder).to_string()
}

fn json_stringify(value: &Value) -> Value {
    match serde_json::to_string(&value.to_json()) {
        Ok(json) => Value::String(json),
        Err(error) => {
            tracing::warn!(%error, "JSON stringify failed");
            value.clone()
        }
    }
}

/// Parses a JSON string. Anything that is not a string, or does not parse, is
/// passed through unchanged.
fn json_parse(value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(parsed) => Value::from(parsed),
        Err(error) => {
            tracing::warn!(%error, "JSON parse failed");
            value.clone()
        }
    }
}
