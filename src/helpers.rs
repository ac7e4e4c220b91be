//! Built-in `{@name}` helpers.
//!
//! Comparison helpers (`eq`, `ne`, `lt`, `lte`, `gt`, `gte`, `default`) can be
//! used on their own with a `key`, or inside `{@select key=..}` where the key
//! is implicit and only the first matching branch renders.

use std::{cell::RefCell, cmp::Ordering, rc::Rc};

use crate::{
    chunk::Chunk,
    context::Context,
    error::{CurlyError, CurlyResult},
    runtime::Bodies,
    value::{Params, Returned, Value, format_number},
};

/// A named helper. Helpers write through the chunk they are given and return
/// the chunk rendering continues from.
pub type HelperFn = Rc<dyn Fn(Chunk, &Context, &Bodies, &Params) -> CurlyResult<Chunk>>;

pub(crate) fn builtins() -> Vec<(&'static str, HelperFn)> {
    vec![
        ("sep", Rc::new(sep) as HelperFn),
        ("idx", Rc::new(idx) as HelperFn),
        ("select", Rc::new(select) as HelperFn),
        ("eq", comparison("eq", |a, b| a.strict_eq(b))),
        ("ne", comparison("ne", |a, b| !a.strict_eq(b))),
        ("lt", comparison("lt", |a, b| a.loose_cmp(b) == Some(Ordering::Less))),
        ("lte", comparison("lte", |a, b| {
            matches!(a.loose_cmp(b), Some(Ordering::Less | Ordering::Equal))
        })),
        ("gt", comparison("gt", |a, b| a.loose_cmp(b) == Some(Ordering::Greater))),
        ("gte", comparison("gte", |a, b| {
            matches!(a.loose_cmp(b), Some(Ordering::Greater | Ordering::Equal))
        })),
        ("default", comparison("default", |_, _| true)),
        ("math", Rc::new(math) as HelperFn),
        ("size", Rc::new(size) as HelperFn),
        ("contextDump", Rc::new(context_dump) as HelperFn),
    ]
}

/// Resolves a param that may be an inline body or a context function into a
/// plain value.
///
/// Plain values are returned as is. A function is rendered through a
/// capturing tap: if it hands back a value that value is used, otherwise the
/// text it wrote, or `false` when it wrote nothing.
pub fn tap(value: &Value, chunk: &Chunk, context: &Context) -> Value {
    let Value::Function(function) = value else {
        return value.clone();
    };
    let output = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&output);
    let tapped = chunk.clone().tap(move |data| {
        sink.borrow_mut().push_str(data);
        String::new()
    });
    match function.call(tapped, context, &Bodies::default(), &Params::new()) {
        Ok(Returned::Value(value)) => value,
        Ok(Returned::Chunk(_)) => {
            let output = output.take();
            if output.is_empty() {
                Value::Bool(false)
            } else {
                Value::String(output)
            }
        }
        Err(error) => {
            tracing::warn!(%error, "Failed to resolve helper parameter");
            Value::Bool(false)
        }
    }
}

fn param(params: &Params, key: &str, chunk: &Chunk, context: &Context) -> Option<Value> {
    params.get(key).map(|value| tap(value, chunk, context))
}

/// Renders the body unless this is the last element of the current
/// iteration.
fn sep(chunk: Chunk, context: &Context, bodies: &Bodies, _: &Params) -> CurlyResult<Chunk> {
    let last = context
        .index()
        .zip(context.length())
        .is_some_and(|(index, length)| index.saturating_add(1) == length);
    match bodies.block() {
        Some(body) if !last => body.render(chunk, context),
        Some(_) | None => Ok(chunk),
    }
}

/// Renders the body with the current iteration index as the context.
fn idx(chunk: Chunk, context: &Context, bodies: &Bodies, _: &Params) -> CurlyResult<Chunk> {
    match bodies.block() {
        Some(body) => body.render(
            chunk,
            &context.push(context.index().map_or(Value::Null, Value::from)),
        ),
        None => Ok(chunk),
    }
}

fn select(chunk: Chunk, context: &Context, bodies: &Bodies, params: &Params) -> CurlyResult<Chunk> {
    let Some(key) = param(params, "key", &chunk, context) else {
        tracing::warn!("No key given in the select helper");
        return Ok(chunk);
    };
    match bodies.block() {
        Some(body) => body.render(chunk, &context.push_select(key)),
        None => {
            tracing::warn!("Missing body block in the select helper");
            Ok(chunk)
        }
    }
}

/// A comparison operand after type coercion.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(f64),
    Other(Value),
}

/// Decides whether the key (first operand) matches the expected value.
type Matcher = fn(&Operand, &Operand) -> bool;

impl Operand {
    fn number(&self) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::Other(value) => value.to_number().unwrap_or(f64::NAN),
        }
    }

    /// Equal kind and equal value; `NaN` equals nothing.
    fn strict_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Other(a), Self::Other(b)) => a == b,
            (Self::Number(_), Self::Other(_)) | (Self::Other(_), Self::Number(_)) => false,
        }
    }

    /// Two strings order by text; anything else orders numerically, and is
    /// unordered when either side is not a number.
    fn loose_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Other(Value::String(a)), Self::Other(Value::String(b))) => Some(a.cmp(b)),
            (Self::Number(_) | Self::Other(_), Self::Number(_) | Self::Other(_)) => {
                self.number().partial_cmp(&other.number())
            }
        }
    }
}

/// Converts a value to the type named by a `type` param. Falsy values are
/// left alone; without a type, numbers compare as numbers and everything
/// else as itself.
fn coerce(value: Value, kind: Option<&str>, context: &Context) -> Operand {
    let falsy = match &value {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Null
        | Value::Bool(_)
        | Value::String(_)
        | Value::Array(_)
        | Value::Object(_)
        | Value::Function(_) => !value.is_truthy(),
    };
    if falsy {
        return as_operand(value);
    }
    match kind {
        Some("number") => Operand::Number(value.to_number().unwrap_or(f64::NAN)),
        Some("string") => Operand::Other(Value::String(value.to_string())),
        Some("boolean") => Operand::Other(Value::Bool(value.as_str() != Some("false"))),
        Some("context") => as_operand(context.get(&value.to_string()).unwrap_or_default()),
        Some(_) | None => as_operand(value),
    }
}

fn as_operand(value: Value) -> Operand {
    match value {
        Value::Number(n) => Operand::Number(n.as_f64().unwrap_or(f64::NAN)),
        other @ (Value::Null
        | Value::Bool(_)
        | Value::String(_)
        | Value::Array(_)
        | Value::Object(_)
        | Value::Function(_)) => Operand::Other(other),
    }
}

fn comparison(helper: &'static str, matches: Matcher) -> HelperFn {
    Rc::new(
        move |chunk: Chunk, context: &Context, bodies: &Bodies, params: &Params| {
            compare(chunk, context, bodies, params, helper, matches)
        },
    )
}

const fn never(_: &Operand, _: &Operand) -> bool {
    false
}

/// Shared implementation of the comparison helpers.
///
/// The key is the `key` param or, inside a select, the select's key. Once a
/// branch of a select has matched, later branches that rely on its key never
/// match.
fn compare(
    chunk: Chunk,
    context: &Context,
    bodies: &Bodies,
    params: &Params,
    helper: &str,
    matches: Matcher,
) -> CurlyResult<Chunk> {
    let select = context.select();
    let (actual, matches) = if let Some(key) = param(params, "key", &chunk, context) {
        (key, matches)
    } else if let Some(select) = &select {
        let matches: Matcher = if select.is_resolved() { never } else { matches };
        (select.key.clone(), matches)
    } else {
        tracing::warn!(helper, "No key specified for filter helper");
        return Ok(chunk);
    };
    let expected = param(params, "value", &chunk, context).unwrap_or_default();
    let kind = params.get("type").and_then(Value::as_str);

    if matches(&coerce(actual, kind, context), &coerce(expected, kind, context)) {
        if let Some(select) = &select {
            select.resolve();
        }
        match bodies.block() {
            Some(body) => body.render(chunk, context),
            None => {
                tracing::warn!(helper, "Missing body block in the helper");
                Ok(chunk)
            }
        }
    } else if let Some(skip) = bodies.else_body() {
        skip.render(chunk, context)
    } else {
        Ok(chunk)
    }
}

fn parse_float(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) | Value::Function(_) => {
            f64::NAN
        }
    }
}

/// Rounds half-way cases up, towards positive infinity.
fn round_half_up(n: f64) -> f64 {
    let floor = n.floor();
    if n - floor >= 0.5 { floor + 1.0 } else { floor }
}

/// `{@math key=.. method=.. operand=.. round=true/}` writes the result; with a
/// body the result becomes the key of an implicit select.
fn math(chunk: Chunk, context: &Context, bodies: &Bodies, params: &Params) -> CurlyResult<Chunk> {
    let key = param(params, "key", &chunk, context);
    let method = param(params, "method", &chunk, context).filter(Value::is_truthy);
    let (Some(key), Some(method)) = (key, method) else {
        tracing::warn!("Key is a required parameter for math helper along with method/operand");
        return Ok(chunk);
    };
    let key = parse_float(&key);
    let operand = param(params, "operand", &chunk, context)
        .as_ref()
        .map_or(f64::NAN, parse_float);
    let method = method.to_string();

    let result = match method.as_str() {
        "add" => key + operand,
        "subtract" => key - operand,
        "multiply" => key * operand,
        "divide" => key / operand,
        "mod" => key % operand,
        "ceil" => key.ceil(),
        "floor" => key.floor(),
        "round" => round_half_up(key),
        "abs" => key.abs(),
        other => {
            tracing::warn!(method = other, "Math method is not supported");
            return Ok(chunk);
        }
    };
    let round = params.get("round").is_some_and(Value::is_truthy);
    let result = if round { round_half_up(result) } else { result };

    match bodies.block() {
        Some(body) => body.render(chunk, &context.push_select(Value::from(result))),
        None => Ok(chunk.write(&format_number(result))),
    }
}

/// Writes the size of `key`: array length, object key count, string length,
/// or the value itself for numbers.
fn size(chunk: Chunk, context: &Context, _: &Bodies, params: &Params) -> CurlyResult<Chunk> {
    let size = match param(params, "key", &chunk, context) {
        None | Some(Value::Null | Value::Bool(_) | Value::Function(_)) => "0".to_string(),
        Some(Value::Array(items)) => items.len().to_string(),
        Some(Value::Object(map)) => map.len().to_string(),
        Some(number @ Value::Number(_)) => number.to_string(),
        Some(Value::String(s)) if s.is_empty() => "0".to_string(),
        Some(Value::String(s)) if s.trim().parse::<f64>().is_ok_and(f64::is_finite) => s,
        Some(Value::String(s)) => s.encode_utf16().count().to_string(),
    };
    Ok(chunk.write(&size))
}

/// Dumps the current frame (`key="current"`, the default) or the whole stack
/// (`key="full"`) as indented JSON, to the output or (`to="console"`) the log.
fn context_dump(chunk: Chunk, context: &Context, _: &Bodies, params: &Params) -> CurlyResult<Chunk> {
    let key = param(params, "key", &chunk, context).map(|v| v.to_string());
    let to = param(params, "to", &chunk, context).map(|v| v.to_string());
    let dump = if key.as_deref() == Some("full") {
        context.stack_json()
    } else {
        context.current().map_or(serde_json::Value::Null, Value::to_json)
    };
    let dump = serde_json::to_string_pretty(&dump)
        .map_err(|error| CurlyError::helper("contextDump", error))?;
    if to.as_deref() == Some("console") {
        tracing::info!(%dump, "contextDump");
        Ok(chunk)
    } else {
        Ok(chunk.write(&dump))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_coerce() {
        let ctx = Context::new(json!({"a": "x"}));
        assert_eq!(coerce(Value::from("5"), Some("number"), &ctx), Operand::Number(5.0));
        assert_eq!(coerce(Value::from(5), Some("string"), &ctx), Operand::Other(Value::from("5")));
        assert_eq!(coerce(Value::from("false"), Some("boolean"), &ctx), Operand::Other(Value::from(false)));
        assert_eq!(coerce(Value::from("yes"), Some("boolean"), &ctx), Operand::Other(Value::from(true)));
        assert_eq!(coerce(Value::from("a"), Some("context"), &ctx), Operand::Other(Value::from("x")));
        assert_eq!(coerce(Value::from(""), Some("number"), &ctx), Operand::Other(Value::from("")));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_operand_comparisons() {
        let n = Operand::Number;
        let s = |x: &str| Operand::Other(Value::from(x));
        let b = |x: bool| Operand::Other(Value::from(x));
        assert_eq!(n(1.0).loose_cmp(&n(2.0)), Some(Ordering::Less));
        assert_eq!(s("b").loose_cmp(&s("a")), Some(Ordering::Greater));
        assert_eq!(s("10").loose_cmp(&s("9")), Some(Ordering::Less));
        assert_eq!(n(3.0).loose_cmp(&s("3")), Some(Ordering::Equal));
        assert_eq!(n(3.0).loose_cmp(&s("x")), None);
        assert!(!n(3.0).strict_eq(&s("3")));
        assert!(!b(true).strict_eq(&s("1")));
        assert!(b(true).strict_eq(&b(true)));
        assert!(!n(f64::NAN).strict_eq(&n(f64::NAN)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_round_half_up() {
        assert_eq!(round_half_up(2.5), 3.0);
        assert_eq!(round_half_up(-2.5), -2.0);
        assert_eq!(round_half_up(2.4), 2.0);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tap_plain_and_function_values() {
        let ctx = Context::new(json!({}));
        let chunk = Chunk::stub(|_| {});
        assert_eq!(tap(&Value::from("x"), &chunk, &ctx), Value::from("x"));

        let writes = Value::function(|chunk, _, _, _| Ok(Returned::Chunk(chunk.write("hi"))));
        assert_eq!(tap(&writes, &chunk, &ctx), Value::from("hi"));

        let silent = Value::function(|chunk, _, _, _| Ok(Returned::Chunk(chunk)));
        assert_eq!(tap(&silent, &chunk, &ctx), Value::from(false));

        let returns = Value::function(|_, _, _, _| Ok(Returned::Value(Value::from(7))));
        assert_eq!(tap(&returns, &chunk, &ctx), Value::from(7));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tap_leaves_chunk_untapped() {
        let out = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&out);
        let chunk = Chunk::stub(move |result| *sink.borrow_mut() = Some(result));
        let ctx = Context::new(json!({}));
        let writes = Value::function(|chunk, _, _, _| Ok(Returned::Chunk(chunk.write("hidden"))));
        assert_eq!(tap(&writes, &chunk, &ctx), Value::from("hidden"));
        chunk.write("shown").end();
        assert_eq!(out.take(), Some(Ok("shown".to_string())));
    }
}
