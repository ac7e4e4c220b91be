use std::{collections::BTreeMap, fmt, rc::Rc};

use serde_json::Number;

use crate::{
    chunk::Chunk,
    context::Context,
    error::CurlyResult,
    runtime::Bodies,
};

/// Evaluated `key=value` pairs of a section, helper or partial tag.
pub type Params = BTreeMap<String, Value>;

/// What a [`ContextFn`] hands back to the renderer.
pub enum Returned {
    /// The function wrote its own output; rendering continues from this chunk.
    Chunk(Chunk),
    /// A plain value to be treated as if it had been found in the data.
    Value(Value),
}

type HostFn = dyn Fn(Chunk, &Context, &Bodies, &Params) -> CurlyResult<Returned>;

/// A host function stored in the data, called when a reference or section
/// resolves to it.
#[derive(Clone)]
pub struct ContextFn {
    call: Rc<HostFn>,
    /// Set for compiled inline bodies, which sections treat as values rather
    /// than calling them.
    body: bool,
}

impl ContextFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Chunk, &Context, &Bodies, &Params) -> CurlyResult<Returned> + 'static,
    {
        Self {
            call: Rc::new(f),
            body: false,
        }
    }

    pub(crate) fn body<F>(f: F) -> Self
    where
        F: Fn(Chunk, &Context, &Bodies, &Params) -> CurlyResult<Returned> + 'static,
    {
        Self {
            call: Rc::new(f),
            body: true,
        }
    }

    pub const fn is_body(&self) -> bool {
        self.body
    }

    pub fn call(
        &self,
        chunk: Chunk,
        context: &Context,
        bodies: &Bodies,
        params: &Params,
    ) -> CurlyResult<Returned> {
        (self.call)(chunk, context, bodies, params)
    }
}

impl fmt::Debug for ContextFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextFn").field("body", &self.body).finish()
    }
}

impl PartialEq for ContextFn {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.call), Rc::as_ptr(&other.call))
    }
}

/// Template data. Arrays and objects are reference counted so that pushing
/// a value onto a context never copies it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Rc<Vec<Value>>),
    Object(Rc<BTreeMap<String, Value>>),
    Function(ContextFn),
}

impl Value {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Chunk, &Context, &Bodies, &Params) -> CurlyResult<Returned> + 'static,
    {
        Self::Function(ContextFn::new(f))
    }

    /// Whether a section body should render for this value. Empty arrays are
    /// handled separately by sections; everything else follows the usual
    /// truthiness rules, except that zero counts as present.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::String(s) => !s.is_empty(),
            Self::Number(_) | Self::Array(_) | Self::Object(_) | Self::Function(_) => true,
        }
    }

    /// Null, `false`, `""` and `[]` are empty. Numbers, including zero, never
    /// are.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(b) => !b,
            Self::String(s) => s.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::Number(_) | Self::Object(_) | Self::Function(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Null
            | Self::Bool(_)
            | Self::Number(_)
            | Self::Array(_)
            | Self::Object(_)
            | Self::Function(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::Null
            | Self::Bool(_)
            | Self::String(_)
            | Self::Array(_)
            | Self::Object(_)
            | Self::Function(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            Self::Null
            | Self::Bool(_)
            | Self::Number(_)
            | Self::String(_)
            | Self::Object(_)
            | Self::Function(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Object(map) => Some(map),
            Self::Null
            | Self::Bool(_)
            | Self::Number(_)
            | Self::String(_)
            | Self::Array(_)
            | Self::Function(_) => None,
        }
    }

    /// One step of a path: an object member, an array element by decimal
    /// index, or the `length` of an array or string.
    pub fn child(&self, key: &str) -> Option<Self> {
        match self {
            Self::Object(map) => map.get(key).cloned(),
            Self::Array(items) if key == "length" => Some(Self::from(items.len())),
            Self::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            Self::String(s) if key == "length" => Some(Self::from(s.chars().count())),
            Self::Null
            | Self::Bool(_)
            | Self::Number(_)
            | Self::String(_)
            | Self::Function(_) => None,
        }
    }

    /// Numeric value using the loose conversions templates expect: numeric
    /// strings parse, booleans are 0 or 1, null is 0.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::String(s) if s.trim().is_empty() => Some(0.0),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Null => Some(0.0),
            Self::Array(_) | Self::Object(_) | Self::Function(_) => None,
        }
    }

    /// Converts to JSON. Functions have no JSON form: they become `null` in
    /// arrays and are left out of objects.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null | Self::Function(_) => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => items.iter().map(Self::to_json).collect(),
            Self::Object(map) => serde_json::Value::Object(
                map.iter()
                    .filter(|(_, v)| !matches!(v, Self::Function(_)))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Formats a float the way templates print numbers: integral values without
/// a fraction, everything else in the shortest round-trip form.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        if n == 0.0 {
            return "0".to_string();
        }
        return format!("{n:.0}");
    }
    n.to_string()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => write!(f, "{i}"),
                (None, Some(u), _) => write!(f, "{u}"),
                (None, None, Some(x)) => f.write_str(&format_number(x)),
                (None, None, None) => write!(f, "{n}"),
            },
            Self::String(s) => f.write_str(s),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Self::Object(_) => write!(f, "{}", self.to_json()),
            Self::Function(_) => f.write_str("[function]"),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(Rc::new(items.into_iter().map(Self::from).collect()))
            }
            serde_json::Value::Object(map) => Self::Object(Rc::new(
                map.into_iter().map(|(k, v)| (k, Self::from(v))).collect(),
            )),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Number(value.into())
    }
}

/// Non-finite floats have no JSON number form and become `null`.
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<Vec<Self>> for Value {
    fn from(items: Vec<Self>) -> Self {
        Self::Array(Rc::new(items))
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(map: BTreeMap<String, Self>) -> Self {
        Self::Object(Rc::new(map))
    }
}

impl From<ContextFn> for Value {
    fn from(f: ContextFn) -> Self {
        Self::Function(f)
    }
}
