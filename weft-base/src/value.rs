//! The canonical value domain and its deterministic rendering.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A canonical literal value.
///
/// The domain is deliberately small: booleans, finite numbers, strings,
/// ordered arrays, and objects with lexicographically sorted keys. There is
/// no null. Object keys are kept in a [`BTreeMap`], so the sort order is a
/// property of the type rather than an invariant callers must uphold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A finite floating point number.
    Number(f64),
    /// A UTF-8 string.
    String(String),
    /// An ordered array.
    Array(Vec<Value>),
    /// An object with sorted keys.
    Object(BTreeMap<String, Value>),
}

/// A value that cannot be canonically rendered.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    /// Numbers in the canonical domain must be finite.
    #[error("non-finite number in canonical value")]
    NonFiniteNumber,
}

impl Value {
    /// Create an object value from an iterator of entries.
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// The string content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The entry map, if this is an object value.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// The elements, if this is an array value.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

/// Render a value into its canonical textual form.
///
/// The rendering is byte-stable: equal values produce equal strings on every
/// platform and in every release. Strings use JSON escapes, arrays preserve
/// order, object keys come out in ascending lexicographic order, and numbers
/// with no fractional part within the safe integer range are rendered without
/// a fraction.
pub fn canonical_string(value: &Value) -> Result<String, ValueError> {
    let mut out = String::new();
    render(value, &mut out)?;
    Ok(out)
}

const MAX_SAFE_INTEGER: f64 = 9007199254740991.0;

fn render(value: &Value, out: &mut String) -> Result<(), ValueError> {
    match value {
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if !n.is_finite() {
                return Err(ValueError::NonFiniteNumber);
            }
            if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                fmt::Write::write_fmt(out, format_args!("{}", *n as i64)).expect("infallible");
            } else {
                fmt::Write::write_fmt(out, format_args!("{n}")).expect("infallible");
            }
        }
        Value::String(s) => render_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_string(key, out);
                out.push(':');
                render(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn render_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                fmt::Write::write_fmt(out, format_args!("\\u{:04x}", c as u32))
                    .expect("infallible");
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
