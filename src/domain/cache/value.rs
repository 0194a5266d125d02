//! Cache values and type-preserving concatenation

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::CacheError;

static LEADING_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[+-]?\d+").unwrap());

static LEADING_FLOAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?").unwrap());

/// A value held by the mirror or a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Opaque bytes
    Blob(Vec<u8>),
    /// Structured, object-like record
    Record(serde_json::Value),
}

/// Type tag stored next to the raw bytes of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    String,
    Int,
    Float,
    Bool,
    Blob,
    Record,
}

/// Side on which `combine` attaches the operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Append,
    Prepend,
}

impl ValueTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueTag::String => "s",
            ValueTag::Int => "i",
            ValueTag::Float => "f",
            ValueTag::Bool => "b",
            ValueTag::Blob => "x",
            ValueTag::Record => "r",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "s" => Some(ValueTag::String),
            "i" => Some(ValueTag::Int),
            "f" => Some(ValueTag::Float),
            "b" => Some(ValueTag::Bool),
            "x" => Some(ValueTag::Blob),
            "r" => Some(ValueTag::Record),
            _ => None,
        }
    }

    /// Rebuilds a value of this type from its raw form.
    ///
    /// Numeric tags read the leading numeric part of the text and fall back
    /// to zero; a record that no longer parses degrades to a string.
    pub fn decode(&self, raw: &[u8]) -> CacheValue {
        match self {
            ValueTag::Blob => CacheValue::Blob(raw.to_vec()),
            ValueTag::Record => match serde_json::from_slice(raw) {
                Ok(record) => CacheValue::Record(record),
                Err(_) => CacheValue::String(String::from_utf8_lossy(raw).into_owned()),
            },
            _ => self.cast(&String::from_utf8_lossy(raw)),
        }
    }

    fn cast(&self, text: &str) -> CacheValue {
        match self {
            ValueTag::String => CacheValue::String(text.to_string()),
            ValueTag::Int => CacheValue::Int(leading_int(text)),
            ValueTag::Float => CacheValue::Float(leading_float(text)),
            ValueTag::Bool => CacheValue::Bool(!(text.is_empty() || text == "0")),
            ValueTag::Blob => CacheValue::Blob(text.as_bytes().to_vec()),
            ValueTag::Record => match serde_json::from_str(text) {
                Ok(record) => CacheValue::Record(record),
                Err(_) => CacheValue::String(text.to_string()),
            },
        }
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CacheValue {
    pub fn tag(&self) -> ValueTag {
        match self {
            CacheValue::String(_) => ValueTag::String,
            CacheValue::Int(_) => ValueTag::Int,
            CacheValue::Float(_) => ValueTag::Float,
            CacheValue::Bool(_) => ValueTag::Bool,
            CacheValue::Blob(_) => ValueTag::Blob,
            CacheValue::Record(_) => ValueTag::Record,
        }
    }

    /// Raw byte form, as a backend stores it
    pub fn to_raw(&self) -> Vec<u8> {
        match self {
            CacheValue::Blob(bytes) => bytes.clone(),
            CacheValue::Record(record) => record.to_string().into_bytes(),
            other => other.text().into_bytes(),
        }
    }

    /// Whether the value may be appended or prepended to another one
    pub fn is_scalar_operand(&self) -> bool {
        matches!(
            self,
            CacheValue::String(_) | CacheValue::Int(_) | CacheValue::Float(_)
        )
    }

    /// Integer reading used by counters. Non-numeric values yield `None`.
    pub fn numeric_value(&self) -> Option<i64> {
        match self {
            CacheValue::Int(value) => Some(*value),
            CacheValue::Float(value) => Some(*value as i64),
            CacheValue::String(text) => {
                let trimmed = text.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
            }
            _ => None,
        }
    }

    fn text(&self) -> String {
        match self {
            CacheValue::String(text) => text.clone(),
            CacheValue::Int(value) => value.to_string(),
            CacheValue::Float(value) => value.to_string(),
            CacheValue::Bool(true) => "1".to_string(),
            CacheValue::Bool(false) => String::new(),
            CacheValue::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            CacheValue::Record(record) => record.to_string(),
        }
    }
}

impl fmt::Display for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Bool(value) => write!(f, "{}", value),
            CacheValue::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
            other => f.write_str(&other.text()),
        }
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::String(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::String(value)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Int(value)
    }
}

impl From<i32> for CacheValue {
    fn from(value: i32) -> Self {
        CacheValue::Int(i64::from(value))
    }
}

impl From<f64> for CacheValue {
    fn from(value: f64) -> Self {
        CacheValue::Float(value)
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        CacheValue::Bool(value)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        CacheValue::Blob(value)
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Record(value)
    }
}

/// Concatenates `operand` onto `original` and casts the result back to the
/// type of `original`.
pub fn combine(
    original: &CacheValue,
    operand: &CacheValue,
    direction: Direction,
) -> Result<CacheValue, CacheError> {
    if !operand.is_scalar_operand() {
        return Err(CacheError::rejected(format!(
            "cannot concatenate a '{}' value",
            operand.tag()
        )));
    }

    match original {
        CacheValue::Record(_) => Err(CacheError::rejected(
            "cannot concatenate onto a structured record",
        )),
        CacheValue::Blob(bytes) => {
            let extra = operand.to_raw();
            let combined = match direction {
                Direction::Append => [bytes.as_slice(), extra.as_slice()].concat(),
                Direction::Prepend => [extra.as_slice(), bytes.as_slice()].concat(),
            };
            Ok(CacheValue::Blob(combined))
        }
        _ => {
            let (head, tail) = match direction {
                Direction::Append => (original.text(), operand.text()),
                Direction::Prepend => (operand.text(), original.text()),
            };
            Ok(original.tag().cast(&format!("{}{}", head, tail)))
        }
    }
}

fn leading_int(text: &str) -> i64 {
    match LEADING_INT.find(text) {
        Some(m) => {
            let digits = m.as_str().trim();
            digits.parse::<i64>().unwrap_or(if digits.starts_with('-') {
                i64::MIN
            } else {
                i64::MAX
            })
        }
        None => 0,
    }
}

fn leading_float(text: &str) -> f64 {
    LEADING_FLOAT
        .find(text)
        .and_then(|m| m.as_str().trim().parse::<f64>().ok())
        .unwrap_or(0.0)
}
