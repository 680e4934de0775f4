//! Typed attribute values.
//!
//! The DOT parser, the context store, and the checkpoint codec all share this
//! representation. Durations serialize as suffixed millisecond strings
//! (`"1500ms"`) so checkpoints stay readable.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    #[serde(with = "duration_serde")]
    Duration(Duration),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(s == "true"),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Value::Duration(d) => Some(*d),
            _ => None,
        }
    }
}

/// Stringification used by condition evaluation and variable expansion.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Duration(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Parse a suffixed duration literal: `250ms`, `900s`, `5m`, `2h`, `1d`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    // `ms` must be checked before the bare `m`/`s` suffixes.
    if let Some(n) = s.strip_suffix("ms").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_millis(n));
    }
    if let Some(n) = s.strip_suffix('s').and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(n));
    }
    if let Some(n) = s.strip_suffix('m').and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(n * 60));
    }
    if let Some(n) = s.strip_suffix('h').and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(n * 3600));
    }
    if let Some(n) = s.strip_suffix('d').and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(n * 86400));
    }
    None
}

pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s}")))
    }
}
