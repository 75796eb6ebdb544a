use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Quality;

/// Dynamically-typed scalar carried by a tag.
///
/// Different protocols legitimately produce different primitive kinds for the
/// same logical tag across device families, so the kind is part of the value,
/// not of the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view; booleans and text have no numeric form.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer view; floats are rounded to the nearest integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(f.round() as i64),
            _ => None,
        }
    }

    /// Boolean view; integers coerce with the usual non-zero rule.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// The last-known reading for one tag as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    /// The normalized engineering value
    pub value: Value,
    /// Time the value was last written
    pub timestamp: DateTime<Utc>,
    /// Quality at the time of the snapshot
    pub quality: Quality,
    /// Device name of the adapter that last wrote it
    pub source: String,
}

impl TagValue {
    pub fn new(value: Value, quality: Quality, source: impl Into<String>) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
            quality,
            source: source.into(),
        }
    }

    /// Age of the value relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }
}
