use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A scalar field value.
///
/// The serde representation is the tagged form used for storage encoding. Use
/// [`Value::to_json`] for the plain representation handed back to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Timestamp(DateTime<Utc>),
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
}

impl Value {
    /// Converts a scalar JSON value. Arrays, objects and null have no `Value` form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Integer(i)),
                None => n.as_f64().map(Value::Float),
            },
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, false))
            }
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// The textual form used when comparing against request parameters.
    pub fn as_param_string(&self) -> String {
        match self {
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, false),
            Value::Integer(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Boolean(b) => b.to_string(),
        }
    }

    /// Equality used by filters. Request parameters arrive as strings, so a string on the
    /// expected side also matches a stored value of another kind with the same textual form.
    pub fn matches(&self, expected: &Value) -> bool {
        if self == expected {
            return true;
        }
        match (self, expected) {
            (Value::String(_), _) => false,
            (stored, Value::String(param)) => stored.as_param_string() == *param,
            _ => false,
        }
    }

    /// Ordering between values of the same kind. Integers and floats compare with each other;
    /// any other mix of kinds has no ordering.
    pub fn compare_same_kind(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Timestamp(l), Value::Timestamp(r)) => Some(l.cmp(r)),
            (Value::Integer(l), Value::Integer(r)) => Some(l.cmp(r)),
            (Value::Float(l), Value::Float(r)) => l.partial_cmp(r),
            (Value::Integer(l), Value::Float(r)) => (*l as f64).partial_cmp(r),
            (Value::Float(l), Value::Integer(r)) => l.partial_cmp(&(*r as f64)),
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            (Value::Boolean(l), Value::Boolean(r)) => Some(l.cmp(r)),
            _ => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Integer(_) | Value::Float(_) => 1,
            Value::String(_) => 2,
            Value::Timestamp(_) => 3,
        }
    }
}

// Total order: kind rank first, then the natural order within the kind. Numbers compare
// numerically across integer/float, with integers first on a tie so the order stays total.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.kind_rank().cmp(&other.kind_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Float(l), Value::Float(r)) => l.total_cmp(r),
            (Value::Integer(l), Value::Float(r)) => {
                (*l as f64).total_cmp(r).then(Ordering::Less)
            }
            (Value::Float(l), Value::Integer(r)) => {
                l.total_cmp(&(*r as f64)).then(Ordering::Greater)
            }
            _ => self.compare_same_kind(other).unwrap_or(Ordering::Equal),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}
