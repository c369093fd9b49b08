//! Dynamically typed values exchanged with the wire driver
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Sql NULL
    Null,
    /// Boolean, stored by mysql as TINYINT(1)
    Bool(bool),
    /// Signed integer of any width
    Int(i64),
    /// Unsigned integer of any width
    UInt(u64),
    /// Floating point of any width
    Double(f64),
    /// Text, enum, set, json and decimal payloads
    Text(String),
    /// Binary payloads
    Bytes(Bytes),
    /// DATE
    Date(NaiveDate),
    /// TIME
    Time(NaiveTime),
    /// DATETIME and TIMESTAMP
    DateTime(NaiveDateTime),
}

impl Value {
    /// True for sql NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Return the value as a signed integer if it is one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Return the value as an unsigned integer if it is one
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Bool(v) => Some(*v as u64),
            _ => None,
        }
    }

    /// Return the value as a float if it is numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Return the value as a string slice if it is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Return the value as a byte slice if it is binary
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Return the value as a bool if it is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v.into())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// A statement parameter
///
/// Sql placeholders are positional `?`; a named parameter is a labeling
/// convenience and is flattened to its value in positional order before
/// the statement reaches the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// A raw positional value
    Value(Value),
    /// A labeled value, flattened positionally
    Named {
        /// The label, not interpreted by this layer
        name: String,
        /// The value passed to the driver
        value: Value,
    },
}

impl Param {
    /// Construct a named parameter
    pub fn named(name: impl Into<String>, value: impl Into<Value>) -> Param {
        Param::Named {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The value carried by this parameter
    pub fn value(&self) -> &Value {
        match self {
            Param::Value(v) => v,
            Param::Named { value, .. } => value,
        }
    }
}

impl<T: Into<Value>> From<T> for Param {
    fn from(v: T) -> Self {
        Param::Value(v.into())
    }
}

/// Flatten a parameter list to the positional values the driver takes
pub(crate) fn flatten(params: &[Param]) -> Vec<Value> {
    params.iter().map(|p| p.value().clone()).collect()
}
