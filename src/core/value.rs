use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

use crate::core::{DataType, OrmError, Result};

/// A single column value as it crosses the connection boundary.
///
/// Date fields travel as epoch-seconds floats and metadata fields as
/// serialized JSON blobs; `coerce` converts raw driver output into the
/// declared shape.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Date(f64),
    Metadata(serde_json::Value),
}

impl Value {
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            // NULL sorts after everything (NULL LAST)
            (Value::Null, Value::Null) => Ok(Ordering::Equal),
            (Value::Null, _) => Ok(Ordering::Greater),
            (_, Value::Null) => Ok(Ordering::Less),

            (Value::Integer(a), Value::Integer(b)) => Ok(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),

            (Value::Float(a), Value::Float(b)) | (Value::Date(a), Value::Date(b)) => {
                Ok(float_cmp(*a, *b))
            }

            // Mixed numeric types (implicit coercion)
            (Value::Integer(a), Value::Float(b)) => Ok(float_cmp(*a as f64, *b)),
            (Value::Float(a), Value::Integer(b)) => Ok(float_cmp(*a, *b as f64)),

            _ => Err(OrmError::Validation(format!(
                "Cannot compare incompatible types: {} and {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Date(_) => "DATE",
            Self::Metadata(_) => "METADATA",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) | Self::Date(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a raw driver value into the field's declared data type.
    ///
    /// Drivers are free to hand back integers for float columns, floats or
    /// RFC 3339 text for date columns, and serialized text for metadata
    /// columns; everything else is a validation error.
    pub fn coerce(self, data_type: DataType) -> Result<Value> {
        match (data_type, self) {
            (_, Value::Null) => Ok(Value::Null),

            (DataType::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (DataType::Integer, Value::Integer(i)) => Ok(Value::Integer(i)),
            (DataType::Integer, Value::Float(f)) if f.fract() == 0.0 => {
                Ok(Value::Integer(f as i64))
            }
            (DataType::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (DataType::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),

            (DataType::Date, Value::Date(f)) => Ok(Value::Date(f)),
            (DataType::Date, Value::Float(f)) => Ok(Value::Date(f)),
            (DataType::Date, Value::Integer(i)) => Ok(Value::Date(i as f64)),
            (DataType::Date, Value::Text(s)) => {
                let parsed: DateTime<Utc> = s.parse().map_err(|_| {
                    OrmError::Validation(format!("Invalid date literal '{s}'"))
                })?;
                Ok(Value::Date(parsed.timestamp() as f64))
            }

            (DataType::Metadata, Value::Metadata(v)) => Ok(Value::Metadata(v)),
            (DataType::Metadata, Value::Text(s)) => {
                Ok(Value::Metadata(serde_json::from_str(&s)?))
            }

            (expected, got) => Err(OrmError::Validation(format!(
                "Expected value of type {}, got {}",
                expected,
                got.type_name()
            ))),
        }
    }

    /// Format the value as a SQL literal.
    ///
    /// Single quotes are doubled; engines that also need backslash escaping
    /// opt in through their dialect.
    pub fn sql_literal(&self, escape_slash: bool) -> Result<String> {
        match self {
            Self::Null => Ok("NULL".to_string()),
            Self::Integer(i) => Ok(i.to_string()),
            Self::Float(f) => Ok(format_float(*f)),
            Self::Date(f) => Ok(format_float(*f)),
            Self::Text(s) => Ok(quote_text(s, escape_slash)),
            Self::Metadata(v) => {
                let serialized = serde_json::to_string(v)?;
                Ok(quote_text(&serialized, escape_slash))
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Value> {
        match value {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Integer(i64::from(*b))),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(OrmError::Validation(format!("Unrepresentable number {n}")))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Object(_) => Ok(Value::Metadata(value.clone())),
            serde_json::Value::Array(_) => Err(OrmError::Validation(
                "A bare array is not a scalar value".to_string(),
            )),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(i) => serde_json::json!(i),
            Self::Float(f) | Self::Date(f) => serde_json::json!(f),
            Self::Text(s) => serde_json::json!(s),
            Self::Metadata(v) => v.clone(),
        }
    }
}

fn float_cmp(a: f64, b: f64) -> Ordering {
    // NaN sorts after all other floats
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

fn quote_text(s: &str, escape_slash: bool) -> String {
    let mut escaped = s.replace('\'', "''");
    if escape_slash {
        escaped = escaped.replace('\\', "\\\\");
    }
    format!("'{escaped}'")
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Metadata(a), Self::Metadata(b)) => a == b,
            (Self::Float(a), Self::Float(b)) | (Self::Date(a), Self::Date(b)) => {
                (a.is_nan() && b.is_nan()) || a == b
            }
            (Self::Integer(i), Self::Float(f)) | (Self::Float(f), Self::Integer(i)) => {
                *f == *i as f64
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) | Self::Date(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Metadata(v) => write!(f, "{v}"),
        }
    }
}

/// `Value` wrapper with total equality and hashing, usable as an
/// identity-map key. Floats hash by bit pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueKey(pub Value);

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Null => 0u8.hash(state),
            Value::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) | Value::Date(f) => {
                // Integer-valued floats must collide with the equal integer
                if f.fract() == 0.0 && f.is_finite() {
                    1u8.hash(state);
                    (*f as i64).hash(state);
                } else {
                    2u8.hash(state);
                    f.to_bits().hash(state);
                }
            }
            Value::Text(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Metadata(v) => {
                4u8.hash(state);
                v.to_string().hash(state);
            }
        }
    }
}
