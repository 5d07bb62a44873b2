use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Value;

/// One flat result row as fetched from a cursor.
pub type Row = Vec<Value>;

/// Declared storage type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Integer,
    Float,
    /// Stored as an epoch-seconds float column.
    Date,
    /// Stored as a serialized JSON blob in a text column.
    Metadata,
}

impl DataType {
    /// Column type emitted by the DDL generator.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Metadata => "TEXT",
            Self::Integer => "INTEGER",
            Self::Float | Self::Date => "DOUBLE PRECISION",
        }
    }

    pub fn is_compatible(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Text, Value::Text(_)) => true,
            (Self::Integer, Value::Integer(_)) => true,
            (Self::Float, Value::Float(_) | Value::Integer(_)) => true,
            (Self::Date, Value::Date(_) | Value::Float(_) | Value::Integer(_)) => true,
            (Self::Metadata, Value::Metadata(_) | Value::Text(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Date => "date",
            Self::Metadata => "metadata",
        };
        write!(f, "{name}")
    }
}
