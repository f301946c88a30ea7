use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

/// A single property value attached to an entity or relationship.
///
/// Property bags are dynamically shaped, so values carry an explicit kind
/// tag. The tag is part of the serialized form, which is what makes snapshot
/// payloads round-trip losslessly: a boolean never comes back as an integer,
/// a date never comes back as a plain string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    StringList(Vec<String>),
    Null,
}

/// A property bag keyed by property name.
pub type PropertyMap = HashMap<String, PropertyValue>;

/// A materialized result row keyed by column name.
pub type Row = HashMap<String, PropertyValue>;

impl PropertyValue {
    /// Build a value from a raw column reference.
    ///
    /// Blobs are lossily decoded as text; the schema never stores blobs.
    pub(crate) fn from_sql_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Int(i),
            ValueRef::Real(f) => Self::Float(f),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Self::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }

    /// The textual content, if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The integer content, if this is an `Int` value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// True when the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl rusqlite::types::ToSql for PropertyValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Self::Text(s) => Value::Text(s.clone()),
            Self::Int(i) => Value::Integer(*i),
            Self::Float(f) => Value::Real(*f),
            Self::Bool(b) => Value::Integer(i64::from(*b)),
            Self::Date(d) => Value::Text(d.to_rfc3339()),
            Self::StringList(xs) => {
                Value::Text(serde_json::to_string(xs).unwrap_or_else(|_| "[]".to_string()))
            }
            Self::Null => Value::Null,
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// Serialize a property bag for storage in a `properties` column.
pub fn properties_to_json(properties: &PropertyMap) -> serde_json::Result<String> {
    serde_json::to_string(properties)
}

/// Parse a `properties` column back into a property bag.
///
/// A malformed bag yields an empty map rather than failing the whole read,
/// matching how reads treat metadata elsewhere in the store.
pub fn properties_from_json(json: &str) -> PropertyMap {
    serde_json::from_str(json).unwrap_or_default()
}
