//! Parameter and row values exchanged with the SQL driver.

use serde_json::Value as JsonValue;

/// A single SQL parameter or column value.
///
/// This is the lowest common denominator across dialects; scalar codecs map
/// richer attribute types (dates, json, decimals) onto it.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 text.
    Text(String),
}

impl SqlValue {
    /// Check for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Get the integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Convert into the loosely-typed JSON equivalent.
    pub fn into_json(self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(v) => JsonValue::Bool(v),
            SqlValue::Int(v) => JsonValue::from(v),
            SqlValue::Float(v) => serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SqlValue::Text(v) => JsonValue::String(v),
        }
    }

    /// Convert a JSON scalar into the closest SQL value.
    ///
    /// Used for filter operands, where values arrive untyped; attribute
    /// writes go through the scalar codecs instead.
    pub fn from_json(value: &JsonValue) -> SqlValue {
        match value {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(v) => SqlValue::Bool(*v),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// A row returned by the driver: column name / value pairs in select order.
pub type Row = Vec<(String, SqlValue)>;

/// A decoded entity record: attribute names mapped to JSON values, plus any
/// raw columns (foreign keys, discriminators) that do not back an attribute.
pub type Record = serde_json::Map<String, JsonValue>;

/// Look up a column value in a row by name.
pub fn row_get<'a>(row: &'a Row, column: &str) -> Option<&'a SqlValue> {
    row.iter().find(|(name, _)| name == column).map(|(_, v)| v)
}
