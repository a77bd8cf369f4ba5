//! Scalar codecs bridging attribute values and driver values.
//!
//! Each scalar type has a codec invoked when projecting rows
//! (`from_db`) and serializing writes (`to_db`). Codecs normalize on the
//! way in, so `from_db(to_db(v))` returns `v` for any canonical non-null
//! value.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::schema::ScalarType;
use crate::value::SqlValue;

/// Per-type value codec.
pub trait ScalarCodec: Send + Sync {
    /// Serialize an attribute value for a write statement.
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error>;

    /// Decode a column value from a result row.
    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error>;

    /// Validate an input value without serializing it.
    fn validate(&self, value: &JsonValue) -> Result<(), Error> {
        self.to_db(value).map(|_| ())
    }
}

/// Look up the codec for a scalar type.
pub fn codec_for(scalar: ScalarType) -> &'static dyn ScalarCodec {
    match scalar {
        ScalarType::Boolean => &BooleanCodec,
        ScalarType::Integer | ScalarType::BigInteger => &IntegerCodec,
        ScalarType::Float | ScalarType::Decimal => &FloatCodec,
        ScalarType::String | ScalarType::Text | ScalarType::Uid | ScalarType::Enumeration => {
            &TextCodec
        }
        ScalarType::Date => &DateCodec,
        ScalarType::Time => &TimeCodec,
        ScalarType::DateTime => &DateTimeCodec,
        ScalarType::Json => &JsonCodec,
    }
}

fn type_error(expected: &str, got: &JsonValue) -> Error {
    Error::Codec(format!("expected {expected}, got `{got}`"))
}

fn column_error(expected: &str, got: &SqlValue) -> Error {
    Error::Codec(format!("expected {expected} column value, got {got:?}"))
}

struct BooleanCodec;

impl ScalarCodec for BooleanCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::Bool(b) => Ok(SqlValue::Bool(*b)),
            other => Err(type_error("a boolean", other)),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Bool(b) => Ok(JsonValue::Bool(*b)),
            // Dialects without a boolean type hand back 0/1.
            SqlValue::Int(i) => Ok(JsonValue::Bool(*i != 0)),
            other => Err(column_error("boolean", other)),
        }
    }
}

struct IntegerCodec;

impl ScalarCodec for IntegerCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::Number(n) => n
                .as_i64()
                .map(SqlValue::Int)
                .ok_or_else(|| type_error("an integer", value)),
            other => Err(type_error("an integer", other)),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Int(i) => Ok(JsonValue::from(*i)),
            other => Err(column_error("integer", other)),
        }
    }
}

struct FloatCodec;

impl ScalarCodec for FloatCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::Number(n) => {
                // Integral inputs stay integral so they round-trip exactly.
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Int(i))
                } else {
                    n.as_f64()
                        .map(SqlValue::Float)
                        .ok_or_else(|| type_error("a number", value))
                }
            }
            other => Err(type_error("a number", other)),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Int(i) => Ok(JsonValue::from(*i)),
            SqlValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| Error::Codec(format!("non-finite float `{f}` in column"))),
            other => Err(column_error("numeric", other)),
        }
    }
}

struct TextCodec;

impl ScalarCodec for TextCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::String(s) => Ok(SqlValue::Text(s.clone())),
            other => Err(type_error("a string", other)),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Text(s) => Ok(JsonValue::String(s.clone())),
            other => Err(column_error("text", other)),
        }
    }
}

struct DateCodec;

impl ScalarCodec for DateCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::String(s) => {
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| Error::Codec(format!("invalid date `{s}`: {e}")))?;
                Ok(SqlValue::Text(date.format("%Y-%m-%d").to_string()))
            }
            other => Err(type_error("a `YYYY-MM-DD` date string", other)),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Text(s) => Ok(JsonValue::String(s.clone())),
            other => Err(column_error("date", other)),
        }
    }
}

struct TimeCodec;

impl ScalarCodec for TimeCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::String(s) => {
                let time = NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .map_err(|e| Error::Codec(format!("invalid time `{s}`: {e}")))?;
                Ok(SqlValue::Text(time.format("%H:%M:%S%.3f").to_string()))
            }
            other => Err(type_error("an `HH:MM:SS` time string", other)),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Text(s) => Ok(JsonValue::String(s.clone())),
            other => Err(column_error("time", other)),
        }
    }
}

struct DateTimeCodec;

impl ScalarCodec for DateTimeCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            JsonValue::String(s) => {
                let dt = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| Error::Codec(format!("invalid datetime `{s}`: {e}")))?;
                let utc = dt.with_timezone(&Utc);
                Ok(SqlValue::Text(
                    utc.to_rfc3339_opts(SecondsFormat::Millis, true),
                ))
            }
            other => Err(type_error("an RFC 3339 datetime string", other)),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Text(s) => Ok(JsonValue::String(s.clone())),
            other => Err(column_error("datetime", other)),
        }
    }
}

struct JsonCodec;

impl ScalarCodec for JsonCodec {
    fn to_db(&self, value: &JsonValue) -> Result<SqlValue, Error> {
        match value {
            JsonValue::Null => Ok(SqlValue::Null),
            other => Ok(SqlValue::Text(other.to_string())),
        }
    }

    fn from_db(&self, value: &SqlValue) -> Result<JsonValue, Error> {
        match value {
            SqlValue::Null => Ok(JsonValue::Null),
            SqlValue::Text(s) => serde_json::from_str(s)
                .map_err(|e| Error::Codec(format!("invalid json document in column: {e}"))),
            other => Err(column_error("json", other)),
        }
    }
}
