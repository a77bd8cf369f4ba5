//! Scalar type definitions.

use serde::{Deserialize, Serialize};

/// Scalar attribute types supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScalarType {
    /// Short UTF-8 string.
    String,
    /// Long-form UTF-8 text.
    Text,
    /// 32/64-bit signed integer.
    Integer,
    /// 64-bit signed integer, kept apart for dialects with narrow INT columns.
    BigInteger,
    /// 64-bit floating point.
    Float,
    /// Fixed-precision decimal.
    Decimal,
    /// Boolean value.
    Boolean,
    /// Calendar date (`YYYY-MM-DD`).
    Date,
    /// Wall-clock time (`HH:MM:SS.fff`).
    Time,
    /// RFC 3339 timestamp, normalized to UTC.
    DateTime,
    /// Arbitrary JSON document.
    Json,
    /// URL-safe unique string identifier.
    Uid,
    /// String drawn from a fixed set of variants.
    Enumeration,
}

impl ScalarType {
    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarType::Integer | ScalarType::BigInteger | ScalarType::Float | ScalarType::Decimal
        )
    }

    /// Check if this type is stored as text.
    pub fn is_string_like(&self) -> bool {
        matches!(
            self,
            ScalarType::String
                | ScalarType::Text
                | ScalarType::Uid
                | ScalarType::Enumeration
                | ScalarType::Date
                | ScalarType::Time
                | ScalarType::DateTime
                | ScalarType::Json
        )
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

impl OrderDirection {
    /// SQL keyword for this direction.
    pub fn sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_type_checks() {
        assert!(ScalarType::Integer.is_numeric());
        assert!(ScalarType::Decimal.is_numeric());
        assert!(!ScalarType::Boolean.is_numeric());

        assert!(ScalarType::Text.is_string_like());
        assert!(ScalarType::DateTime.is_string_like());
        assert!(!ScalarType::Integer.is_string_like());
    }
}
