//! SQL type affinities and the Rust types that map onto them.

use crate::value::Value;

/// SQL type affinity of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    // Integer types
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision, carried as text
    Decimal,

    Boolean,
    Text,
    Blob,

    // Date/time types
    Date,
    Time,
    Timestamp,

    Uuid,
    Json,

    /// Composite or enumerated type declared by name.
    ///
    /// There are no conversion rules for these; the registry rejects any
    /// mapping that uses one.
    Custom(&'static str),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Decimal => "DECIMAL",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Uuid => "UUID",
            SqlType::Json => "JSON",
            SqlType::Custom(name) => name,
        }
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(self, SqlType::SmallInt | SqlType::Integer | SqlType::BigInt)
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Real
                | SqlType::Double
                | SqlType::Decimal
        )
    }

    /// Check if this type is text-based.
    pub const fn is_text(&self) -> bool {
        matches!(self, SqlType::Text)
    }

    /// Check if this type is a date/time type.
    pub const fn is_temporal(&self) -> bool {
        matches!(self, SqlType::Date | SqlType::Time | SqlType::Timestamp)
    }

    /// Does this affinity have conversion rules?
    pub const fn is_supported(&self) -> bool {
        !matches!(self, SqlType::Custom(_))
    }

    /// Check whether a raw (non-NULL) value is convertible to this affinity.
    ///
    /// Drivers with a narrow storage model report integers for booleans,
    /// integers or text for temporal values, and blobs or text for UUIDs, so
    /// those are accepted.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => value.is_integer(),
            SqlType::Real | SqlType::Double => {
                matches!(value, Value::Float(_) | Value::Double(_)) || value.is_integer()
            }
            SqlType::Decimal => value.as_f64().is_some() || value.as_str().is_some(),
            SqlType::Boolean => value.as_bool().is_some(),
            SqlType::Text => matches!(value, Value::Text(_)),
            SqlType::Blob => matches!(value, Value::Bytes(_)),
            SqlType::Date => matches!(value, Value::Date(_) | Value::Text(_)) || value.is_integer(),
            SqlType::Time => matches!(value, Value::Time(_) | Value::Text(_)) || value.is_integer(),
            SqlType::Timestamp => {
                matches!(value, Value::Timestamp(_) | Value::Text(_)) || value.is_integer()
            }
            SqlType::Uuid => value.as_uuid().is_some(),
            SqlType::Json => matches!(value, Value::Json(_) | Value::Text(_)),
            SqlType::Custom(_) => false,
        }
    }
}

/// Trait for types that have a corresponding SQL type.
pub trait TypeInfo {
    /// The SQL type for this Rust type.
    const SQL_TYPE: SqlType;

    /// Whether this type is nullable by default.
    const NULLABLE: bool = false;
}

impl TypeInfo for i16 {
    const SQL_TYPE: SqlType = SqlType::SmallInt;
}

impl TypeInfo for i32 {
    const SQL_TYPE: SqlType = SqlType::Integer;
}

impl TypeInfo for i64 {
    const SQL_TYPE: SqlType = SqlType::BigInt;
}

impl TypeInfo for f32 {
    const SQL_TYPE: SqlType = SqlType::Real;
}

impl TypeInfo for f64 {
    const SQL_TYPE: SqlType = SqlType::Double;
}

impl TypeInfo for bool {
    const SQL_TYPE: SqlType = SqlType::Boolean;
}

impl TypeInfo for String {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl TypeInfo for Vec<u8> {
    const SQL_TYPE: SqlType = SqlType::Blob;
}

impl TypeInfo for uuid::Uuid {
    const SQL_TYPE: SqlType = SqlType::Uuid;
}

impl TypeInfo for serde_json::Value {
    const SQL_TYPE: SqlType = SqlType::Json;
}

impl TypeInfo for chrono::NaiveDate {
    const SQL_TYPE: SqlType = SqlType::Date;
}

impl TypeInfo for chrono::NaiveTime {
    const SQL_TYPE: SqlType = SqlType::Time;
}

impl TypeInfo for chrono::NaiveDateTime {
    const SQL_TYPE: SqlType = SqlType::Timestamp;
}

impl TypeInfo for chrono::DateTime<chrono::Utc> {
    const SQL_TYPE: SqlType = SqlType::Timestamp;
}

impl TypeInfo for rust_decimal::Decimal {
    const SQL_TYPE: SqlType = SqlType::Decimal;
}

impl<T: TypeInfo> TypeInfo for Option<T> {
    const SQL_TYPE: SqlType = T::SQL_TYPE;
    const NULLABLE: bool = true;
}
