//! Database rows and cursors.

use crate::Result;
use crate::error::{DriverResult, Error, TypeError};
use crate::value::{UNIX_EPOCH_DAYS_FROM_CE, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
///
/// This struct is wrapped in `Arc` so all rows from the same query share
/// the same column information.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    name_to_index: HashMap<String, usize>,
    /// Lowercased name -> index; the first column wins on a collision
    folded_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let mut folded_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            folded_to_index.entry(name.to_lowercase()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
            folded_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by exact name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get the index of a column, ignoring ASCII and Unicode case.
    ///
    /// An exact match is preferred over a case-folded one.
    pub fn index_of_ignore_case(&self, name: &str) -> Option<usize> {
        self.index_of(name)
            .or_else(|| self.folded_to_index.get(&name.to_lowercase()).copied())
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a database query.
#[derive(Debug, Clone)]
pub struct Row {
    /// Column values in order
    values: Vec<Value>,
    /// Shared column metadata
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    ///
    /// For multiple rows from the same result set, prefer `with_columns`
    /// to share the column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the shared column metadata.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by exact column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a value by column name, ignoring case.
    pub fn get_by_name_ignore_case(&self, name: &str) -> Option<&Value> {
        self.columns
            .index_of_ignore_case(name)
            .and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column name.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// Get all column names.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// A forward-only sequence of rows produced by a driver.
///
/// Finite and single-pass: once consumed it cannot be restarted, and reading
/// the rows again requires issuing the query again. Each item is either a row
/// or the driver failure raised while advancing.
pub struct RowCursor<'c> {
    inner: Box<dyn Iterator<Item = DriverResult<Row>> + 'c>,
}

impl<'c> RowCursor<'c> {
    /// Wrap a driver's row iterator.
    pub fn new(rows: impl Iterator<Item = DriverResult<Row>> + 'c) -> Self {
        Self {
            inner: Box::new(rows),
        }
    }

    /// A cursor over rows already held in memory.
    pub fn from_rows(rows: Vec<Row>) -> RowCursor<'static> {
        RowCursor::new(rows.into_iter().map(Ok))
    }

    pub fn empty() -> RowCursor<'static> {
        RowCursor::new(std::iter::empty())
    }
}

impl Iterator for RowCursor<'_> {
    type Item = DriverResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl fmt::Debug for RowCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCursor").finish_non_exhaustive()
    }
}

/// Trait for converting from a `Value` to a typed value.
pub trait FromValue: Sized {
    /// Convert from a Value, returning an error if the conversion fails.
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

fn out_of_range(expected: &'static str, v: i64) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("value {} out of range", v),
        column: None,
    })
}

fn unparseable(expected: &'static str, err: &dyn fmt::Display) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("unparseable text: {}", err),
        column: None,
    })
}

/// Integer variants only; booleans do not count here.
fn integer(value: &Value) -> Option<i64> {
    if value.is_integer() { value.as_i64() } else { None }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

impl FromValue for i16 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| mismatch("i16", value))?;
        i16::try_from(v).map_err(|_| out_of_range("i16", v))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| mismatch("i32", value))?;
        i32::try_from(v).map_err(|_| out_of_range("i32", v))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Date(v) => Ok(i64::from(*v)),
            Value::Time(v) | Value::Timestamp(v) => Ok(*v),
            _ => value.as_i64().ok_or_else(|| mismatch("i64", value)),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            _ => value
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| mismatch("f32", value)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s.clone()),
            // numeric storage of a decimal column
            Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                Ok(integer(value).unwrap_or_default().to_string())
            }
            Value::Float(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(v.to_string()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(mismatch("Vec<u8>", value)),
        }
    }
}

impl FromValue for [u8; 16] {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_uuid().ok_or_else(|| mismatch("[u8; 16]", value))
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_uuid()
            .map(uuid::Uuid::from_bytes)
            .ok_or_else(|| mismatch("Uuid", value))
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(s) => serde_json::from_str(s).map_err(|e| {
                Error::Type(TypeError {
                    expected: "JSON document",
                    actual: format!("unparseable text: {}", e),
                    column: None,
                })
            }),
            _ => Err(mismatch("JSON", value)),
        }
    }
}

/// Days since 1970-01-01, or `YYYY-MM-DD` text.
impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self> {
        let days = match value {
            Value::Date(d) => i64::from(*d),
            Value::Text(s) => return s.parse().map_err(|e| unparseable("NaiveDate", &e)),
            _ => integer(value).ok_or_else(|| mismatch("NaiveDate", value))?,
        };
        i32::try_from(days)
            .ok()
            .and_then(|d| d.checked_add(UNIX_EPOCH_DAYS_FROM_CE))
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .ok_or_else(|| out_of_range("NaiveDate", days))
    }
}

/// Microseconds since midnight, or `HH:MM:SS[.f]` text.
impl FromValue for NaiveTime {
    fn from_value(value: &Value) -> Result<Self> {
        let micros = match value {
            Value::Time(v) => *v,
            Value::Text(s) => return s.parse().map_err(|e| unparseable("NaiveTime", &e)),
            _ => integer(value).ok_or_else(|| mismatch("NaiveTime", value))?,
        };
        let secs = u32::try_from(micros.div_euclid(1_000_000)).ok();
        let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok();
        secs.zip(nanos)
            .and_then(|(s, n)| NaiveTime::from_num_seconds_from_midnight_opt(s, n))
            .ok_or_else(|| out_of_range("NaiveTime", micros))
    }
}

fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").map(|dt| dt.and_utc()))
        .or_else(|_| text.parse::<NaiveDateTime>().map(|dt| dt.and_utc()))
}

fn timestamp(expected: &'static str, value: &Value) -> Result<DateTime<Utc>> {
    let micros = match value {
        Value::Timestamp(v) => *v,
        Value::Text(s) => return parse_timestamp(s).map_err(|e| unparseable(expected, &e)),
        _ => integer(value).ok_or_else(|| mismatch(expected, value))?,
    };
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| out_of_range(expected, micros))
}

/// Microseconds since the Unix epoch, or RFC 3339 / `YYYY-MM-DD HH:MM:SS` text.
impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        timestamp("DateTime<Utc>", value)
    }
}

/// Read as UTC; text with an offset is converted to UTC first.
impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        timestamp("NaiveDateTime", value).map(|dt| dt.naive_utc())
    }
}

impl FromValue for Decimal {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Decimal(s) | Value::Text(s) => Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .map_err(|e| unparseable("Decimal", &e)),
            Value::Float(v) => Decimal::from_f32(*v).ok_or_else(|| mismatch("Decimal", value)),
            Value::Double(v) => Decimal::from_f64(*v).ok_or_else(|| mismatch("Decimal", value)),
            _ => integer(value)
                .map(Decimal::from)
                .ok_or_else(|| mismatch("Decimal", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
