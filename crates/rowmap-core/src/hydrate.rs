//! Result mapping: rows into entity instances.
//!
//! Each row is first resolved against the entity mapping into a [`Record`]:
//! one value per mapped field, found by case-insensitive column lookup and
//! checked against the field's affinity. [`Entity::from_record`] then converts
//! the record's values into the entity's Rust field types.

use crate::Result;
use crate::entity::Entity;
use crate::error::{Error, HydrationError};
use crate::registry::{ColumnMapping, EntityMapping};
use crate::row::{FromValue, Row, RowCursor};
use crate::value::Value;
use std::marker::PhantomData;
use std::sync::Arc;

/// One row's values, resolved against an entity mapping.
///
/// Values are held in column declaration order. A nullable field whose
/// column is absent from the row holds an explicit `Value::Null`.
#[derive(Debug, Clone)]
pub struct Record<'m> {
    mapping: &'m EntityMapping,
    values: Vec<Value>,
}

impl<'m> Record<'m> {
    /// Resolve a row against a mapping.
    pub fn from_row(mapping: &'m EntityMapping, row: &Row) -> Result<Self> {
        let values = mapping
            .columns()
            .iter()
            .map(|column| {
                let value = row
                    .get_by_name_ignore_case(column.column)
                    .cloned()
                    .unwrap_or(Value::Null);
                check_value(mapping, column, &value)?;
                Ok(value)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { mapping, values })
    }

    /// Build a record from values already in declaration order.
    pub fn from_values(mapping: &'m EntityMapping, values: Vec<Value>) -> Result<Self> {
        if values.len() != mapping.columns().len() {
            return Err(Error::Hydration(HydrationError {
                entity: mapping.entity_name(),
                field: "*",
                column: "*",
                message: format!(
                    "expected {} values, got {}",
                    mapping.columns().len(),
                    values.len()
                ),
            }));
        }
        for (column, value) in mapping.columns().iter().zip(&values) {
            check_value(mapping, column, value)?;
        }
        Ok(Self { mapping, values })
    }

    pub fn mapping(&self) -> &EntityMapping {
        self.mapping
    }

    /// Raw value of a field, by field name.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.mapping
            .columns()
            .iter()
            .position(|c| c.field == field)
            .map(|i| &self.values[i])
    }

    /// Convert a field's value to its Rust type.
    pub fn get<T: FromValue>(&self, field: &str) -> Result<T> {
        let Some(index) = self.mapping.columns().iter().position(|c| c.field == field) else {
            return Err(Error::Hydration(HydrationError {
                entity: self.mapping.entity_name(),
                field: "?",
                column: "?",
                message: format!("no mapped field named '{}'", field),
            }));
        };
        let column = &self.mapping.columns()[index];
        T::from_value(&self.values[index]).map_err(|err| {
            let message = match err {
                Error::Type(te) => format!("expected {}, found {}", te.expected, te.actual),
                other => other.to_string(),
            };
            Error::Hydration(HydrationError {
                entity: self.mapping.entity_name(),
                field: column.field,
                column: column.column,
                message,
            })
        })
    }

    /// Values in declaration order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

fn check_value(mapping: &EntityMapping, column: &ColumnMapping, value: &Value) -> Result<()> {
    let problem = if value.is_null() {
        (!column.nullable).then(|| "missing or NULL value for a non-nullable field".to_string())
    } else if column.sql_type.accepts(value) {
        None
    } else {
        Some(format!(
            "{} value is not convertible to {}",
            value.type_name(),
            column.sql_type.sql_name()
        ))
    };
    match problem {
        Some(message) => Err(Error::Hydration(HydrationError {
            entity: mapping.entity_name(),
            field: column.field,
            column: column.column,
            message,
        })),
        None => Ok(()),
    }
}

/// Hydrate one row into an entity.
pub fn hydrate<E: Entity>(mapping: &EntityMapping, row: &Row) -> Result<E> {
    let record = Record::from_row(mapping, row)?;
    E::from_record(&record)
}

/// Lazy sequence of hydrated entities over a cursor.
///
/// Yields one `Result<E>` per row in cursor order. Like the cursor it wraps
/// it is single-pass; a driver failure while advancing surfaces as an
/// `Error::Driver` item.
pub struct Hydrated<'c, E> {
    cursor: RowCursor<'c>,
    mapping: Arc<EntityMapping>,
    rows: u64,
    _entity: PhantomData<fn() -> E>,
}

impl<'c, E: Entity> Hydrated<'c, E> {
    pub fn new(cursor: RowCursor<'c>, mapping: Arc<EntityMapping>) -> Self {
        Self {
            cursor,
            mapping,
            rows: 0,
            _entity: PhantomData,
        }
    }

    /// Rows read from the cursor so far.
    pub fn rows_read(&self) -> u64 {
        self.rows
    }
}

impl<E: Entity> Iterator for Hydrated<'_, E> {
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.cursor.next()? {
            Ok(row) => row,
            Err(err) => {
                return Some(Err(Error::driver(
                    format!("reading rows from '{}'", self.mapping.table()),
                    err,
                )));
            }
        };
        self.rows += 1;
        Some(hydrate::<E>(&self.mapping, &row))
    }
}

impl<E> std::fmt::Debug for Hydrated<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hydrated")
            .field("table", &self.mapping.table())
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}
