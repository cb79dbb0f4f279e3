//! The `Entity` capability.
//!
//! An entity is a plain struct mapped to one table with exactly one identity
//! field. It is normally implemented with `#[derive(Entity)]` from
//! `rowmap-macros`, which emits the static field description and the value
//! conversions below. Hand-written impls are equally valid.

use crate::Result;
use crate::error::Error;
use crate::field::FieldInfo;
use crate::hydrate::Record;
use crate::value::Value;

/// A persistent type with a declared table, fields and identity.
///
/// # Example
///
/// ```ignore
/// use rowmap::prelude::*;
///
/// #[derive(Entity, Debug, Clone, PartialEq)]
/// #[rowmap(table = "users")]
/// struct User {
///     #[rowmap(identity)]
///     id: i64,
///     name: String,
///     #[rowmap(version)]
///     version: i64,
/// }
/// ```
pub trait Entity: Sized + Send + 'static {
    /// The database table name.
    const TABLE_NAME: &'static str;

    /// Declared persistent fields, in column order.
    fn fields() -> &'static [FieldInfo];

    /// Current field values, in the same order as [`Entity::fields`].
    fn to_values(&self) -> Vec<Value>;

    /// Build an instance from a hydrated record.
    fn from_record(record: &Record<'_>) -> Result<Self>;

    /// Overwrite one field from a raw value.
    ///
    /// Used to write back generated identities and bumped versions.
    fn assign(&mut self, field: &str, value: &Value) -> Result<()>;
}

/// Error for [`Entity::assign`] called with a field the entity does not declare.
pub fn unknown_field<E: Entity>(field: &str) -> Error {
    Error::unsupported(
        "assign",
        format!(
            "{} has no persistent field named '{}'",
            std::any::type_name::<E>(),
            field
        ),
    )
}
