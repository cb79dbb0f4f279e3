//! Field and column definitions.

use crate::types::SqlType;

/// Declared metadata for one persistent field of an entity.
///
/// Built with const builder methods so `#[derive(Entity)]` (or a hand-written
/// impl) can emit a `static` slice of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column_name: &'static str,
    /// SQL type affinity for this field
    pub sql_type: SqlType,
    /// Whether this field accepts NULL
    pub nullable: bool,
    /// Whether this field is the identity (primary key)
    pub identity: bool,
    /// Whether the identity value is produced on insert
    pub generated: bool,
    /// Whether this field is the optimistic-locking version counter
    pub version: bool,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name,
            sql_type,
            nullable: false,
            identity: false,
            generated: false,
            version: false,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark this field as the identity.
    pub const fn identity(mut self, value: bool) -> Self {
        self.identity = value;
        self
    }

    /// Mark the identity as generated on insert.
    ///
    /// Integer identities are generated by the database, UUID identities by
    /// the session.
    pub const fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    /// Mark this field as the version column.
    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }
}
