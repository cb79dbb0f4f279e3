//! Entity metadata registry.
//!
//! The registry turns an [`Entity`]'s declared fields into a validated
//! [`EntityMapping`] the first time the type is used and caches it for the
//! life of the process. Entries are append-only: once inserted a mapping is
//! never replaced, mutated or evicted, so every caller holding an
//! `Arc<EntityMapping>` for a type sees the same instance.
//!
//! Concurrent first access is safe. Two threads may both build a mapping for
//! the same type; the first insert wins and the loser's copy is discarded.
//! Failed validations are not cached, so a broken declaration fails on every
//! lookup.

use crate::Result;
use crate::entity::Entity;
use crate::error::{MappingError, MappingErrorKind};
use crate::field::FieldInfo;
use crate::types::SqlType;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

static IDENTIFIER: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"));

static GLOBAL: Lazy<Arc<EntityRegistry>> = Lazy::new(|| Arc::new(EntityRegistry::new()));

fn is_identifier(name: &str) -> bool {
    IDENTIFIER.as_ref().is_ok_and(|re| re.is_match(name))
}

/// Validated mapping of one field to one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    /// Rust field name
    pub field: &'static str,
    /// Database column name
    pub column: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub identity: bool,
    pub generated: bool,
    pub version: bool,
}

impl From<&FieldInfo> for ColumnMapping {
    fn from(info: &FieldInfo) -> Self {
        Self {
            field: info.name,
            column: info.column_name,
            sql_type: info.sql_type,
            nullable: info.nullable,
            identity: info.identity,
            generated: info.generated,
            version: info.version,
        }
    }
}

/// Immutable, validated description of how an entity maps to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMapping {
    entity: &'static str,
    table: &'static str,
    columns: Vec<ColumnMapping>,
    identity: usize,
    version: Option<usize>,
}

impl EntityMapping {
    /// Build and validate the mapping for `E`.
    pub fn of<E: Entity>() -> std::result::Result<Self, MappingError> {
        Self::from_fields(std::any::type_name::<E>(), E::TABLE_NAME, E::fields())
    }

    /// Build and validate a mapping from a raw field description.
    pub fn from_fields(
        entity: &'static str,
        table: &'static str,
        fields: &[FieldInfo],
    ) -> std::result::Result<Self, MappingError> {
        let fail = |kind, message: String| MappingError {
            entity,
            kind,
            message,
        };

        if !is_identifier(table) {
            return Err(fail(
                MappingErrorKind::InvalidIdentifier,
                format!("table name '{}' is not a plain SQL identifier", table),
            ));
        }
        if fields.is_empty() {
            return Err(fail(
                MappingErrorKind::NoFields,
                "no persistent fields declared".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(fields.len());
        let mut identity = None;
        let mut version = None;
        for (index, field) in fields.iter().enumerate() {
            if !is_identifier(field.column_name) {
                return Err(fail(
                    MappingErrorKind::InvalidIdentifier,
                    format!(
                        "column name '{}' of field '{}' is not a plain SQL identifier",
                        field.column_name, field.name
                    ),
                ));
            }
            if !field.sql_type.is_supported() {
                return Err(fail(
                    MappingErrorKind::UnsupportedType,
                    format!(
                        "field '{}' has type {} which has no conversion rules",
                        field.name,
                        field.sql_type.sql_name()
                    ),
                ));
            }
            if !seen.insert(field.column_name.to_lowercase()) {
                return Err(fail(
                    MappingErrorKind::DuplicateColumn,
                    format!("column '{}' is mapped more than once", field.column_name),
                ));
            }

            if field.identity {
                if let Some(first) = identity {
                    let first: &FieldInfo = &fields[first];
                    return Err(fail(
                        MappingErrorKind::MultipleIdentity,
                        format!(
                            "both '{}' and '{}' are declared as identity",
                            first.name, field.name
                        ),
                    ));
                }
                identity = Some(index);
            }

            if field.generated {
                if !field.identity {
                    return Err(fail(
                        MappingErrorKind::InvalidIdentity,
                        format!("field '{}' is generated but is not the identity", field.name),
                    ));
                }
                if !field.sql_type.is_integer() && field.sql_type != SqlType::Uuid {
                    return Err(fail(
                        MappingErrorKind::InvalidIdentity,
                        format!(
                            "generated identity '{}' must be an integer or UUID, found {}",
                            field.name,
                            field.sql_type.sql_name()
                        ),
                    ));
                }
            }

            if field.version {
                let problem = if version.is_some() {
                    Some("more than one version column is declared")
                } else if field.identity {
                    Some("the version column cannot be the identity")
                } else if field.nullable {
                    Some("the version column cannot be nullable")
                } else if !field.sql_type.is_integer() {
                    Some("the version column must be an integer")
                } else {
                    None
                };
                if let Some(problem) = problem {
                    return Err(fail(
                        MappingErrorKind::InvalidVersionColumn,
                        format!("{} (field '{}')", problem, field.name),
                    ));
                }
                version = Some(index);
            }
        }

        let Some(identity) = identity else {
            return Err(fail(
                MappingErrorKind::MissingIdentity,
                "no field is declared as identity".to_string(),
            ));
        };

        Ok(Self {
            entity,
            table,
            columns: fields.iter().map(ColumnMapping::from).collect(),
            identity,
            version,
        })
    }

    /// Rust type name of the mapped entity.
    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    pub fn identity(&self) -> &ColumnMapping {
        &self.columns[self.identity]
    }

    /// Position of the identity column in [`EntityMapping::columns`].
    pub fn identity_index(&self) -> usize {
        self.identity
    }

    pub fn version(&self) -> Option<&ColumnMapping> {
        self.version.map(|i| &self.columns[i])
    }

    pub fn version_index(&self) -> Option<usize> {
        self.version
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// Resolve a field reference to a column position.
    ///
    /// Field names are tried first, then column names, both ignoring case.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.field.eq_ignore_ascii_case(name))
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.column.eq_ignore_ascii_case(name))
            })
    }
}

/// Process-wide cache of validated entity mappings.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    mappings: RwLock<HashMap<TypeId, Arc<EntityMapping>>>,
}

impl EntityRegistry {
    /// Create an empty registry.
    ///
    /// Most code uses [`EntityRegistry::global`]; a private registry is handy
    /// for isolating tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> Arc<EntityRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Get the mapping for `E`, building and caching it on first use.
    pub fn mapping_for<E: Entity>(&self) -> Result<Arc<EntityMapping>> {
        if let Some(mapping) = self.mappings.read().get(&TypeId::of::<E>()) {
            return Ok(Arc::clone(mapping));
        }
        self.insert::<E>()
    }

    /// Eagerly build and cache the mapping for `E`.
    ///
    /// Registering a type that is already cached is a no-op returning the
    /// cached mapping.
    pub fn register<E: Entity>(&self) -> Result<Arc<EntityMapping>> {
        if let Some(mapping) = self.mappings.read().get(&TypeId::of::<E>()) {
            tracing::debug!(
                entity = std::any::type_name::<E>(),
                "entity already registered"
            );
            return Ok(Arc::clone(mapping));
        }
        self.insert::<E>()
    }

    pub fn is_registered<E: Entity>(&self) -> bool {
        self.mappings.read().contains_key(&TypeId::of::<E>())
    }

    /// Number of cached mappings.
    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }

    fn insert<E: Entity>(&self) -> Result<Arc<EntityMapping>> {
        // Validation runs outside the lock; a racing thread may do the same work.
        let built = match EntityMapping::of::<E>() {
            Ok(mapping) => Arc::new(mapping),
            Err(err) => {
                tracing::warn!(
                    entity = err.entity,
                    kind = ?err.kind,
                    "entity mapping rejected: {}",
                    err.message
                );
                return Err(err.into());
            }
        };

        let mut mappings = self.mappings.write();
        let cached = mappings.entry(TypeId::of::<E>()).or_insert_with(|| {
            tracing::debug!(
                entity = built.entity_name(),
                table = built.table(),
                columns = built.columns().len(),
                versioned = built.is_versioned(),
                "entity mapping registered"
            );
            Arc::clone(&built)
        });
        Ok(Arc::clone(cached))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::hydrate::Record;
    use crate::value::Value;

    struct Account;

    impl Entity for Account {
        const TABLE_NAME: &'static str = "accounts";

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: [FieldInfo; 3] = [
                FieldInfo::new("id", "id", SqlType::BigInt).identity(true),
                FieldInfo::new("owner", "owner_name", SqlType::Text),
                FieldInfo::new("version", "version", SqlType::BigInt).version(true),
            ];
            &FIELDS
        }

        fn to_values(&self) -> Vec<Value> {
            Vec::new()
        }

        fn from_record(_record: &Record<'_>) -> Result<Self> {
            Ok(Account)
        }

        fn assign(&mut self, field: &str, _value: &Value) -> Result<()> {
            Err(crate::entity::unknown_field::<Self>(field))
        }
    }

    fn kind_of(fields: &[FieldInfo]) -> MappingErrorKind {
        match EntityMapping::from_fields("T", "t", fields) {
            Ok(_) => panic!("mapping unexpectedly accepted"),
            Err(err) => err.kind,
        }
    }

    #[test]
    fn mapping_is_cached_and_shared() {
        let registry = EntityRegistry::new();
        assert!(!registry.is_registered::<Account>());
        let first = registry.mapping_for::<Account>().unwrap();
        let second = registry.mapping_for::<Account>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        let registered = registry.register::<Account>().unwrap();
        assert!(Arc::ptr_eq(&first, &registered));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_first_access_yields_one_instance() {
        let registry = Arc::new(EntityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.mapping_for::<Account>().unwrap())
            })
            .collect();
        let mappings: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for mapping in &mappings {
            assert!(Arc::ptr_eq(mapping, &mappings[0]));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn mapping_exposes_identity_and_version() {
        let mapping = EntityMapping::of::<Account>().unwrap();
        assert_eq!(mapping.table(), "accounts");
        assert_eq!(mapping.identity().column, "id");
        assert_eq!(mapping.version().map(|c| c.column), Some("version"));
        assert_eq!(mapping.resolve("OWNER"), Some(1));
        assert_eq!(mapping.resolve("owner_name"), Some(1));
        assert_eq!(mapping.resolve("nope"), None);
    }

    #[test]
    fn rejects_missing_and_multiple_identity() {
        assert_eq!(
            kind_of(&[FieldInfo::new("a", "a", SqlType::Text)]),
            MappingErrorKind::MissingIdentity
        );
        assert_eq!(
            kind_of(&[
                FieldInfo::new("a", "a", SqlType::BigInt).identity(true),
                FieldInfo::new("b", "b", SqlType::BigInt).identity(true),
            ]),
            MappingErrorKind::MultipleIdentity
        );
    }

    #[test]
    fn rejects_duplicate_columns_ignoring_case() {
        assert_eq!(
            kind_of(&[
                FieldInfo::new("id", "id", SqlType::BigInt).identity(true),
                FieldInfo::new("name", "Name", SqlType::Text),
                FieldInfo::new("label", "NAME", SqlType::Text),
            ]),
            MappingErrorKind::DuplicateColumn
        );
    }

    #[test]
    fn rejects_unsupported_type_and_bad_identifiers() {
        assert_eq!(
            kind_of(&[
                FieldInfo::new("id", "id", SqlType::BigInt).identity(true),
                FieldInfo::new("mood", "mood", SqlType::Custom("mood_enum")),
            ]),
            MappingErrorKind::UnsupportedType
        );
        assert_eq!(
            kind_of(&[FieldInfo::new("id", "id; DROP TABLE t", SqlType::BigInt).identity(true)]),
            MappingErrorKind::InvalidIdentifier
        );
        assert_eq!(
            EntityMapping::from_fields(
                "T",
                "bad table",
                &[FieldInfo::new("id", "id", SqlType::BigInt).identity(true)]
            )
            .unwrap_err()
            .kind,
            MappingErrorKind::InvalidIdentifier
        );
        assert_eq!(kind_of(&[]), MappingErrorKind::NoFields);
    }

    #[test]
    fn rejects_bad_version_and_generated_columns() {
        let id = FieldInfo::new("id", "id", SqlType::BigInt).identity(true);
        assert_eq!(
            kind_of(&[id, FieldInfo::new("v", "v", SqlType::Text).version(true)]),
            MappingErrorKind::InvalidVersionColumn
        );
        assert_eq!(
            kind_of(&[
                id,
                FieldInfo::new("v", "v", SqlType::BigInt)
                    .version(true)
                    .nullable(true)
            ]),
            MappingErrorKind::InvalidVersionColumn
        );
        assert_eq!(
            kind_of(&[FieldInfo::new("id", "id", SqlType::BigInt)
                .identity(true)
                .version(true)]),
            MappingErrorKind::InvalidVersionColumn
        );
        assert_eq!(
            kind_of(&[FieldInfo::new("id", "id", SqlType::Text)
                .identity(true)
                .generated(true)]),
            MappingErrorKind::InvalidIdentity
        );
        assert!(
            EntityMapping::from_fields(
                "T",
                "t",
                &[FieldInfo::new("id", "id", SqlType::Uuid)
                    .identity(true)
                    .generated(true)]
            )
            .is_ok()
        );
    }

    #[test]
    fn failures_are_not_cached() {
        struct Broken;
        impl Entity for Broken {
            const TABLE_NAME: &'static str = "broken";
            fn fields() -> &'static [FieldInfo] {
                static FIELDS: [FieldInfo; 1] = [FieldInfo::new("name", "name", SqlType::Text)];
                &FIELDS
            }
            fn to_values(&self) -> Vec<Value> {
                Vec::new()
            }
            fn from_record(_record: &Record<'_>) -> Result<Self> {
                Ok(Broken)
            }
            fn assign(&mut self, field: &str, _value: &Value) -> Result<()> {
                Err(crate::entity::unknown_field::<Self>(field))
            }
        }

        let registry = EntityRegistry::new();
        assert!(matches!(
            registry.mapping_for::<Broken>(),
            Err(Error::Mapping(e)) if e.kind == MappingErrorKind::MissingIdentity
        ));
        assert!(registry.is_empty());
        assert!(registry.mapping_for::<Broken>().is_err());
    }
}
