//! Statement construction from entity mappings.
//!
//! Every operand becomes a bind parameter; SQL text only ever contains
//! identifiers from a validated mapping, operators, placeholders and a
//! builder-formatted integer LIMIT.
//!
//! Bind order follows column declaration order. For UPDATE and DELETE the
//! identity value comes after the SET values, followed by the expected version
//! when the mapping is versioned.

use crate::expr::{Condition, Dialect, Filter};
use rowmap_core::{EntityMapping, Error, Result, Value};

/// The kind of statement a [`Statement`] was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    SelectById,
    SelectWhere,
    Insert,
    Update,
    Delete,
    DeleteWhere,
    Upsert,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::SelectById => "select_by_id",
            OperationKind::SelectWhere => "select_where",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::DeleteWhere => "delete_where",
            OperationKind::Upsert => "upsert",
        }
    }
}

/// Parameterized SQL plus its ordered binds.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: OperationKind,
    pub sql: String,
    pub binds: Vec<Value>,
}

/// Placeholder allocator; each pushed value gets the next position.
struct Binder {
    dialect: Dialect,
    binds: Vec<Value>,
}

impl Binder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            binds: Vec::new(),
        }
    }

    fn push(&mut self, value: Value) -> String {
        self.binds.push(value);
        self.dialect.placeholder(self.binds.len())
    }

    fn finish(self, kind: OperationKind, sql: String) -> Statement {
        tracing::trace!(kind = kind.as_str(), sql = %sql, binds = self.binds.len(), "Built statement");
        Statement {
            kind,
            sql,
            binds: self.binds,
        }
    }
}

/// Builds statements for one entity mapping.
///
/// # Example
///
/// ```ignore
/// let mapping = registry.mapping_for::<User>()?;
/// let stmt = StatementBuilder::new(&mapping).select_by_id(Value::BigInt(7))?;
/// assert_eq!(stmt.sql, "SELECT id, name, version FROM users WHERE id = $1");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StatementBuilder<'m> {
    mapping: &'m EntityMapping,
    dialect: Dialect,
}

impl<'m> StatementBuilder<'m> {
    /// Builder for `mapping` with the default (Postgres) dialect.
    pub fn new(mapping: &'m EntityMapping) -> Self {
        Self {
            mapping,
            dialect: Dialect::default(),
        }
    }

    /// Set the SQL dialect.
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    fn column_list(&self) -> String {
        self.mapping
            .columns()
            .iter()
            .map(|c| c.column)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn check_arity(&self, operation: &'static str, values: &[Value]) -> Result<()> {
        let expected = self.mapping.columns().len();
        if values.len() == expected {
            Ok(())
        } else {
            Err(Error::unsupported(
                operation,
                format!(
                    "{} has {} columns but {} values were supplied",
                    self.mapping.table(),
                    expected,
                    values.len()
                ),
            ))
        }
    }

    fn check_identity(&self, operation: &'static str, id: &Value) -> Result<()> {
        if id.is_null() {
            return Err(Error::unsupported(
                operation,
                format!(
                    "identity '{}' of {} is NULL",
                    self.mapping.identity().field,
                    self.mapping.table()
                ),
            ));
        }
        Ok(())
    }

    fn check_versioned(&self, operation: &'static str, expected: Option<i64>) -> Result<()> {
        if expected.is_some() && !self.mapping.is_versioned() {
            return Err(Error::unsupported(
                operation,
                format!(
                    "{} has no version column to check against",
                    self.mapping.table()
                ),
            ));
        }
        Ok(())
    }

    /// `SELECT cols FROM t WHERE id = $1`
    pub fn select_by_id(&self, id: Value) -> Result<Statement> {
        self.check_identity("select", &id)?;
        let mut binder = Binder::new(self.dialect);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.column_list(),
            self.mapping.table(),
            self.mapping.identity().column,
            binder.push(id)
        );
        Ok(binder.finish(OperationKind::SelectById, sql))
    }

    /// `SELECT cols FROM t [WHERE ...] [LIMIT n]`
    pub fn select_where(&self, filter: &Filter, limit: Option<u64>) -> Result<Statement> {
        let mut binder = Binder::new(self.dialect);
        let mut sql = format!("SELECT {} FROM {}", self.column_list(), self.mapping.table());
        if !filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.render_filter("select", filter, &mut binder)?);
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(binder.finish(OperationKind::SelectWhere, sql))
    }

    /// `INSERT INTO t (cols) VALUES (...)`
    ///
    /// A generated identity whose value is NULL is left out so the database
    /// can supply it.
    pub fn insert(&self, values: &[Value]) -> Result<Statement> {
        self.check_arity("insert", values)?;
        let mut binder = Binder::new(self.dialect);
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        for (column, value) in self.mapping.columns().iter().zip(values) {
            if column.identity && column.generated && value.is_null() {
                continue;
            }
            columns.push(column.column);
            placeholders.push(binder.push(value.clone()));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.mapping.table(),
            columns.join(", "),
            placeholders.join(", ")
        );
        Ok(binder.finish(OperationKind::Insert, sql))
    }

    /// `UPDATE t SET ... WHERE id = $n [AND version = $n+1]`
    ///
    /// On a versioned mapping the version column is set to `expected + 1`.
    /// `expected_version` defaults to the version value in `values`.
    pub fn update(&self, values: &[Value], expected_version: Option<i64>) -> Result<Statement> {
        self.check_arity("update", values)?;
        self.check_versioned("update", expected_version)?;
        let identity = self.mapping.identity_index();
        self.check_identity("update", &values[identity])?;

        let expected = match self.mapping.version_index() {
            Some(index) => {
                let expected = match expected_version {
                    Some(expected) => expected,
                    None => values[index].as_i64().ok_or_else(|| {
                        Error::unsupported(
                            "update",
                            format!(
                                "version '{}' holds {}, not an integer",
                                self.mapping.columns()[index].field,
                                values[index].type_name()
                            ),
                        )
                    })?,
                };
                let next = expected.checked_add(1).ok_or_else(|| {
                    Error::unsupported("update", "version counter would overflow")
                })?;
                Some((index, expected, next))
            }
            None => None,
        };

        let mut binder = Binder::new(self.dialect);
        let mut assignments = Vec::with_capacity(values.len());
        for (index, (column, value)) in self.mapping.columns().iter().zip(values).enumerate() {
            if index == identity {
                continue;
            }
            let value = match expected {
                Some((version, _, next)) if version == index => Value::BigInt(next),
                _ => value.clone(),
            };
            assignments.push(format!("{} = {}", column.column, binder.push(value)));
        }
        if assignments.is_empty() {
            return Err(Error::unsupported(
                "update",
                format!("{} has no columns besides its identity", self.mapping.table()),
            ));
        }

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.mapping.table(),
            assignments.join(", "),
            self.mapping.identity().column,
            binder.push(values[identity].clone())
        );
        if let Some((version, expected, _)) = expected {
            sql.push_str(&format!(
                " AND {} = {}",
                self.mapping.columns()[version].column,
                binder.push(Value::BigInt(expected))
            ));
        }
        Ok(binder.finish(OperationKind::Update, sql))
    }

    /// `DELETE FROM t WHERE id = $1 [AND version = $2]`
    pub fn delete(&self, id: Value, expected_version: Option<i64>) -> Result<Statement> {
        self.check_identity("delete", &id)?;
        self.check_versioned("delete", expected_version)?;
        let mut binder = Binder::new(self.dialect);
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.mapping.table(),
            self.mapping.identity().column,
            binder.push(id)
        );
        if let (Some(expected), Some(version)) = (expected_version, self.mapping.version()) {
            sql.push_str(&format!(
                " AND {} = {}",
                version.column,
                binder.push(Value::BigInt(expected))
            ));
        }
        Ok(binder.finish(OperationKind::Delete, sql))
    }

    /// `DELETE FROM t WHERE ...`
    ///
    /// An empty filter is rejected rather than deleting the whole table.
    pub fn delete_where(&self, filter: &Filter) -> Result<Statement> {
        if filter.is_empty() {
            return Err(Error::unsupported(
                "delete",
                "refusing to delete without a condition",
            ));
        }
        let mut binder = Binder::new(self.dialect);
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.mapping.table(),
            self.render_filter("delete", filter, &mut binder)?
        );
        Ok(binder.finish(OperationKind::DeleteWhere, sql))
    }

    /// Insert, or overwrite every non-identity column when the identity exists.
    pub fn upsert(&self, values: &[Value]) -> Result<Statement> {
        self.check_arity("upsert", values)?;
        self.check_identity("upsert", &values[self.mapping.identity_index()])?;
        let mut binder = Binder::new(self.dialect);
        let placeholders: Vec<_> = values.iter().map(|v| binder.push(v.clone())).collect();
        let updates: Vec<_> = self
            .mapping
            .columns()
            .iter()
            .filter(|c| !c.identity)
            .map(|c| match self.dialect {
                Dialect::Mysql => format!("{0} = VALUES({0})", c.column),
                Dialect::Postgres | Dialect::Sqlite => format!("{0} = EXCLUDED.{0}", c.column),
            })
            .collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.mapping.table(),
            self.column_list(),
            placeholders.join(", ")
        );
        let identity = self.mapping.identity().column;
        match (self.dialect, updates.is_empty()) {
            (Dialect::Mysql, true) => {
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {0} = {0}", identity));
            }
            (Dialect::Mysql, false) => {
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", ")));
            }
            (_, true) => sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", identity)),
            (_, false) => sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                identity,
                updates.join(", ")
            )),
        }
        Ok(binder.finish(OperationKind::Upsert, sql))
    }

    fn render_filter(
        &self,
        operation: &'static str,
        filter: &Filter,
        binder: &mut Binder,
    ) -> Result<String> {
        let parts = filter
            .conditions()
            .iter()
            .map(|c| self.render(operation, c, binder))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(" AND "))
    }

    fn column(&self, operation: &'static str, field: &str) -> Result<&'static str> {
        self.mapping
            .resolve(field)
            .map(|i| self.mapping.columns()[i].column)
            .ok_or_else(|| {
                Error::unsupported(
                    operation,
                    format!("{} has no field or column '{}'", self.mapping.table(), field),
                )
            })
    }

    fn render(
        &self,
        operation: &'static str,
        condition: &Condition,
        binder: &mut Binder,
    ) -> Result<String> {
        match condition {
            Condition::Compare { field, op, value } => {
                let column = self.column(operation, field)?;
                if value.is_null() {
                    return Err(Error::unsupported(
                        operation,
                        format!(
                            "'{} {} NULL' never matches; use is_null or is_not_null",
                            field,
                            op.as_str()
                        ),
                    ));
                }
                Ok(format!("{} {} {}", column, op.as_str(), binder.push(value.clone())))
            }
            Condition::Like {
                field,
                pattern,
                negated,
            } => {
                let column = self.column(operation, field)?;
                if !matches!(pattern, Value::Text(_)) {
                    return Err(Error::unsupported(
                        operation,
                        format!(
                            "LIKE pattern for '{}' must be text, got {}",
                            field,
                            pattern.type_name()
                        ),
                    ));
                }
                let keyword = if *negated { "NOT LIKE" } else { "LIKE" };
                Ok(format!("{} {} {}", column, keyword, binder.push(pattern.clone())))
            }
            Condition::InList {
                field,
                values,
                negated,
            } => {
                let column = self.column(operation, field)?;
                if values.is_empty() {
                    return Err(Error::unsupported(
                        operation,
                        format!("IN list for '{}' is empty", field),
                    ));
                }
                if values.iter().any(Value::is_null) {
                    return Err(Error::unsupported(
                        operation,
                        format!("IN list for '{}' contains NULL", field),
                    ));
                }
                let placeholders: Vec<_> = values.iter().map(|v| binder.push(v.clone())).collect();
                let keyword = if *negated { "NOT IN" } else { "IN" };
                Ok(format!("{} {} ({})", column, keyword, placeholders.join(", ")))
            }
            Condition::Between { field, low, high } => {
                let column = self.column(operation, field)?;
                if low.is_null() || high.is_null() {
                    return Err(Error::unsupported(
                        operation,
                        format!("BETWEEN bound for '{}' is NULL", field),
                    ));
                }
                let low = binder.push(low.clone());
                let high = binder.push(high.clone());
                Ok(format!("{} BETWEEN {} AND {}", column, low, high))
            }
            Condition::IsNull { field, negated } => {
                let column = self.column(operation, field)?;
                let keyword = if *negated { "IS NOT NULL" } else { "IS NULL" };
                Ok(format!("{} {}", column, keyword))
            }
            Condition::Any(group) | Condition::All(group) => {
                let joiner = if matches!(condition, Condition::Any(_)) {
                    " OR "
                } else {
                    " AND "
                };
                if group.is_empty() {
                    return Err(Error::unsupported(
                        operation,
                        "condition group has no members",
                    ));
                }
                let parts = group
                    .iter()
                    .map(|c| self.render(operation, c, binder))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(joiner)))
            }
        }
    }
}
