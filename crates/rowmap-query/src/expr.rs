//! Predicate DSL for filtered reads and deletes.
//!
//! Conditions name fields, not columns; the statement builder resolves each
//! name against the entity mapping and turns every operand into a bind
//! parameter.

use rowmap_core::Value;
use serde::{Deserialize, Serialize};

/// SQL dialect for placeholder and upsert syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

/// A single predicate over one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field <op> value`
    Compare {
        field: String,
        op: BinaryOp,
        value: Value,
    },
    /// `field [NOT] LIKE pattern`
    Like {
        field: String,
        pattern: Value,
        negated: bool,
    },
    /// `field [NOT] IN (values)`
    InList {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    /// `field BETWEEN low AND high`
    Between {
        field: String,
        low: Value,
        high: Value,
    },
    /// `field IS [NOT] NULL`
    IsNull { field: String, negated: bool },
    /// Alternatives joined with OR
    Any(Vec<Condition>),
    /// Conditions joined with AND
    All(Vec<Condition>),
}

impl Condition {
    /// Group alternatives with OR.
    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Any(conditions.into_iter().collect())
    }

    /// Group conditions with AND.
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Condition::All(conditions.into_iter().collect())
    }
}

/// Reference to an entity field by name.
///
/// # Example
///
/// ```
/// use rowmap_query::{Col, Filter};
///
/// let filter = Filter::new()
///     .and(Col::new("name").like("A%"))
///     .and(Col::new("age").between(18, 65));
/// assert_eq!(filter.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Col(String);

impl Col {
    pub fn new(field: impl Into<String>) -> Self {
        Col(field.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    fn compare(self, op: BinaryOp, value: impl Into<Value>) -> Condition {
        Condition::Compare {
            field: self.0,
            op,
            value: value.into(),
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Condition {
        self.compare(BinaryOp::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Condition {
        self.compare(BinaryOp::Ne, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Condition {
        self.compare(BinaryOp::Gt, value)
    }

    pub fn ge(self, value: impl Into<Value>) -> Condition {
        self.compare(BinaryOp::Ge, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Condition {
        self.compare(BinaryOp::Lt, value)
    }

    pub fn le(self, value: impl Into<Value>) -> Condition {
        self.compare(BinaryOp::Le, value)
    }

    /// Pattern match; the pattern must be text.
    pub fn like(self, pattern: impl Into<Value>) -> Condition {
        Condition::Like {
            field: self.0,
            pattern: pattern.into(),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<Value>) -> Condition {
        Condition::Like {
            field: self.0,
            pattern: pattern.into(),
            negated: true,
        }
    }

    pub fn in_list<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Condition {
        Condition::InList {
            field: self.0,
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Condition {
        Condition::InList {
            field: self.0,
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    /// Inclusive range.
    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Condition {
        Condition::Between {
            field: self.0,
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn is_null(self) -> Condition {
        Condition::IsNull {
            field: self.0,
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Condition {
        Condition::IsNull {
            field: self.0,
            negated: true,
        }
    }
}

/// Conjunction of conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition that must also hold.
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl From<Condition> for Filter {
    fn from(condition: Condition) -> Self {
        Filter::new().and(condition)
    }
}

impl FromIterator<Condition> for Filter {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        Filter {
            conditions: iter.into_iter().collect(),
        }
    }
}
