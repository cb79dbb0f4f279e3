//! Statement construction for rowmap.
//!
//! `rowmap-query` turns an [`EntityMapping`](rowmap_core::EntityMapping) plus
//! an operation into parameterized SQL and an ordered bind list:
//!
//! - **Statement builder**: select by identity or predicate, insert, update,
//!   delete, delete by predicate and upsert.
//! - **Predicate DSL**: `Col` / `Condition` / `Filter` for filtered reads.
//! - **Dialect support**: placeholder and upsert syntax for Postgres, SQLite
//!   and MySQL.
//!
//! Values are never written into SQL text; every operand is a bind.

pub mod builder;
pub mod expr;

pub use builder::{OperationKind, Statement, StatementBuilder};
pub use expr::{BinaryOp, Col, Condition, Dialect, Filter};
