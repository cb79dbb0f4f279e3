//! rowmap - synchronous object-relational mapping for Rust.
//!
//! rowmap maps plain structs to tables and runs each unit of work on one
//! pooled connection:
//!
//! - `#[derive(Entity)]` declares the table, the identity and an optional
//!   version column used for optimistic locking
//! - [`Database`] opens [`Session`]s against any [`ConnectionProvider`],
//!   usually a [`Pool`]
//! - a session leases one connection, runs one transaction on it and always
//!   hands the connection back, even when it is dropped mid-transaction
//! - every statement is parameterized; values never end up in SQL text
//! - fields may be plain scalars, `String`, `Vec<u8>`, `uuid::Uuid`,
//!   `serde_json::Value`, `chrono` dates and timestamps or
//!   `rust_decimal::Decimal`; other types opt in by implementing
//!   [`TypeInfo`], [`FromValue`] and `From<T> for Value`
//!
//! # Quick Start
//!
//! ```ignore
//! use rowmap::prelude::*;
//!
//! #[derive(Entity, Debug, Clone, PartialEq)]
//! #[rowmap(table = "users")]
//! struct User {
//!     #[rowmap(identity)]
//!     id: i64,
//!     name: String,
//!     #[rowmap(version)]
//!     version: i64,
//! }
//!
//! fn rename(db: &Database<Pool<impl ConnectionFactory>>) -> rowmap::Result<()> {
//!     db.transaction(|session| {
//!         let mut user: User = session
//!             .find_one_by(&Col::new("name").eq("Ann").into())?;
//!         user.name = "Annie".into();
//!         session.update(&mut user) // fails with OptimisticLock if someone got there first
//!     })
//! }
//! ```
//!
//! Generated code refers to `rowmap_core` directly, so crates deriving
//! `Entity` depend on `rowmap-core` alongside `rowmap`.

pub use rowmap_core::{
    CardinalityError, ColumnInfo, CommitError, Connection, ConnectionProvider, DiagnosticEvent,
    DiagnosticSink, Diagnostics, DriverError, DriverResult, Entity, EntityMapping, EntityRegistry,
    Error, FieldInfo, FromValue, Hydrated, MappingError, MappingErrorKind, NotFoundError,
    OptimisticLockError, PoolExhaustedError, Record, Result, Row, RowCursor, SqlType, TracingSink,
    TransactionOutcome, TypeInfo, Value,
};

pub use rowmap_macros::Entity;

pub use rowmap_query::{
    BinaryOp, Col, Condition, Dialect, Filter, OperationKind, Statement, StatementBuilder,
};

pub use rowmap_pool::{ConnectionFactory, Pool, PoolConfig, PoolStats};

pub use rowmap_session::{
    CancelToken, ConnectionLease, Database, Session, SessionConfig, SessionState,
};

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        CancelToken, Col, Condition, Connection, ConnectionFactory, ConnectionProvider, Database,
        Dialect, DriverError, DriverResult, Entity, Error, Filter, FromValue, Pool, PoolConfig,
        Result, Row, RowCursor, Session, SessionConfig, SessionState, Value,
    };
}
