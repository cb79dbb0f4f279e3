//! Core types and traits for rowmap.
//!
//! This crate provides the foundations the other rowmap crates build on:
//!
//! - `Value` and `Row` for raw SQL data, `RowCursor` for driver results
//! - `Entity` and `FieldInfo` for declaring persistent types
//! - `EntityRegistry` for validated, cached entity mappings
//! - `Record` / `Hydrated` for turning rows back into entities
//! - `Connection` and `ConnectionProvider` for drivers and pools
//! - `Error`, the single error type for every rowmap operation

pub mod connection;
pub mod diagnostics;
pub mod entity;
pub mod error;
pub mod field;
pub mod hydrate;
pub mod registry;
pub mod row;
pub mod types;
pub mod value;

pub use connection::{Connection, ConnectionProvider};
pub use diagnostics::{DiagnosticEvent, DiagnosticSink, Diagnostics, TracingSink, TransactionOutcome};
pub use entity::{Entity, unknown_field};
pub use error::{
    CardinalityError, CommitError, DriverError, DriverFailure, DriverResult, Error, HydrationError,
    MappingError, MappingErrorKind, NotFoundError, OptimisticLockError, PoolExhaustedError, Result,
    StateError, TypeError, UnsupportedOperationError,
};
pub use field::FieldInfo;
pub use hydrate::{Hydrated, Record, hydrate};
pub use registry::{ColumnMapping, EntityMapping, EntityRegistry};
pub use row::{ColumnInfo, FromValue, Row, RowCursor};
pub use types::{SqlType, TypeInfo};
pub use value::Value;
