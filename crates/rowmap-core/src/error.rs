//! Error types for rowmap operations.
//!
//! Every failure in the core is one [`Error`] variant carrying a detail struct.
//! Driver failures arrive as a single opaque [`DriverError`] and are wrapped with
//! context, never reinterpreted. When cleanup (rollback, lease release) fails
//! after another failure, the original stays the primary error and the cleanup
//! failure is attached as a secondary one, see [`Error::with_cleanup`].

use crate::value::Value;
use std::fmt;
use std::time::Duration;

/// The primary error type for all rowmap operations.
#[derive(Debug)]
pub enum Error {
    /// Entity metadata violates a mapping invariant (fatal for that type)
    Mapping(MappingError),
    /// The statement builder cannot express the request
    Unsupported(UnsupportedOperationError),
    /// A row could not be turned into an entity instance
    Hydration(HydrationError),
    /// A raw value could not be converted to a Rust type
    Type(TypeError),
    /// No connection became available within the configured wait
    PoolExhausted(PoolExhaustedError),
    /// The database driver reported a failure
    Driver(DriverFailure),
    /// The driver failed to commit; durable state is unspecified
    Commit(CommitError),
    /// An update or delete matched no row at the expected version
    OptimisticLock(OptimisticLockError),
    /// A statement addressed by identity matched no row
    NotFound(NotFoundError),
    /// A query expected exactly one row
    Cardinality(CardinalityError),
    /// An operation was issued in the wrong session state
    State(StateError),
    /// The session's cancel token was raised
    Cancelled,
    /// A failure whose cleanup also failed
    WithCleanup {
        /// The original failure
        primary: Box<Error>,
        /// The failure raised while cleaning up after `primary`
        cleanup: Box<Error>,
    },
}

#[derive(Debug, Clone)]
pub struct MappingError {
    /// Rust type name of the entity
    pub entity: &'static str,
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// No field is flagged as the identity
    MissingIdentity,
    /// More than one field is flagged as the identity
    MultipleIdentity,
    /// Two fields map to the same column name
    DuplicateColumn,
    /// A field's SQL type has no conversion rules
    UnsupportedType,
    /// A table or column name is not a plain SQL identifier
    InvalidIdentifier,
    /// The entity declares no persistent fields
    NoFields,
    /// The version column is nullable, non-integer, duplicated or the identity
    InvalidVersionColumn,
    /// A generated identity has a type that cannot be generated
    InvalidIdentity,
}

#[derive(Debug, Clone)]
pub struct UnsupportedOperationError {
    /// Operation being built (e.g. "select", "update")
    pub operation: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct HydrationError {
    /// Rust type name of the entity
    pub entity: &'static str,
    /// Entity field being hydrated
    pub field: &'static str,
    /// Column the value was read from
    pub column: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolExhaustedError {
    /// How long the caller waited before giving up
    pub waited: Duration,
    /// Pool capacity at the time of the failure
    pub max_connections: usize,
}

/// The single failure kind reported by database drivers.
///
/// Drivers build this from their native errors; the core only wraps it.
#[derive(Debug)]
pub struct DriverError {
    pub message: String,
    pub sqlstate: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
            source: None,
        }
    }

    /// Attach a SQLSTATE code.
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    /// Attach the driver's native error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// A [`DriverError`] together with what the core was doing when it happened.
#[derive(Debug)]
pub struct DriverFailure {
    pub context: String,
    pub sql: Option<String>,
    pub source: DriverError,
}

#[derive(Debug)]
pub struct CommitError {
    pub source: DriverError,
}

#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub table: &'static str,
    pub identity: Value,
    pub expected_version: i64,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub table: &'static str,
    pub identity: Value,
}

#[derive(Debug, Clone)]
pub struct CardinalityError {
    pub table: &'static str,
    /// Number of rows seen; reading stops at the second row
    pub found: usize,
}

#[derive(Debug, Clone)]
pub struct StateError {
    pub operation: &'static str,
    pub state: &'static str,
}

impl Error {
    /// Wrap a driver failure with context.
    pub fn driver(context: impl Into<String>, source: DriverError) -> Self {
        Error::Driver(DriverFailure {
            context: context.into(),
            sql: None,
            source,
        })
    }

    /// Wrap a driver failure raised while running `sql`.
    pub fn driver_with_sql(
        context: impl Into<String>,
        sql: impl Into<String>,
        source: DriverError,
    ) -> Self {
        Error::Driver(DriverFailure {
            context: context.into(),
            sql: Some(sql.into()),
            source,
        })
    }

    pub fn unsupported(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Unsupported(UnsupportedOperationError {
            operation,
            message: message.into(),
        })
    }

    pub fn state(operation: &'static str, state: &'static str) -> Self {
        Error::State(StateError { operation, state })
    }

    /// Attach a cleanup failure to this error.
    ///
    /// `self` stays the primary error. If `self` already carries a cleanup
    /// failure, the existing one is kept and the new one is logged and dropped.
    #[must_use]
    pub fn with_cleanup(self, cleanup: Error) -> Self {
        match self {
            Error::WithCleanup { primary, cleanup: existing } => {
                tracing::warn!(
                    error = %cleanup,
                    "additional cleanup failure dropped; first cleanup failure kept"
                );
                Error::WithCleanup {
                    primary,
                    cleanup: existing,
                }
            }
            primary => Error::WithCleanup {
                primary: Box::new(primary),
                cleanup: Box::new(cleanup),
            },
        }
    }

    /// The original failure, looking through an attached cleanup failure.
    pub fn primary(&self) -> &Error {
        match self {
            Error::WithCleanup { primary, .. } => primary,
            other => other,
        }
    }

    /// The cleanup failure attached to this error, if any.
    pub fn cleanup_failure(&self) -> Option<&Error> {
        match self {
            Error::WithCleanup { cleanup, .. } => Some(cleanup),
            _ => None,
        }
    }

    /// Is this a transient error worth retrying with backoff?
    pub fn is_retryable(&self) -> bool {
        matches!(self.primary(), Error::PoolExhausted(_))
    }

    /// Did the unit of work fail to apply (commit failure or stale version)?
    ///
    /// The caller decides whether to retry the whole unit of work.
    pub fn is_transaction_failure(&self) -> bool {
        matches!(
            self.primary(),
            Error::Commit(_) | Error::OptimisticLock(_)
        )
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self.primary(), Error::OptimisticLock(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.primary(), Error::Cancelled)
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self.primary() {
            Error::Driver(d) => d.sql.as_deref(),
            _ => None,
        }
    }

    /// Get SQLSTATE reported by the driver, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self.primary() {
            Error::Driver(d) => d.source.sqlstate.as_deref(),
            Error::Commit(c) => c.source.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Unsupported(e) => write!(f, "Unsupported operation: {}", e),
            Error::Hydration(e) => write!(f, "Hydration error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::PoolExhausted(e) => write!(f, "Pool exhausted: {}", e),
            Error::Driver(e) => write!(f, "Driver error: {}", e),
            Error::Commit(e) => write!(f, "Commit failed: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::Cardinality(e) => write!(f, "Cardinality error: {}", e),
            Error::State(e) => write!(f, "Invalid session state: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::WithCleanup { primary, cleanup } => {
                write!(f, "{} (cleanup also failed: {})", primary, cleanup)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => Some(&e.source),
            Error::Commit(e) => Some(&e.source),
            Error::WithCleanup { primary, .. } => Some(primary.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for UnsupportedOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl fmt::Display for HydrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} (column '{}'): {}",
            self.entity, self.field, self.column, self.message
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for PoolExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no connection available after {:?} (max {} connections)",
            self.waited, self.max_connections
        )
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl fmt::Display for DriverFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {:?} in '{}' is no longer at version {}",
            self.identity, self.table, self.expected_version
        )
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row {:?} in '{}'", self.identity, self.table)
    }
}

impl fmt::Display for CardinalityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.found == 0 {
            write!(f, "expected one row from '{}', found none", self.table)
        } else {
            write!(f, "expected one row from '{}', found several", self.table)
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} a session that is {}", self.operation, self.state)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<UnsupportedOperationError> for Error {
    fn from(err: UnsupportedOperationError) -> Self {
        Error::Unsupported(err)
    }
}

impl From<HydrationError> for Error {
    fn from(err: HydrationError) -> Self {
        Error::Hydration(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PoolExhaustedError> for Error {
    fn from(err: PoolExhaustedError) -> Self {
        Error::PoolExhausted(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

/// Result type alias for rowmap operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;
