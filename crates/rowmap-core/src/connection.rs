//! Driver and connection-provider traits.
//!
//! - [`Connection`] - one synchronous database connection, implemented by a driver
//! - [`ConnectionProvider`] - where sessions borrow connections from, usually a pool
//!
//! Every driver-level failure is a single [`DriverError`](crate::DriverError);
//! the session layer wraps it with context and never reinterprets it.

use crate::Result;
use crate::error::DriverResult;
use crate::row::RowCursor;
use crate::value::Value;
use std::time::Duration;

/// A synchronous database connection.
///
/// Statements use positional placeholders; `params` are bound in order.
///
/// # Example
///
/// ```rust,ignore
/// conn.begin()?;
/// conn.execute("UPDATE users SET name = $1 WHERE id = $2", &[Value::from("Ann"), Value::from(7_i64)])?;
/// conn.commit()?;
/// ```
pub trait Connection: Send {
    /// Run a query and return a cursor over its rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> DriverResult<RowCursor<'_>>;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<u64>;

    /// Execute an INSERT and return the generated key.
    fn insert(&mut self, sql: &str, params: &[Value]) -> DriverResult<i64>;

    /// Start a transaction.
    fn begin(&mut self) -> DriverResult<()>;

    fn commit(&mut self) -> DriverResult<()>;

    fn rollback(&mut self) -> DriverResult<()>;

    /// Check if the connection is still usable.
    fn ping(&mut self) -> DriverResult<()>;

    /// Alias for ping that returns bool.
    fn is_valid(&mut self) -> bool {
        self.ping().is_ok()
    }
}

/// Source of connections for sessions.
///
/// The only contract the session layer relies on is pairing: every
/// connection returned by `acquire` is handed back to `release` exactly once.
pub trait ConnectionProvider: Send + Sync {
    type Connection: Connection;

    /// Borrow a connection, waiting at most `timeout`.
    ///
    /// Fails with `Error::PoolExhausted` when the wait runs out.
    fn acquire(&self, timeout: Duration) -> Result<Self::Connection>;

    /// Return a connection previously obtained from `acquire`.
    fn release(&self, conn: Self::Connection);
}
