//! Sessions and transactions for rowmap.
//!
//! `rowmap-session` is the **unit-of-work layer**. A [`Session`] borrows one
//! pooled connection through a [`ConnectionLease`], runs one transaction on
//! it, and routes every entity operation through the statement builder and
//! the result mapper.
//!
//! # Lifecycle
//!
//! `Created → Active → {Committed | RolledBack | Failed} → Closed`, where
//! `Failed` follows a commit the driver rejected.
//!
//! The lease goes back to the provider exactly once however the session ends:
//! on commit, on rollback, on `close`, on cancellation, or when the session
//! is dropped. Dropping or closing an active session rolls it back first.
//!
//! # Example
//!
//! ```ignore
//! let db = Database::new(pool).with_config(SessionConfig::new().dialect(Dialect::Sqlite));
//!
//! let mut session = db.begin()?;
//! let mut user = session.find_by_id::<User>(7)?.expect("seeded");
//! user.name = "Annie".into();
//! session.update(&mut user)?; // optimistic when User has a version column
//! session.commit()?;
//! ```

pub mod cancel;
pub mod config;
pub mod database;
pub mod lease;

pub use cancel::CancelToken;
pub use config::SessionConfig;
pub use database::Database;
pub use lease::ConnectionLease;

use rowmap_core::diagnostics::{micros, redact};
use rowmap_core::{
    CardinalityError, CommitError, Connection, ConnectionProvider, DiagnosticEvent, Diagnostics,
    DriverResult, Entity, EntityMapping, EntityRegistry, Error, Hydrated, NotFoundError,
    OptimisticLockError, Result, SqlType, TransactionOutcome, Value,
};
use rowmap_query::{Filter, Statement, StatementBuilder};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not begun; holds no connection
    Created,
    /// Transaction open on a leased connection
    Active,
    Committed,
    RolledBack,
    /// Commit failed; durable state is unknown. `close` still moves it to `Closed`
    Failed,
    Closed,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled back",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

/// One unit of work: one lease, one transaction.
///
/// A session is `Send` but not `Sync`; it belongs to one thread of control
/// at a time and every operation takes `&mut self`.
pub struct Session<P: ConnectionProvider> {
    id: Arc<str>,
    provider: Arc<P>,
    registry: Arc<EntityRegistry>,
    config: SessionConfig,
    diagnostics: Diagnostics,
    cancel: CancelToken,
    lease: Option<ConnectionLease<P>>,
    state: SessionState,
    commit_failed: bool,
    began_at: Option<Instant>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<P: ConnectionProvider> Session<P> {
    /// Create a session. No connection is taken until [`Session::begin`].
    pub fn new(provider: Arc<P>, registry: Arc<EntityRegistry>, config: SessionConfig) -> Self {
        Self {
            id: Arc::from(uuid::Uuid::new_v4().simple().to_string()),
            provider,
            registry,
            config,
            diagnostics: Diagnostics::disabled(),
            cancel: CancelToken::new(),
            lease: None,
            state: SessionState::Created,
            commit_failed: false,
            began_at: None,
            _not_sync: PhantomData,
        }
    }

    /// Report events to `diagnostics`.
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Observe an existing cancel token instead of a fresh one.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Identifier used in logs and diagnostic events.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether the driver rejected this session's commit. Survives `close`.
    pub fn commit_failed(&self) -> bool {
        self.commit_failed
    }

    /// A handle that cancels this session when raised.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    /// Lease a connection and start the transaction.
    ///
    /// On `PoolExhausted` or a failed `BEGIN` the session holds nothing and
    /// stays `Created`, so `begin` may be retried.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn begin(&mut self) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(Error::state("begin", self.state.as_str()));
        }
        if let Err(err) = self.cancel.check() {
            self.state = SessionState::Closed;
            return Err(err);
        }

        let mut lease = ConnectionLease::acquire(
            Arc::clone(&self.provider),
            self.config.acquire_timeout_duration(),
            Arc::clone(&self.id),
            self.diagnostics.clone(),
        )?;

        if let Err(err) = lease.connection()?.begin() {
            lease.release();
            tracing::debug!(error = %err, "BEGIN failed; lease returned");
            return Err(Error::driver("begin transaction", err));
        }

        self.lease = Some(lease);
        self.began_at = Some(Instant::now());
        self.state = SessionState::Active;
        tracing::debug!("transaction started");
        Ok(())
    }

    /// Commit the transaction and return the lease.
    ///
    /// A driver failure here is `Error::Commit` and leaves the session
    /// `Failed` until it is closed; the caller decides whether to rerun the
    /// whole unit of work. If resetting the connection afterwards fails too,
    /// that failure is attached as the cleanup failure.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        self.checkpoint()?;

        let result = self.connection("commit")?.commit();
        let outcome = match result {
            Ok(()) => {
                self.state = SessionState::Committed;
                tracing::debug!("transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Failed;
                self.commit_failed = true;
                tracing::warn!(error = %err, "commit failed");
                let mut failure = Error::Commit(CommitError { source: err });
                // Leave no half-open transaction on a connection the pool will reuse.
                if let Ok(conn) = self.connection("reset") {
                    if let Err(reset) = conn.rollback() {
                        tracing::warn!(error = %reset, "rollback after failed commit also failed");
                        failure = failure
                            .with_cleanup(Error::driver("rollback after failed commit", reset));
                    }
                }
                Err(failure)
            }
        };
        self.finish_transaction(if outcome.is_ok() {
            TransactionOutcome::Committed
        } else {
            TransactionOutcome::CommitFailed
        });
        outcome
    }

    /// Roll the transaction back and return the lease.
    ///
    /// The lease is returned even when the rollback itself fails.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("roll back")?;
        let result = self.connection("rollback")?.rollback();
        self.state = SessionState::RolledBack;
        match result {
            Ok(()) => {
                tracing::debug!("transaction rolled back");
                self.finish_transaction(TransactionOutcome::RolledBack);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "rollback failed");
                self.finish_transaction(TransactionOutcome::RollbackFailed);
                Err(Error::driver("rollback transaction", err))
            }
        }
    }

    /// End the session. Idempotent.
    ///
    /// An active transaction is rolled back first; the lease is returned in
    /// every case, and a rollback failure is reported after the release.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn close(&mut self) -> Result<()> {
        let result = match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Active => self.rollback(),
            _ => Ok(()),
        };
        self.release_lease();
        self.state = SessionState::Closed;
        result
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Load one entity by identity.
    #[tracing::instrument(level = "debug", skip(self, id), fields(session = %self.id, table = E::TABLE_NAME))]
    pub fn find_by_id<E: Entity>(&mut self, id: impl Into<Value>) -> Result<Option<E>> {
        let mapping = self.mapping::<E>()?;
        let stmt = self.builder(&mapping).select_by_id(id.into())?;
        let mut rows = self.query::<E>(&stmt, mapping)?;
        rows.next().transpose()
    }

    /// Load every row of the entity's table.
    pub fn find_all<E: Entity>(&mut self) -> Result<Vec<E>> {
        self.find_all_by(&Filter::new())
    }

    /// Load every entity matching `filter`.
    #[tracing::instrument(level = "debug", skip(self, filter), fields(session = %self.id, table = E::TABLE_NAME))]
    pub fn find_all_by<E: Entity>(&mut self, filter: &Filter) -> Result<Vec<E>> {
        self.stream(filter)?.collect()
    }

    /// Lazily hydrate the entities matching `filter`.
    ///
    /// The returned iterator borrows the session; rows are read and hydrated
    /// one at a time as it is advanced.
    pub fn stream<E: Entity>(&mut self, filter: &Filter) -> Result<Hydrated<'_, E>> {
        let mapping = self.mapping::<E>()?;
        let stmt = self.builder(&mapping).select_where(filter, None)?;
        self.query::<E>(&stmt, mapping)
    }

    /// First entity matching `filter`, if any.
    pub fn find_first_by<E: Entity>(&mut self, filter: &Filter) -> Result<Option<E>> {
        let mapping = self.mapping::<E>()?;
        let stmt = self.builder(&mapping).select_where(filter, Some(1))?;
        let mut rows = self.query::<E>(&stmt, mapping)?;
        rows.next().transpose()
    }

    /// The single entity matching `filter`.
    ///
    /// Fails with `Error::Cardinality` when no row or more than one row matches.
    pub fn find_one_by<E: Entity>(&mut self, filter: &Filter) -> Result<E> {
        let mapping = self.mapping::<E>()?;
        let stmt = self.builder(&mapping).select_where(filter, Some(2))?;
        let mut rows = self.query::<E>(&stmt, mapping)?;
        let first = rows.next().transpose()?;
        let second = rows.next().transpose()?;
        match (first, second) {
            (Some(entity), None) => Ok(entity),
            (None, _) => Err(Error::Cardinality(CardinalityError {
                table: E::TABLE_NAME,
                found: 0,
            })),
            (Some(_), Some(_)) => Err(Error::Cardinality(CardinalityError {
                table: E::TABLE_NAME,
                found: 2,
            })),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert `entity`, writing back a generated identity.
    ///
    /// A generated integer identity comes from the driver's generated key; a
    /// generated UUID identity is created here before the insert.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(session = %self.id, table = E::TABLE_NAME))]
    pub fn insert<E: Entity>(&mut self, entity: &mut E) -> Result<()> {
        let mapping = self.mapping::<E>()?;
        let identity = mapping.identity();
        let index = mapping.identity_index();
        let mut values = entity.to_values();

        let needs_identity =
            identity.generated && values.get(index).is_some_and(Value::is_null);
        let library_uuid = needs_identity && identity.sql_type == SqlType::Uuid;
        if library_uuid {
            values[index] = Value::from(uuid::Uuid::new_v4());
        }

        let stmt = self.builder(&mapping).insert(&values)?;
        if needs_identity && !library_uuid {
            let key = self.run(
                &stmt,
                mapping.table(),
                |conn, sql, binds| conn.insert(sql, binds),
                |_| Some(1),
            )?;
            tracing::trace!(generated_key = key, "identity assigned by the database");
            entity.assign(identity.field, &Value::BigInt(key))
        } else {
            self.execute(&stmt, mapping.table())?;
            if library_uuid {
                entity.assign(identity.field, &values[index])?;
            }
            Ok(())
        }
    }

    /// Update `entity`, checking its current version when the entity is versioned.
    pub fn update<E: Entity>(&mut self, entity: &mut E) -> Result<()> {
        self.update_inner(entity, None)
    }

    /// Update `entity`, requiring the stored row to be at `expected_version`.
    pub fn update_expecting<E: Entity>(&mut self, entity: &mut E, expected_version: i64) -> Result<()> {
        self.update_inner(entity, Some(expected_version))
    }

    #[tracing::instrument(level = "debug", skip(self, entity), fields(session = %self.id, table = E::TABLE_NAME))]
    fn update_inner<E: Entity>(&mut self, entity: &mut E, expected: Option<i64>) -> Result<()> {
        let mapping = self.mapping::<E>()?;
        let values = entity.to_values();
        let stmt = self.builder(&mapping).update(&values, expected)?;
        let affected = self.execute(&stmt, mapping.table())?;
        let identity = values[mapping.identity_index()].clone();

        let Some(version) = mapping.version() else {
            return if affected == 0 {
                Err(Error::NotFound(NotFoundError {
                    table: E::TABLE_NAME,
                    identity,
                }))
            } else {
                Ok(())
            };
        };

        let expected = expected
            .or_else(|| mapping.version_index().and_then(|i| values[i].as_i64()))
            .unwrap_or_default();
        if affected == 0 {
            tracing::debug!(expected_version = expected, "stale version; update rejected");
            return Err(Error::OptimisticLock(OptimisticLockError {
                table: E::TABLE_NAME,
                identity,
                expected_version: expected,
            }));
        }
        entity.assign(version.field, &Value::BigInt(expected.saturating_add(1)))
    }

    /// Persist `entity` whether or not it exists yet.
    ///
    /// An entity without an identity value is inserted. A versioned entity
    /// with one is updated under its version check; any other entity is
    /// upserted on its identity.
    pub fn save<E: Entity>(&mut self, entity: &mut E) -> Result<()> {
        let mapping = self.mapping::<E>()?;
        let values = entity.to_values();
        let has_identity = values
            .get(mapping.identity_index())
            .is_some_and(|v| !v.is_null());
        if !has_identity {
            self.insert(entity)
        } else if mapping.is_versioned() {
            self.update(entity)
        } else {
            let stmt = self.builder(&mapping).upsert(&values)?;
            self.execute(&stmt, mapping.table())?;
            Ok(())
        }
    }

    /// Delete `entity` by identity, checking its version when versioned.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(session = %self.id, table = E::TABLE_NAME))]
    pub fn delete<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let mapping = self.mapping::<E>()?;
        let values = entity.to_values();
        let identity = values
            .get(mapping.identity_index())
            .cloned()
            .unwrap_or(Value::Null);
        let expected = match mapping.version_index() {
            Some(index) => Some(values.get(index).and_then(Value::as_i64).ok_or_else(|| {
                Error::unsupported("delete", "version field does not hold an integer")
            })?),
            None => None,
        };
        let stmt = self.builder(&mapping).delete(identity.clone(), expected)?;
        let affected = self.execute(&stmt, mapping.table())?;
        if affected > 0 {
            return Ok(());
        }
        Err(match expected {
            Some(expected_version) => Error::OptimisticLock(OptimisticLockError {
                table: E::TABLE_NAME,
                identity,
                expected_version,
            }),
            None => Error::NotFound(NotFoundError {
                table: E::TABLE_NAME,
                identity,
            }),
        })
    }

    /// Delete the row with identity `id`, without a version check.
    pub fn delete_by_id<E: Entity>(&mut self, id: impl Into<Value>) -> Result<()> {
        let mapping = self.mapping::<E>()?;
        let identity = id.into();
        let stmt = self.builder(&mapping).delete(identity.clone(), None)?;
        let affected = self.execute(&stmt, mapping.table())?;
        if affected == 0 {
            return Err(Error::NotFound(NotFoundError {
                table: E::TABLE_NAME,
                identity,
            }));
        }
        Ok(())
    }

    /// Delete every row matching `filter`; returns the number deleted.
    pub fn delete_where<E: Entity>(&mut self, filter: &Filter) -> Result<u64> {
        let mapping = self.mapping::<E>()?;
        let stmt = self.builder(&mapping).delete_where(filter)?;
        self.execute(&stmt, mapping.table())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn mapping<E: Entity>(&self) -> Result<Arc<EntityMapping>> {
        self.registry.mapping_for::<E>()
    }

    fn builder<'m>(&self, mapping: &'m EntityMapping) -> StatementBuilder<'m> {
        StatementBuilder::new(mapping).dialect(self.config.dialect)
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(Error::state(operation, self.state.as_str()))
        }
    }

    fn connection(&mut self, operation: &'static str) -> Result<&mut P::Connection> {
        match self.lease.as_mut() {
            Some(lease) => lease.connection(),
            None => Err(Error::state(operation, self.state.as_str())),
        }
    }

    /// Cancellation checkpoint: once the token is raised, roll back, close
    /// and fail with `Error::Cancelled`.
    fn checkpoint(&mut self) -> Result<()> {
        let Err(mut err) = self.cancel.check() else {
            return Ok(());
        };
        tracing::info!(session = %self.id, "cancellation observed; rolling back");
        if let Err(cleanup) = self.close() {
            err = err.with_cleanup(cleanup);
        }
        Err(err)
    }

    fn release_lease(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
    }

    fn finish_transaction(&mut self, outcome: TransactionOutcome) {
        let elapsed = self.began_at.take().map(|t| t.elapsed()).unwrap_or_default();
        self.diagnostics.emit(|| DiagnosticEvent::TransactionFinished {
            session: self.id.to_string(),
            outcome,
            elapsed_us: micros(elapsed),
        });
        self.release_lease();
    }

    fn record_statement(&self, stmt: &Statement, table: &'static str, elapsed_us: u64, rows: Option<u64>, ok: bool) {
        self.diagnostics.emit(|| DiagnosticEvent::StatementExecuted {
            session: self.id.to_string(),
            operation: stmt.kind.as_str(),
            table,
            sql: stmt.sql.clone(),
            bind_types: redact(&stmt.binds),
            elapsed_us,
            rows,
            ok,
        });
    }

    fn execute(&mut self, stmt: &Statement, table: &'static str) -> Result<u64> {
        self.run(stmt, table, |conn, sql, binds| conn.execute(sql, binds), |n| Some(*n))
    }

    /// One non-query round trip.
    fn run<T>(
        &mut self,
        stmt: &Statement,
        table: &'static str,
        call: impl FnOnce(&mut P::Connection, &str, &[Value]) -> DriverResult<T>,
        rows: impl FnOnce(&T) -> Option<u64>,
    ) -> Result<T> {
        self.ensure_active(stmt.kind.as_str())?;
        self.checkpoint()?;
        let started = Instant::now();
        let result = call(self.connection(stmt.kind.as_str())?, &stmt.sql, &stmt.binds);
        let elapsed = micros(started.elapsed());
        match result {
            Ok(value) => {
                tracing::trace!(sql = %stmt.sql, binds = stmt.binds.len(), elapsed_us = elapsed, "statement executed");
                self.record_statement(stmt, table, elapsed, rows(&value), true);
                Ok(value)
            }
            Err(err) => {
                self.record_statement(stmt, table, elapsed, None, false);
                Err(Error::driver_with_sql(
                    format!("{} on {}", stmt.kind.as_str(), table),
                    stmt.sql.clone(),
                    err,
                ))
            }
        }
    }

    /// One query round trip, hydrated lazily.
    fn query<E: Entity>(&mut self, stmt: &Statement, mapping: Arc<EntityMapping>) -> Result<Hydrated<'_, E>> {
        self.ensure_active(stmt.kind.as_str())?;
        self.checkpoint()?;
        let started = Instant::now();
        let Some(lease) = self.lease.as_mut() else {
            return Err(Error::state(stmt.kind.as_str(), self.state.as_str()));
        };
        let result = lease.connection()?.query(&stmt.sql, &stmt.binds);
        let elapsed = micros(started.elapsed());
        let ok = result.is_ok();
        self.diagnostics.emit(|| DiagnosticEvent::StatementExecuted {
            session: self.id.to_string(),
            operation: stmt.kind.as_str(),
            table: mapping.table(),
            sql: stmt.sql.clone(),
            bind_types: redact(&stmt.binds),
            elapsed_us: elapsed,
            rows: None,
            ok,
        });
        match result {
            Ok(cursor) => {
                tracing::trace!(sql = %stmt.sql, binds = stmt.binds.len(), elapsed_us = elapsed, "query executed");
                Ok(Hydrated::new(cursor, mapping))
            }
            Err(err) => Err(Error::driver_with_sql(
                format!("{} on {}", stmt.kind.as_str(), mapping.table()),
                stmt.sql.clone(),
                err,
            )),
        }
    }
}

impl<P: ConnectionProvider> Drop for Session<P> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(session = %self.id, error = %err, "session dropped with a failed rollback");
        }
    }
}

impl<P: ConnectionProvider> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("commit_failed", &self.commit_failed)
            .field("leased", &self.lease.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rowmap_core::{
        DriverError, FieldInfo, FromValue, PoolExhaustedError, Record, Row, RowCursor,
        unknown_field,
    };
    use rowmap_query::Col;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// What a [`MockConnection`] saw and what it will answer.
    #[derive(Default)]
    pub(crate) struct Script {
        pub(crate) log: Vec<String>,
        pub(crate) binds: Vec<Vec<Value>>,
        pub(crate) results: VecDeque<Vec<Row>>,
        pub(crate) affected: VecDeque<u64>,
        pub(crate) next_key: i64,
        pub(crate) fail_begin: bool,
        pub(crate) fail_commit: bool,
        pub(crate) fail_rollback: bool,
        pub(crate) fail_execute: bool,
    }

    /// Scripted driver connection; clones share one script.
    #[derive(Clone, Default)]
    pub(crate) struct MockConnection {
        script: Arc<Mutex<Script>>,
    }

    impl MockConnection {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
            f(&mut self.script.lock())
        }

        pub(crate) fn log(&self) -> Vec<String> {
            self.script.lock().log.clone()
        }

        pub(crate) fn last_binds(&self) -> Vec<Value> {
            self.script.lock().binds.last().cloned().unwrap_or_default()
        }

        fn record(&self, sql: &str, params: &[Value]) {
            let mut script = self.script.lock();
            script.log.push(sql.to_string());
            script.binds.push(params.to_vec());
        }

        fn control(&self, word: &str, fail: impl FnOnce(&Script) -> bool) -> DriverResult<()> {
            let mut script = self.script.lock();
            script.log.push(word.to_string());
            if fail(&script) {
                Err(DriverError::new(format!("{word} refused")).with_sqlstate("40001"))
            } else {
                Ok(())
            }
        }
    }

    impl Connection for MockConnection {
        fn query(&mut self, sql: &str, params: &[Value]) -> DriverResult<RowCursor<'_>> {
            self.record(sql, params);
            let rows = self.script.lock().results.pop_front().unwrap_or_default();
            Ok(RowCursor::from_rows(rows))
        }

        fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<u64> {
            self.record(sql, params);
            let mut script = self.script.lock();
            if script.fail_execute {
                return Err(DriverError::new("constraint violated").with_sqlstate("23505"));
            }
            Ok(script.affected.pop_front().unwrap_or(1))
        }

        fn insert(&mut self, sql: &str, params: &[Value]) -> DriverResult<i64> {
            self.record(sql, params);
            let mut script = self.script.lock();
            script.next_key += 1;
            Ok(script.next_key)
        }

        fn begin(&mut self) -> DriverResult<()> {
            self.control("BEGIN", |s| s.fail_begin)
        }

        fn commit(&mut self) -> DriverResult<()> {
            self.control("COMMIT", |s| s.fail_commit)
        }

        fn rollback(&mut self) -> DriverResult<()> {
            self.control("ROLLBACK", |s| s.fail_rollback)
        }

        fn ping(&mut self) -> DriverResult<()> {
            Ok(())
        }
    }

    /// Provider handing out clones of one mock connection and counting leases.
    pub(crate) struct CountingProvider {
        conn: MockConnection,
        acquired: AtomicUsize,
        released: AtomicUsize,
        exhausted: AtomicBool,
    }

    impl CountingProvider {
        pub(crate) fn new(conn: MockConnection) -> Self {
            Self {
                conn,
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                exhausted: AtomicBool::new(false),
            }
        }

        /// Connections currently leased out.
        pub(crate) fn live(&self) -> usize {
            self.acquired.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
        }

        pub(crate) fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        pub(crate) fn set_exhausted(&self, exhausted: bool) {
            self.exhausted.store(exhausted, Ordering::SeqCst);
        }
    }

    impl ConnectionProvider for CountingProvider {
        type Connection = MockConnection;

        fn acquire(&self, timeout: Duration) -> Result<MockConnection> {
            if self.exhausted.load(Ordering::SeqCst) {
                return Err(Error::PoolExhausted(PoolExhaustedError {
                    waited: timeout,
                    max_connections: 1,
                }));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(self.conn.clone())
        }

        fn release(&self, _conn: MockConnection) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct User {
        pub(crate) id: i64,
        pub(crate) name: String,
        pub(crate) version: i64,
    }

    impl Entity for User {
        const TABLE_NAME: &'static str = "users";

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: [FieldInfo; 3] = [
                FieldInfo::new("id", "id", SqlType::BigInt).identity(true),
                FieldInfo::new("name", "name", SqlType::Text),
                FieldInfo::new("version", "version", SqlType::BigInt).version(true),
            ];
            &FIELDS
        }

        fn to_values(&self) -> Vec<Value> {
            vec![
                Value::from(self.id),
                Value::from(self.name.clone()),
                Value::from(self.version),
            ]
        }

        fn from_record(record: &Record<'_>) -> Result<Self> {
            Ok(Self {
                id: record.get("id")?,
                name: record.get("name")?,
                version: record.get("version")?,
            })
        }

        fn assign(&mut self, field: &str, value: &Value) -> Result<()> {
            match field {
                "id" => self.id = i64::from_value(value)?,
                "name" => self.name = String::from_value(value)?,
                "version" => self.version = i64::from_value(value)?,
                _ => return Err(unknown_field::<Self>(field)),
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        id: Option<i64>,
        body: String,
    }

    impl Entity for Note {
        const TABLE_NAME: &'static str = "notes";

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: [FieldInfo; 2] = [
                FieldInfo::new("id", "id", SqlType::BigInt)
                    .nullable(true)
                    .identity(true)
                    .generated(true),
                FieldInfo::new("body", "body", SqlType::Text),
            ];
            &FIELDS
        }

        fn to_values(&self) -> Vec<Value> {
            vec![Value::from(self.id), Value::from(self.body.clone())]
        }

        fn from_record(record: &Record<'_>) -> Result<Self> {
            Ok(Self {
                id: record.get("id")?,
                body: record.get("body")?,
            })
        }

        fn assign(&mut self, field: &str, value: &Value) -> Result<()> {
            match field {
                "id" => self.id = Option::<i64>::from_value(value)?,
                "body" => self.body = String::from_value(value)?,
                _ => return Err(unknown_field::<Self>(field)),
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Token {
        id: Option<uuid::Uuid>,
        label: String,
    }

    impl Entity for Token {
        const TABLE_NAME: &'static str = "tokens";

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: [FieldInfo; 2] = [
                FieldInfo::new("id", "id", SqlType::Uuid)
                    .nullable(true)
                    .identity(true)
                    .generated(true),
                FieldInfo::new("label", "label", SqlType::Text),
            ];
            &FIELDS
        }

        fn to_values(&self) -> Vec<Value> {
            vec![Value::from(self.id), Value::from(self.label.clone())]
        }

        fn from_record(record: &Record<'_>) -> Result<Self> {
            Ok(Self {
                id: record.get("id")?,
                label: record.get("label")?,
            })
        }

        fn assign(&mut self, field: &str, value: &Value) -> Result<()> {
            match field {
                "id" => self.id = Option::<uuid::Uuid>::from_value(value)?,
                "label" => self.label = String::from_value(value)?,
                _ => return Err(unknown_field::<Self>(field)),
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Tag {
        id: i64,
        label: String,
    }

    impl Entity for Tag {
        const TABLE_NAME: &'static str = "tags";

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: [FieldInfo; 2] = [
                FieldInfo::new("id", "id", SqlType::BigInt).identity(true),
                FieldInfo::new("label", "label", SqlType::Text),
            ];
            &FIELDS
        }

        fn to_values(&self) -> Vec<Value> {
            vec![Value::from(self.id), Value::from(self.label.clone())]
        }

        fn from_record(record: &Record<'_>) -> Result<Self> {
            Ok(Self {
                id: record.get("id")?,
                label: record.get("label")?,
            })
        }

        fn assign(&mut self, field: &str, value: &Value) -> Result<()> {
            match field {
                "id" => self.id = i64::from_value(value)?,
                "label" => self.label = String::from_value(value)?,
                _ => return Err(unknown_field::<Self>(field)),
            }
            Ok(())
        }
    }

    pub(crate) fn user_row(id: i64, name: &str, version: i64) -> Row {
        Row::new(
            vec!["id".into(), "name".into(), "version".into()],
            vec![Value::BigInt(id), Value::Text(name.into()), Value::BigInt(version)],
        )
    }

    fn setup() -> (MockConnection, Arc<CountingProvider>, Session<CountingProvider>) {
        let conn = MockConnection::new();
        let provider = Arc::new(CountingProvider::new(conn.clone()));
        let session = Session::new(
            Arc::clone(&provider),
            Arc::new(EntityRegistry::new()),
            SessionConfig::default(),
        );
        (conn, provider, session)
    }

    #[test]
    fn session_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Session<CountingProvider>>();
    }

    #[test]
    fn begin_commit_returns_the_lease() {
        let (conn, provider, mut session) = setup();
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(provider.live(), 0);

        session.begin().unwrap();
        assert!(session.is_active());
        assert_eq!(provider.live(), 1);

        session.commit().unwrap();
        assert_eq!(session.state(), SessionState::Committed);
        assert_eq!(provider.live(), 0);
        assert_eq!(conn.log(), ["BEGIN", "COMMIT"]);

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(provider.released(), 1);
    }

    #[test]
    fn operations_require_an_active_session() {
        let (_, _, mut session) = setup();
        let err = session.find_by_id::<User>(1_i64).unwrap_err();
        assert!(matches!(err, Error::State(e) if e.state == "created"));
        assert!(matches!(session.commit(), Err(Error::State(_))));

        session.begin().unwrap();
        assert!(matches!(session.begin(), Err(Error::State(_))));
    }

    #[test]
    fn exhausted_provider_leaves_session_created() {
        let (_, provider, mut session) = setup();
        provider.set_exhausted(true);
        let err = session.begin().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Created);

        provider.set_exhausted(false);
        session.begin().unwrap();
        assert!(session.is_active());
    }

    #[test]
    fn failed_begin_returns_the_lease() {
        let (conn, provider, mut session) = setup();
        conn.with(|s| s.fail_begin = true);
        assert!(matches!(session.begin(), Err(Error::Driver(_))));
        assert_eq!(provider.live(), 0);
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn find_by_id_hydrates_one_row() {
        let (conn, _, mut session) = setup();
        conn.with(|s| s.results.push_back(vec![user_row(7, "Ann", 1)]));
        session.begin().unwrap();

        let user = session.find_by_id::<User>(7_i64).unwrap();
        assert_eq!(
            user,
            Some(User {
                id: 7,
                name: "Ann".into(),
                version: 1
            })
        );
        assert_eq!(
            conn.log()[1],
            "SELECT id, name, version FROM users WHERE id = $1"
        );
        assert_eq!(conn.last_binds(), vec![Value::BigInt(7)]);

        assert_eq!(session.find_by_id::<User>(8_i64).unwrap(), None);
    }

    #[test]
    fn find_one_by_checks_cardinality() {
        let (conn, _, mut session) = setup();
        conn.with(|s| {
            s.results.push_back(vec![]);
            s.results
                .push_back(vec![user_row(1, "Ann", 1), user_row(2, "Ann", 1)]);
            s.results.push_back(vec![user_row(1, "Ann", 1)]);
        });
        session.begin().unwrap();
        let filter = Filter::from(Col::new("name").eq("Ann"));

        let err = session.find_one_by::<User>(&filter).unwrap_err();
        assert!(matches!(err, Error::Cardinality(e) if e.found == 0));
        let err = session.find_one_by::<User>(&filter).unwrap_err();
        assert!(matches!(err, Error::Cardinality(e) if e.found == 2));
        assert_eq!(session.find_one_by::<User>(&filter).unwrap().id, 1);
        assert!(conn.log()[1].ends_with("WHERE name = $1 LIMIT 2"));
    }

    #[test]
    fn stream_and_find_all_by() {
        let (conn, _, mut session) = setup();
        conn.with(|s| {
            s.results
                .push_back(vec![user_row(1, "Ann", 1), user_row(2, "Bo", 3)]);
            s.results.push_back(vec![user_row(3, "Cy", 1)]);
        });
        session.begin().unwrap();

        let mut stream = session.stream::<User>(&Filter::new()).unwrap();
        assert_eq!(stream.next().unwrap().unwrap().name, "Ann");
        assert_eq!(stream.rows_read(), 1);
        assert_eq!(stream.next().unwrap().unwrap().version, 3);
        assert!(stream.next().is_none());
        drop(stream);

        let users = session
            .find_all_by::<User>(&Col::new("id").gt(2_i64).into())
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(conn.log()[1], "SELECT id, name, version FROM users");
    }

    #[test]
    fn stale_update_is_an_optimistic_lock_failure() {
        let (conn, _, mut session) = setup();
        conn.with(|s| s.affected.extend([1, 0]));
        session.begin().unwrap();

        let mut user = User {
            id: 7,
            name: "Annie".into(),
            version: 1,
        };
        session.update(&mut user).unwrap();
        assert_eq!(user.version, 2);
        assert_eq!(
            conn.log()[1],
            "UPDATE users SET name = $1, version = $2 WHERE id = $3 AND version = $4"
        );
        assert_eq!(
            conn.last_binds(),
            vec![
                Value::Text("Annie".into()),
                Value::BigInt(2),
                Value::BigInt(7),
                Value::BigInt(1)
            ]
        );

        let mut stale = User {
            id: 7,
            name: "Ann B".into(),
            version: 1,
        };
        let err = session.update(&mut stale).unwrap_err();
        assert!(err.is_optimistic_lock());
        assert!(err.is_transaction_failure());
        match err {
            Error::OptimisticLock(e) => {
                assert_eq!(e.table, "users");
                assert_eq!(e.identity, Value::BigInt(7));
                assert_eq!(e.expected_version, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stale.version, 1);
        assert!(session.is_active());
    }

    #[test]
    fn update_expecting_uses_the_given_version() {
        let (conn, _, mut session) = setup();
        session.begin().unwrap();
        let mut user = User {
            id: 7,
            name: "Ann".into(),
            version: 9,
        };
        session.update_expecting(&mut user, 4).unwrap();
        assert_eq!(user.version, 5);
        assert_eq!(conn.last_binds()[3], Value::BigInt(4));
    }

    #[test]
    fn unversioned_update_of_missing_row_is_not_found() {
        let (conn, _, mut session) = setup();
        conn.with(|s| s.affected.push_back(0));
        session.begin().unwrap();
        let mut tag = Tag {
            id: 3,
            label: "x".into(),
        };
        let err = session.update(&mut tag).unwrap_err();
        assert!(matches!(err, Error::NotFound(e) if e.identity == Value::BigInt(3)));
    }

    #[test]
    fn insert_writes_back_generated_keys() {
        let (conn, _, mut session) = setup();
        conn.with(|s| s.next_key = 41);
        session.begin().unwrap();

        let mut note = Note {
            id: None,
            body: "hello".into(),
        };
        session.insert(&mut note).unwrap();
        assert_eq!(note.id, Some(42));
        assert_eq!(conn.log()[1], "INSERT INTO notes (body) VALUES ($1)");

        let mut token = Token {
            id: None,
            label: "api".into(),
        };
        session.insert(&mut token).unwrap();
        let id = token.id.expect("uuid assigned");
        assert_eq!(conn.log()[2], "INSERT INTO tokens (id, label) VALUES ($1, $2)");
        assert_eq!(conn.last_binds()[0], Value::from(id));
    }

    #[test]
    fn save_picks_insert_update_or_upsert() {
        let (conn, _, mut session) = setup();
        session.begin().unwrap();

        let mut note = Note {
            id: None,
            body: "new".into(),
        };
        session.save(&mut note).unwrap();
        assert!(conn.log()[1].starts_with("INSERT INTO notes"));

        let mut user = User {
            id: 1,
            name: "Ann".into(),
            version: 1,
        };
        session.save(&mut user).unwrap();
        assert!(conn.log()[2].starts_with("UPDATE users"));
        assert_eq!(user.version, 2);

        let mut tag = Tag {
            id: 5,
            label: "rust".into(),
        };
        session.save(&mut tag).unwrap();
        assert_eq!(
            conn.log()[3],
            "INSERT INTO tags (id, label) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET label = EXCLUDED.label"
        );
    }

    #[test]
    fn deletes_report_missing_rows() {
        let (conn, _, mut session) = setup();
        conn.with(|s| s.affected.extend([0, 0, 3]));
        session.begin().unwrap();

        let user = User {
            id: 7,
            name: "Ann".into(),
            version: 2,
        };
        assert!(session.delete(&user).unwrap_err().is_optimistic_lock());
        assert_eq!(conn.log()[1], "DELETE FROM users WHERE id = $1 AND version = $2");

        let err = session.delete_by_id::<Tag>(9_i64).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let removed = session
            .delete_where::<Tag>(&Col::new("label").like("tmp%").into())
            .unwrap();
        assert_eq!(removed, 3);
        assert!(matches!(
            session.delete_where::<Tag>(&Filter::new()),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn driver_failure_keeps_sql_and_session() {
        let (conn, _, mut session) = setup();
        conn.with(|s| s.fail_execute = true);
        session.begin().unwrap();
        let err = session.delete_by_id::<Tag>(1_i64).unwrap_err();
        assert_eq!(err.sql(), Some("DELETE FROM tags WHERE id = $1"));
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(session.is_active());
    }

    #[test]
    fn commit_failure_is_terminal() {
        let (conn, provider, mut session) = setup();
        conn.with(|s| s.fail_commit = true);
        session.begin().unwrap();

        let err = session.commit().unwrap_err();
        assert!(matches!(err, Error::Commit(_)));
        assert!(err.is_transaction_failure());
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(provider.live(), 0);
        assert_eq!(conn.log(), ["BEGIN", "COMMIT", "ROLLBACK"]);

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.commit_failed());
        assert!(matches!(session.begin(), Err(Error::State(_))));
        assert_eq!(provider.released(), 1);
    }

    #[test]
    fn failed_reset_after_commit_failure_is_attached() {
        let (conn, provider, mut session) = setup();
        conn.with(|s| {
            s.fail_commit = true;
            s.fail_rollback = true;
        });
        session.begin().unwrap();

        let err = session.commit().unwrap_err();
        assert!(matches!(err.primary(), Error::Commit(_)));
        assert!(err.is_transaction_failure());
        assert!(matches!(err.cleanup_failure(), Some(Error::Driver(_))));
        assert_eq!(conn.log(), ["BEGIN", "COMMIT", "ROLLBACK"]);
        assert_eq!(provider.live(), 0);
        assert_eq!(provider.released(), 1);
    }

    #[test]
    fn close_is_idempotent_and_rolls_back() {
        let (conn, provider, mut session) = setup();
        session.begin().unwrap();
        for _ in 0..3 {
            session.close().unwrap();
        }
        assert_eq!(provider.live(), 0);
        assert_eq!(provider.released(), 1);
        assert_eq!(conn.log(), ["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn failed_rollback_still_releases() {
        let (conn, provider, mut session) = setup();
        conn.with(|s| s.fail_rollback = true);
        session.begin().unwrap();
        assert!(matches!(session.close(), Err(Error::Driver(_))));
        assert_eq!(provider.live(), 0);
        assert_eq!(session.state(), SessionState::Closed);
        session.close().unwrap();
    }

    #[test]
    fn drop_rolls_back_an_open_transaction() {
        let (conn, provider, mut session) = setup();
        session.begin().unwrap();
        drop(session);
        assert_eq!(provider.live(), 0);
        assert_eq!(conn.log(), ["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn cancellation_rolls_back_at_the_next_round_trip() {
        let (conn, provider, mut session) = setup();
        let token = session.cancel_token();
        session.begin().unwrap();
        token.cancel();

        let err = session.find_by_id::<User>(1_i64).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(provider.live(), 0);
        assert_eq!(conn.log(), ["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn cancellation_before_begin() {
        let (_, provider, session) = setup();
        let token = CancelToken::new();
        let mut session = session.with_cancel_token(token.clone());
        token.cancel();
        assert!(session.begin().unwrap_err().is_cancelled());
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn cancellation_with_failed_rollback_carries_both() {
        let (conn, _, mut session) = setup();
        conn.with(|s| s.fail_rollback = true);
        session.begin().unwrap();
        session.cancel_token().cancel();
        let err = session.commit().unwrap_err();
        assert!(err.is_cancelled());
        assert!(matches!(err.cleanup_failure(), Some(Error::Driver(_))));
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<DiagnosticEvent>>);

    impl rowmap_core::DiagnosticSink for Collect {
        fn record(&self, event: &DiagnosticEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn diagnostics_never_carry_bind_values() {
        let (conn, _, session) = setup();
        conn.with(|s| s.results.push_back(vec![user_row(7, "Ann", 1)]));
        let sink = Arc::new(Collect::default());
        let mut session = session.with_diagnostics(Diagnostics::new(sink.clone()));

        session.begin().unwrap();
        session
            .find_all_by::<User>(&Col::new("name").eq("secret-name").into())
            .unwrap();
        session.commit().unwrap();

        let events = sink.0.lock();
        assert!(matches!(events[0], DiagnosticEvent::LeaseAcquired { .. }));
        match &events[1] {
            DiagnosticEvent::StatementExecuted {
                operation,
                table,
                bind_types,
                ok,
                ..
            } => {
                assert_eq!(*operation, "select_where");
                assert_eq!(*table, "users");
                assert_eq!(bind_types, &vec!["TEXT"]);
                assert!(*ok);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events[2],
            DiagnosticEvent::TransactionFinished {
                outcome: TransactionOutcome::Committed,
                ..
            }
        ));
        assert!(matches!(events[3], DiagnosticEvent::LeaseReleased { .. }));
        let json = serde_json::to_string(&*events).unwrap();
        assert!(!json.contains("secret-name"));
    }
}
