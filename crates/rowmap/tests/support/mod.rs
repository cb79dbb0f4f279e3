//! SQLite driver used by the integration tests.

#![allow(dead_code)]

use rowmap::prelude::*;
use rowmap::EntityRegistry;
use rusqlite::types::{Value as SqlValue, ValueRef};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One rusqlite connection behind the rowmap `Connection` trait.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

fn driver_error(e: rusqlite::Error) -> DriverError {
    let code = match &e {
        rusqlite::Error::SqliteFailure(err, _) => Some(err.extended_code.to_string()),
        _ => None,
    };
    let mut error = DriverError::new(e.to_string());
    if let Some(code) = code {
        error = error.with_sqlstate(code);
    }
    error.with_source(e)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::SmallInt(v) => SqlValue::Integer(i64::from(*v)),
        Value::Int(v) => SqlValue::Integer(i64::from(*v)),
        Value::BigInt(v) | Value::Time(v) | Value::Timestamp(v) => SqlValue::Integer(*v),
        Value::Date(v) => SqlValue::Integer(i64::from(*v)),
        Value::Float(v) => SqlValue::Real(f64::from(*v)),
        Value::Double(v) => SqlValue::Real(*v),
        Value::Decimal(s) | Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Uuid(bytes) => SqlValue::Blob(bytes.to_vec()),
        Value::Json(j) => SqlValue::Text(j.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::BigInt(i),
        ValueRef::Real(f) => Value::Double(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

impl SqliteConnection {
    pub fn open(path: &Path) -> DriverResult<Self> {
        let conn = rusqlite::Connection::open(path).map_err(driver_error)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(driver_error)?;
        Ok(Self { conn })
    }

    fn batch(&mut self, sql: &str) -> DriverResult<()> {
        self.conn.execute_batch(sql).map_err(driver_error)
    }
}

impl Connection for SqliteConnection {
    fn query(&mut self, sql: &str, params: &[Value]) -> DriverResult<RowCursor<'_>> {
        let mut stmt = self.conn.prepare(sql).map_err(driver_error)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();
        let count = names.len();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter().map(to_sql)))
            .map_err(driver_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(driver_error)? {
            let mut values = Vec::with_capacity(count);
            for i in 0..count {
                values.push(from_sql(row.get_ref(i).map_err(driver_error)?));
            }
            out.push(Row::new(names.clone(), values));
        }
        Ok(RowCursor::from_rows(out))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<u64> {
        let n = self
            .conn
            .execute(sql, rusqlite::params_from_iter(params.iter().map(to_sql)))
            .map_err(driver_error)?;
        Ok(u64::try_from(n).unwrap_or(u64::MAX))
    }

    fn insert(&mut self, sql: &str, params: &[Value]) -> DriverResult<i64> {
        self.execute(sql, params)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn begin(&mut self) -> DriverResult<()> {
        self.batch("BEGIN")
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.batch("COMMIT")
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.batch("ROLLBACK")
    }

    fn ping(&mut self) -> DriverResult<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(driver_error)
    }
}

/// A database file removed on drop.
pub struct TempDb {
    path: PathBuf,
}

impl TempDb {
    pub fn new(schema: &str) -> Self {
        let path = std::env::temp_dir().join(format!("rowmap-{}.db", uuid::Uuid::new_v4().simple()));
        let conn = rusqlite::Connection::open(&path).expect("create sqlite file");
        conn.execute_batch(schema).expect("apply schema");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run statements straight against the file, outside any session.
    pub fn execute(&self, sql: &str) {
        let conn = rusqlite::Connection::open(&self.path).expect("open sqlite file");
        conn.execute_batch(sql).expect("execute batch");
    }

    /// Read one integer straight from the file, outside any session.
    pub fn scalar(&self, sql: &str) -> i64 {
        let conn = rusqlite::Connection::open(&self.path).expect("open sqlite file");
        conn.query_row(sql, [], |row| row.get(0)).expect("scalar query")
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub const SCHEMA: &str = "
    CREATE TABLE users (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT,
        version INTEGER NOT NULL
    );
    CREATE TABLE notes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        body TEXT NOT NULL,
        pinned INTEGER NOT NULL
    );
    CREATE TABLE tokens (
        id BLOB PRIMARY KEY,
        label TEXT NOT NULL
    );
    CREATE TABLE tags (
        id INTEGER PRIMARY KEY,
        label TEXT NOT NULL
    );
    CREATE TABLE invoices (
        id INTEGER PRIMARY KEY,
        issued_on INTEGER NOT NULL,
        cutoff INTEGER NOT NULL,
        due_at INTEGER NOT NULL,
        paid_at INTEGER,
        total TEXT NOT NULL
    );
";

pub fn pool(db: &TempDb, max: usize) -> Pool<impl ConnectionFactory<Connection = SqliteConnection> + use<>> {
    let path = db.path().to_path_buf();
    Pool::new(
        PoolConfig::new(max).acquire_timeout(2_000),
        move || SqliteConnection::open(&path),
    )
}

pub fn database(
    db: &TempDb,
    max: usize,
) -> Database<Pool<impl ConnectionFactory<Connection = SqliteConnection> + use<>>> {
    Database::new(pool(db, max))
        .with_registry(Arc::new(EntityRegistry::new()))
        .with_config(SessionConfig::new().dialect(Dialect::Sqlite).acquire_timeout(2_000))
}
