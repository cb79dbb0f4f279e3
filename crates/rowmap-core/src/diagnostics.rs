//! Structured diagnostic events.
//!
//! Sessions report what they do to an optional [`DiagnosticSink`]. Bind values
//! never appear in an event; statements carry only the type names of their
//! binds. With no sink configured, nothing is built or recorded.

use crate::value::Value;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
    CommitFailed,
    RollbackFailed,
}

/// One observable step of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    /// A statement round trip finished (successfully or not).
    StatementExecuted {
        session: String,
        operation: &'static str,
        table: &'static str,
        sql: String,
        /// Type names of the binds, in order
        bind_types: Vec<&'static str>,
        elapsed_us: u64,
        /// Rows affected, for statements that report a count
        rows: Option<u64>,
        ok: bool,
    },
    /// A connection lease was obtained from the provider.
    LeaseAcquired { session: String, waited_us: u64 },
    /// A connection lease was handed back to the provider.
    LeaseReleased { session: String, held_us: u64 },
    /// A transaction was committed or rolled back.
    TransactionFinished {
        session: String,
        outcome: TransactionOutcome,
        elapsed_us: u64,
    },
}

/// Receiver of diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, event: &DiagnosticEvent);
}

/// Sink that forwards every event to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, event: &DiagnosticEvent) {
        match event {
            DiagnosticEvent::StatementExecuted {
                session,
                operation,
                table,
                sql,
                bind_types,
                elapsed_us,
                rows,
                ok,
            } => tracing::debug!(
                session = %session,
                operation,
                table,
                sql = %sql,
                binds = ?bind_types,
                elapsed_us,
                rows = ?rows,
                ok,
                "statement executed"
            ),
            DiagnosticEvent::LeaseAcquired { session, waited_us } => {
                tracing::debug!(session = %session, waited_us, "lease acquired");
            }
            DiagnosticEvent::LeaseReleased { session, held_us } => {
                tracing::debug!(session = %session, held_us, "lease released");
            }
            DiagnosticEvent::TransactionFinished {
                session,
                outcome,
                elapsed_us,
            } => tracing::debug!(
                session = %session,
                outcome = ?outcome,
                elapsed_us,
                "transaction finished"
            ),
        }
    }
}

/// Optional sink handle. Cloning shares the sink.
#[derive(Clone, Default)]
pub struct Diagnostics {
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl Diagnostics {
    /// Diagnostics that record nothing.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Record an event; the event is only built when a sink is present.
    pub fn emit(&self, event: impl FnOnce() -> DiagnosticEvent) {
        if let Some(sink) = &self.sink {
            sink.record(&event());
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Replace bind values with their type names.
pub fn redact(binds: &[Value]) -> Vec<&'static str> {
    binds.iter().map(Value::type_name).collect()
}

/// Duration in whole microseconds, saturating.
pub fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
