//! Connection leases.
//!
//! A lease is the exclusive, temporary ownership of one provider connection.
//! It hands the connection back exactly once: `release` takes the connection
//! out of the lease, so a second call finds nothing to return, and `Drop`
//! releases whatever is still held.

use rowmap_core::diagnostics::micros;
use rowmap_core::{ConnectionProvider, DiagnosticEvent, Diagnostics, Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ConnectionLease<P: ConnectionProvider> {
    provider: Arc<P>,
    conn: Option<P::Connection>,
    waited: Duration,
    acquired_at: Instant,
    session: Arc<str>,
    diagnostics: Diagnostics,
}

impl<P: ConnectionProvider> ConnectionLease<P> {
    /// Borrow a connection from `provider`, waiting at most `timeout`.
    ///
    /// Provider errors (including `Error::PoolExhausted`) are returned unchanged.
    pub fn acquire(
        provider: Arc<P>,
        timeout: Duration,
        session: Arc<str>,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let started = Instant::now();
        let conn = provider.acquire(timeout)?;
        let waited = started.elapsed();
        tracing::trace!(session = %session, waited_us = micros(waited), "lease acquired");
        diagnostics.emit(|| DiagnosticEvent::LeaseAcquired {
            session: session.to_string(),
            waited_us: micros(waited),
        });
        Ok(Self {
            provider,
            conn: Some(conn),
            waited,
            acquired_at: Instant::now(),
            session,
            diagnostics,
        })
    }

    /// The leased connection, or a state error once released.
    pub fn connection(&mut self) -> Result<&mut P::Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::state("use the connection of", "released"))
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Time since the connection was handed over.
    pub fn held(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Return the connection to the provider.
    ///
    /// Returns `true` if this call released it, `false` if it was already gone.
    pub fn release(&mut self) -> bool {
        let Some(conn) = self.conn.take() else {
            return false;
        };
        self.provider.release(conn);
        let held = self.held();
        tracing::trace!(session = %self.session, held_us = micros(held), "lease released");
        self.diagnostics.emit(|| DiagnosticEvent::LeaseReleased {
            session: self.session.to_string(),
            held_us: micros(held),
        });
        true
    }
}

impl<P: ConnectionProvider> Drop for ConnectionLease<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: ConnectionProvider> fmt::Debug for ConnectionLease<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("session", &self.session)
            .field("released", &self.is_released())
            .field("waited", &self.waited)
            .finish_non_exhaustive()
    }
}
