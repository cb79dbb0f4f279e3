//! Bounded blocking connection pool for rowmap.
//!
//! [`Pool`] opens connections on demand through a [`ConnectionFactory`] up to
//! `max_connections`, keeps released connections idle for reuse, and makes
//! callers wait (bounded by a timeout) when every connection is leased.
//! Waiters park on a condition variable and are woken one at a time as
//! connections come back.

use parking_lot::{Condvar, Mutex};
use rowmap_core::{
    Connection, ConnectionProvider, DriverResult, Error, PoolExhaustedError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Test connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 30_000, // 30 seconds
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Load a configuration from JSON; missing keys take their defaults.
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Default wait for [`Pool::get`].
    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of leased connections
    pub active_connections: usize,
    /// Number of callers waiting for a connection
    pub pending_requests: usize,
}

/// Opens new connections for a [`Pool`].
pub trait ConnectionFactory: Send + Sync {
    type Connection: Connection;

    fn connect(&self) -> DriverResult<Self::Connection>;
}

impl<F, C> ConnectionFactory for F
where
    F: Fn() -> DriverResult<C> + Send + Sync,
    C: Connection,
{
    type Connection = C;

    fn connect(&self) -> DriverResult<C> {
        self()
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    total: usize,
    active: usize,
    pending: usize,
}

enum Checkout<C> {
    Idle(C),
    Open,
}

/// A bounded, blocking connection pool.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    available: Condvar,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a new connection pool. No connection is opened until needed.
    pub fn new(config: PoolConfig, factory: F) -> Self {
        Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                active: 0,
                pending: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.active,
            pending_requests: state.pending,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.state.lock().total >= self.config.max_connections
    }

    /// Acquire with the configured timeout.
    pub fn get(&self) -> Result<F::Connection> {
        self.acquire(self.config.acquire_timeout_duration())
    }

    fn checkout(&self, started: Instant, deadline: Instant) -> Result<Checkout<F::Connection>> {
        let mut state = self.state.lock();
        loop {
            if let Some(conn) = state.idle.pop_front() {
                state.active += 1;
                return Ok(Checkout::Idle(conn));
            }
            if state.total < self.config.max_connections {
                // Reserve the slot now; the connection is opened outside the lock.
                state.total += 1;
                state.active += 1;
                return Ok(Checkout::Open);
            }

            state.pending += 1;
            let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
            state.pending -= 1;

            if timed_out
                && state.idle.is_empty()
                && state.total >= self.config.max_connections
            {
                let waited = started.elapsed();
                tracing::warn!(
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    max_connections = self.config.max_connections,
                    "connection pool exhausted"
                );
                return Err(Error::PoolExhausted(PoolExhaustedError {
                    waited,
                    max_connections: self.config.max_connections,
                }));
            }
        }
    }

    fn open(&self) -> Result<F::Connection> {
        match self.factory.connect() {
            Ok(conn) => {
                tracing::debug!("opened pooled connection");
                Ok(conn)
            }
            Err(err) => {
                self.forget_slot();
                Err(Error::driver("opening pooled connection", err))
            }
        }
    }

    /// Give up a leased slot whose connection no longer exists.
    fn forget_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

impl<F: ConnectionFactory> ConnectionProvider for Pool<F> {
    type Connection = F::Connection;

    fn acquire(&self, timeout: Duration) -> Result<F::Connection> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            match self.checkout(started, deadline)? {
                Checkout::Open => return self.open(),
                Checkout::Idle(mut conn) => {
                    if !self.config.test_on_checkout || conn.is_valid() {
                        return Ok(conn);
                    }
                    tracing::debug!("discarding pooled connection that failed its checkout test");
                    drop(conn);
                    self.forget_slot();
                }
            }
        }
    }

    fn release(&self, conn: F::Connection) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.idle.push_back(conn);
        drop(state);
        self.available.notify_one();
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
