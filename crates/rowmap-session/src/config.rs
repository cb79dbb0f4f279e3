//! Session configuration.

use rowmap_query::Dialect;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by every session a [`Database`](crate::Database) opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum time `begin` waits for a connection, in milliseconds
    pub acquire_timeout_ms: u64,
    /// SQL dialect statements are built for
    pub dialect: Dialect,
    /// Forward diagnostics to `tracing` when no sink is installed
    pub trace_statements: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
            dialect: Dialect::default(),
            trace_statements: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn trace_statements(mut self, enabled: bool) -> Self {
        self.trace_statements = enabled;
        self
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
