//! Entry point that ties a provider, a registry and a configuration together.

use crate::{ConnectionLease, Session, SessionConfig};
use rowmap_core::{
    Connection, ConnectionProvider, DiagnosticSink, Diagnostics, Entity, EntityMapping,
    EntityRegistry, Result, TracingSink, Value,
};
use std::sync::Arc;

/// Opens sessions against one connection provider.
///
/// Cheap to clone; clones share the provider, the registry and the sink.
pub struct Database<P: ConnectionProvider> {
    provider: Arc<P>,
    registry: Arc<EntityRegistry>,
    diagnostics: Diagnostics,
    config: SessionConfig,
}

impl<P: ConnectionProvider> Clone for Database<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            registry: Arc::clone(&self.registry),
            diagnostics: self.diagnostics.clone(),
            config: self.config.clone(),
        }
    }
}

impl<P: ConnectionProvider> Database<P> {
    /// Use `provider` with the process-wide registry and default configuration.
    pub fn new(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<P>) -> Self {
        Self {
            provider,
            registry: EntityRegistry::global(),
            diagnostics: Diagnostics::disabled(),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve mappings through `registry` instead of the global one.
    pub fn with_registry(mut self, registry: Arc<EntityRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Report every session's events to `sink`.
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Diagnostics::new(sink);
        self
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Validate and cache the mapping of `E` ahead of first use.
    pub fn register<E: Entity>(&self) -> Result<Arc<EntityMapping>> {
        self.registry.register::<E>()
    }

    /// A new session in the `Created` state.
    pub fn session(&self) -> Session<P> {
        let diagnostics = if !self.diagnostics.is_enabled() && self.config.trace_statements {
            Diagnostics::new(Arc::new(TracingSink))
        } else {
            self.diagnostics.clone()
        };
        Session::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
        .with_diagnostics(diagnostics)
    }

    /// A new session with its transaction already begun.
    pub fn begin(&self) -> Result<Session<P>> {
        let mut session = self.session();
        session.begin()?;
        Ok(session)
    }

    /// Lease a connection, ping it and hand it back.
    ///
    /// Returns `Ok(false)` when the connection was obtained but did not answer.
    pub fn test_connection(&self) -> Result<bool> {
        let mut lease = ConnectionLease::acquire(
            Arc::clone(&self.provider),
            self.config.acquire_timeout_duration(),
            Arc::from("test-connection"),
            self.diagnostics.clone(),
        )?;
        let healthy = lease.connection()?.is_valid();
        lease.release();
        if !healthy {
            tracing::warn!("connection test failed");
        }
        Ok(healthy)
    }

    /// Run `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`; otherwise rolls back and returns the
    /// error from `f`, carrying a failed rollback as its cleanup failure.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Session<P>) -> Result<T>) -> Result<T> {
        let mut session = self.begin()?;
        match f(&mut session) {
            Ok(value) => {
                session.commit()?;
                session.close()?;
                Ok(value)
            }
            Err(err) => match session.close() {
                Ok(()) => Err(err),
                Err(cleanup) => Err(err.with_cleanup(cleanup)),
            },
        }
    }

    /// Load one entity in its own transaction.
    pub fn find_by_id<E: Entity>(&self, id: impl Into<Value>) -> Result<Option<E>> {
        let id = id.into();
        self.transaction(|session| session.find_by_id::<E>(id))
    }

    /// Save one entity in its own transaction.
    pub fn save<E: Entity>(&self, entity: &mut E) -> Result<()> {
        self.transaction(|session| session.save(entity))
    }

    /// Delete one entity in its own transaction.
    pub fn delete<E: Entity>(&self, entity: &E) -> Result<()> {
        self.transaction(|session| session.delete(entity))
    }
}

impl<P: ConnectionProvider> std::fmt::Debug for Database<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("entities", &self.registry.len())
            .field("diagnostics", &self.diagnostics)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
