//! Connection lifecycle management.
//!
//! `ConnectionManager` sits between callers and the pooling engine. It
//! bootstraps the engine once, leases adapters by pool name, tracks which
//! adapters are outstanding and hands them back. It never retries and never
//! raises: a failed lease yields `None` plus a redacted message in
//! [`ConnectionManager::error`].
//!
//! # Concurrency
//!
//! - The active set is a `std::sync::Mutex`, never held across an await
//! - Engine acquire is the only suspension point of a lease
//! - Adapter identity is `Arc` pointer identity

use crate::config::ManagerConfig;
use crate::db::adapter::{Connection, ConnectionAdapter};
use crate::db::bootstrap::{BootstrapStage, Components, ManagerLogger, bootstrap};
use crate::db::events::PoolEvent;
use crate::engine::{EngineFactory, PoolEngine};
use crate::error::{PoolError, PoolResult};
use crate::models::{ErrorContext, PoolStatsSnapshot};
use crate::security::{
    DEFAULT_POOL_NAME, sanitize_error_message, validate_and_sanitize_pool_name,
};
use futures_util::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Pool name used when callers have no preference.
pub const DEFAULT_POOL: &str = DEFAULT_POOL_NAME;

pub struct ConnectionManager {
    config: ManagerConfig,
    logger: ManagerLogger,
    stage: BootstrapStage,
    components: Option<Components>,
    /// Bootstrap failure; kept for the manager's whole life.
    init_error: Option<String>,
    last_error: Mutex<Option<String>>,
    active: Mutex<Vec<Connection>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("stage", &self.stage)
            .field("database", &self.config.database.masked_connection_url())
            .field("active_connections", &self.active_connection_count())
            .field("last_error", &self.error())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Bootstrap a manager.
    ///
    /// Never fails: a bootstrap error leaves the manager uninitialized with
    /// the redacted reason in [`ConnectionManager::error`]. Every later lease
    /// then fails without touching an engine.
    pub fn new(config: ManagerConfig, factory: Arc<dyn EngineFactory>) -> Arc<Self> {
        Arc::new_cyclic(|manager| {
            let logger = ManagerLogger::new(config.verbose_lifecycle);
            let mut stage = BootstrapStage::LoggerReady;
            logger.lifecycle("Logger ready");

            let (components, init_error) =
                match bootstrap(&config, factory.as_ref(), &logger, manager.clone(), &mut stage) {
                    Ok(components) => {
                        stage = BootstrapStage::Initialized;
                        logger.lifecycle(&format!(
                            "Connection manager initialized ({}, {}, {} engine)",
                            config.database.masked_connection_url(),
                            config.context,
                            components.engine.name()
                        ));
                        (Some(components), None)
                    }
                    Err(e) => {
                        let message = sanitize_error_message(
                            &format!("Failed to initialize connection pool: {}", e),
                            config.database.secret(),
                        );
                        error!(
                            parent: logger.span(),
                            stage = %stage,
                            error_code = e.code(),
                            error = %message,
                            "Bootstrap aborted, partial registry discarded"
                        );
                        (None, Some(message))
                    }
                };

            Self {
                config,
                logger,
                stage,
                components,
                init_error,
                last_error: Mutex::new(None),
                active: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.components.is_some()
    }

    /// Last bootstrap stage reached.
    pub fn stage(&self) -> BootstrapStage {
        self.stage
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Lease a connection from `pool_name`.
    ///
    /// The name is sanitized first. Returns `None` on failure, with the
    /// reason available from [`ConnectionManager::error`].
    pub async fn get_connection(&self, pool_name: &str) -> Option<Connection> {
        self.try_get_connection(pool_name).await.ok()
    }

    /// Like [`ConnectionManager::get_connection`], returning the error too.
    pub async fn try_get_connection(&self, pool_name: &str) -> PoolResult<Connection> {
        self.clear_error();
        let pool = validate_and_sanitize_pool_name(pool_name);
        if pool != pool_name {
            warn!(parent: self.logger.span(), pool = %pool, "Pool name was sanitized");
        }

        let result = self.acquire(&pool).await;
        if let Err(e) = &result {
            let context = ErrorContext::new(&pool, e.code());
            self.set_error(&e.to_string(), Some(&context));
            self.emit(PoolEvent::AcquireFailed {
                pool: pool.clone(),
                error_code: e.code().to_string(),
            });
        }
        result
    }

    async fn acquire(&self, pool: &str) -> PoolResult<Connection> {
        let components = self
            .components
            .as_ref()
            .ok_or_else(|| PoolError::acquisition(pool, "connection manager is not initialized"))?;

        let handle = components
            .engine
            .acquire(pool)
            .await
            .map_err(|e| PoolError::acquisition(pool, e.to_string()))?;

        let adapter: Connection = Arc::new(ConnectionAdapter::new(
            Some(handle),
            pool,
            self.config.database.secret(),
        ));
        self.active_set().push(Arc::clone(&adapter));

        debug!(
            parent: self.logger.span(),
            pool = %pool,
            lease_id = %adapter.lease_id(),
            "Connection leased"
        );
        components.events.emit(PoolEvent::Leased {
            pool: pool.to_string(),
            lease_id: adapter.lease_id().to_string(),
        });
        Ok(adapter)
    }

    /// Hand a connection back to the engine.
    ///
    /// Idempotent: a connection that is no longer tracked is still released
    /// (a no-op once its handle is gone) and a warning is logged.
    pub async fn release_connection(&self, connection: &Connection) {
        let tracked = {
            let mut active = self.active_set();
            match active.iter().position(|c| Arc::ptr_eq(c, connection)) {
                Some(index) => {
                    active.swap_remove(index);
                    true
                }
                None => false,
            }
        };

        if !tracked {
            warn!(
                parent: self.logger.span(),
                pool = %connection.pool_name(),
                lease_id = %connection.lease_id(),
                "Releasing a connection that is not tracked (double release or foreign adapter)"
            );
        }

        match &self.components {
            Some(components) => connection.release(components.engine.as_ref()).await,
            None => connection.detach().await,
        }

        debug!(
            parent: self.logger.span(),
            lease_id = %connection.lease_id(),
            tracked,
            "Connection released"
        );
        self.emit(PoolEvent::Released {
            pool: connection.pool_name().to_string(),
            lease_id: connection.lease_id().to_string(),
            tracked,
        });
    }

    /// Lease a connection wrapped in a guard that releases it when dropped.
    pub async fn lease(&self, pool_name: &str) -> PoolResult<LeaseGuard> {
        let connection = self.try_get_connection(pool_name).await?;
        let Some(manager) = self.components.as_ref().and_then(|c| c.registry.manager()) else {
            self.release_connection(&connection).await;
            return Err(PoolError::bootstrap(
                "registry",
                "manager is no longer reachable",
            ));
        };
        Ok(LeaseGuard::new(connection, manager))
    }

    /// Release every tracked connection and close the engine.
    ///
    /// Returns the number of connections released. Individual release
    /// failures are logged by the adapters and do not stop the sweep.
    pub async fn shutdown(&self) -> usize {
        let drained = std::mem::take(&mut *self.active_set());
        let released = drained.len();

        match &self.components {
            Some(components) => {
                let engine = components.engine.as_ref();
                join_all(drained.iter().map(|c| c.release(engine))).await;
                engine.close().await;
                components.events.emit(PoolEvent::Reset { released });
            }
            None => {
                join_all(drained.iter().map(|c| c.detach())).await;
            }
        }

        info!(parent: self.logger.span(), released, "Connection manager shut down");
        released
    }

    /// Redacted message of the last failure, if any.
    ///
    /// An uninitialized manager always reports its bootstrap failure.
    pub fn error(&self) -> Option<String> {
        let last = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        last.or_else(|| self.init_error.clone())
    }

    pub fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Record a failure. The message is redacted before it is stored or logged.
    pub fn set_error(&self, message: &str, context: Option<&ErrorContext>) {
        let message = sanitize_error_message(message, self.config.database.secret());
        match context {
            Some(ctx) => error!(
                parent: self.logger.span(),
                pool = %ctx.pool,
                process_id = ctx.process_id,
                timestamp = %ctx.timestamp,
                error_code = %ctx.error_code,
                error = %message,
                "Connection pool error"
            ),
            None => error!(parent: self.logger.span(), error = %message, "Connection pool error"),
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub fn active_connection_count(&self) -> usize {
        self.active_set().len()
    }

    /// Whether `connection` is currently in the active set.
    pub fn is_tracked(&self, connection: &Connection) -> bool {
        self.active_set().iter().any(|c| Arc::ptr_eq(c, connection))
    }

    pub fn pool_stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            pool: self.config.pool.clone(),
            database: (&self.config.database).into(),
            active_connection_count: self.active_connection_count(),
            initialized: self.is_initialized(),
            execution_context: self.config.context,
        }
    }

    /// Subscribe to lifecycle events. `None` when uninitialized.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<PoolEvent>> {
        self.components.as_ref().map(|c| c.events.subscribe())
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(components) = &self.components {
            components.events.emit(event);
        }
    }

    fn active_set(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let drained = std::mem::take(
            self.active
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if drained.is_empty() {
            return;
        }

        let Some(components) = &self.components else {
            return;
        };
        let engine: Arc<dyn PoolEngine> = Arc::clone(&components.engine);
        let count = drained.len();

        // Fallback for managers dropped without shutdown()
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for connection in &drained {
                        connection.release(engine.as_ref()).await;
                    }
                });
                warn!(count, "Connections released via Drop - consider calling shutdown()");
            }
            Err(_) => {
                warn!(count, "Manager dropped outside a runtime, outstanding handles dropped");
            }
        }
    }
}

/// RAII guard for a leased connection.
///
/// Releases the connection when dropped. Prefer [`LeaseGuard::release`],
/// which does not need to spawn a task.
pub struct LeaseGuard {
    connection: Connection,
    manager: Arc<ConnectionManager>,
    released: bool,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("connection", &self.connection)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LeaseGuard {
    fn new(connection: Connection, manager: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            manager,
            released: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Explicitly release the connection (preferred over relying on Drop).
    pub async fn release(mut self) {
        self.released = true;
        self.manager.release_connection(&self.connection).await;
    }
}

impl std::ops::Deref for LeaseGuard {
    type Target = ConnectionAdapter;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let manager = Arc::clone(&self.manager);
        let connection = Arc::clone(&self.connection);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    manager.release_connection(&connection).await;
                    warn!(
                        lease_id = %connection.lease_id(),
                        pool = %connection.pool_name(),
                        "Connection released via Drop - consider using explicit release()"
                    );
                });
            }
            Err(_) => {
                warn!(
                    lease_id = %self.connection.lease_id(),
                    "Lease dropped outside a runtime; connection stays tracked until shutdown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngineFactory;

    fn manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(ManagerConfig::default(), Arc::new(MemoryEngineFactory::new()))
    }

    #[tokio::test]
    async fn test_manager_creation() {
        let manager = manager();
        assert!(manager.is_initialized());
        assert_eq!(manager.stage(), BootstrapStage::Initialized);
        assert_eq!(manager.active_connection_count(), 0);
        assert!(manager.error().is_none());
    }

    #[tokio::test]
    async fn test_release_untracks_connection() {
        let manager = manager();
        let conn = manager.get_connection(DEFAULT_POOL).await.unwrap();
        assert!(manager.is_tracked(&conn));
        manager.release_connection(&conn).await;
        assert!(!manager.is_tracked(&conn));
        assert!(!conn.has_handle().await);
    }

    #[tokio::test]
    async fn test_set_error_redacts_and_clear_error() {
        let mut config = ManagerConfig::default();
        config.database.password = "hunter2".into();
        let manager = ConnectionManager::new(config, Arc::new(MemoryEngineFactory::new()));
        manager.set_error("login failed with hunter2", None);
        let message = manager.error().unwrap();
        assert!(!message.contains("hunter2"));
        manager.clear_error();
        assert!(manager.error().is_none());
    }

    #[tokio::test]
    async fn test_uninitialized_keeps_bootstrap_error() {
        let manager = ConnectionManager::new(
            ManagerConfig::default(),
            Arc::new(MemoryEngineFactory::failing("engine offline")),
        );
        assert!(!manager.is_initialized());
        assert_eq!(manager.stage(), BootstrapStage::EventChannelReady);
        manager.clear_error();
        assert!(manager.error().unwrap().starts_with("Failed to initialize connection pool"));
        assert!(manager.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_lease_guard_release() {
        let manager = manager();
        let guard = manager.lease("reports").await.unwrap();
        assert_eq!(guard.pool_name(), "reports");
        assert_eq!(manager.active_connection_count(), 1);
        guard.release().await;
        assert_eq!(manager.active_connection_count(), 0);
    }
}
