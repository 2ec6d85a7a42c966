//! MySQL/MariaDB engine backed by sqlx pools.
//!
//! One sqlx `MySqlPool` per pool name, created on the first lease of that
//! name. Creation is single-flight: concurrent first leases for the same name
//! wait on one `OnceCell` instead of opening duplicate pools.
//!
//! Option mapping:
//! - `connect_timeout` bounds pool creation (the first physical connects)
//! - `wait_timeout` is sqlx's acquire timeout
//! - `max_idle_time` is sqlx's idle timeout
//! - a positive heartbeat turns on `test_before_acquire`

use super::{DriverHandle, EngineFactory, PoolEngine, return_to_pool};
use crate::config::{DatabaseConfig, PoolConfig};
use crate::db::Registry;
use crate::error::{EngineError, PoolError, PoolResult};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Executor, MySql};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info};

/// Pooling engine over sqlx MySQL pools.
pub struct MySqlEngine {
    options: MySqlConnectOptions,
    pool_config: PoolConfig,
    /// Per-name lazy pools. OnceCell ensures single-flight creation.
    pools: TokioRwLock<HashMap<String, Arc<OnceCell<MySqlPool>>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MySqlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlEngine")
            .field("pool_config", &self.pool_config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MySqlEngine {
    /// Build connect options from the database configuration.
    ///
    /// No connection is opened here.
    pub fn new(database: &DatabaseConfig, pool_config: PoolConfig) -> PoolResult<Self> {
        let url = database.connection_url()?;
        let options = MySqlConnectOptions::from_str(url.as_str())
            .map_err(|e| {
                PoolError::configuration(format!("Invalid MySQL connection options: {}", e))
            })?
            .charset(&database.charset)
            .collation(&database.collation);

        Ok(Self {
            options,
            pool_config,
            pools: TokioRwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of pools created so far.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }

    async fn pool_for(&self, pool_name: &str) -> Result<MySqlPool, EngineError> {
        if self.is_closed() {
            return Err(EngineError::PoolClosed);
        }

        let cell = {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(pool_name) {
                Arc::clone(cell)
            } else {
                drop(pools);
                let mut pools = self.pools.write().await;
                // close() may have drained the map meanwhile
                if self.is_closed() {
                    return Err(EngineError::PoolClosed);
                }
                // Double-check after acquiring write lock
                Arc::clone(
                    pools
                        .entry(pool_name.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        let pool = cell
            .get_or_try_init(|| async {
                debug!(pool = %pool_name, "Creating MySQL pool");
                self.create_pool(pool_name).await
            })
            .await?;

        // Created after close() drained the map: nothing else would close it
        if self.is_closed() {
            pool.close().await;
            return Err(EngineError::PoolClosed);
        }
        Ok(pool.clone())
    }

    async fn create_pool(&self, pool_name: &str) -> Result<MySqlPool, EngineError> {
        let config = &self.pool_config;
        let connect_timeout = config.connect_timeout_duration();
        let started = Instant::now();
        let connect = MySqlPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.wait_timeout_duration())
            .idle_timeout(Some(config.max_idle_time_duration()))
            .test_before_acquire(config.heartbeat_interval().is_some())
            .connect_with(self.options.clone());

        match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(pool)) => {
                info!(
                    pool = %pool_name,
                    min_connections = config.min_connections,
                    max_connections = config.max_connections,
                    "MySQL pool created"
                );
                Ok(pool)
            }
            Ok(Err(e)) => Err(with_pool_context(e, pool_name, started)),
            Err(_) => Err(EngineError::Unavailable(format!(
                "could not connect within {}ms",
                connect_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl PoolEngine for MySqlEngine {
    fn name(&self) -> &'static str {
        "mysql"
    }

    async fn acquire(&self, pool_name: &str) -> Result<Box<dyn DriverHandle>, EngineError> {
        let pool = self.pool_for(pool_name).await?;
        let started = Instant::now();
        let conn = pool
            .acquire()
            .await
            .map_err(|e| with_pool_context(e, pool_name, started))?;

        Ok(Box::new(MySqlHandle {
            conn,
            pool_name: pool_name.to_string(),
            in_transaction: false,
        }))
    }

    async fn release(&self, handle: Box<dyn DriverHandle>) -> Result<(), EngineError> {
        return_to_pool(handle).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        // Drain pools under lock, close outside lock
        let pools_to_close: Vec<_> = {
            let mut pools = self.pools.write().await;
            pools.drain().collect()
        };

        for (pool_name, cell) in pools_to_close {
            if let Some(pool) = cell.get() {
                info!(pool = %pool_name, "Closing MySQL pool");
                pool.close().await;
            }
        }
    }
}

/// Convert a sqlx error, naming the pool and the time waited on timeouts.
fn with_pool_context(err: sqlx::Error, pool_name: &str, started: Instant) -> EngineError {
    match EngineError::from(err) {
        EngineError::Timeout { .. } => EngineError::Timeout {
            pool: pool_name.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        },
        other => other,
    }
}

/// A connection leased from a sqlx pool.
pub struct MySqlHandle {
    conn: PoolConnection<MySql>,
    pool_name: String,
    in_transaction: bool,
}

impl std::fmt::Debug for MySqlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlHandle")
            .field("pool_name", &self.pool_name)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

#[async_trait]
impl DriverHandle for MySqlHandle {
    fn pool_name(&self) -> &str {
        &self.pool_name
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin_transaction(&mut self) -> Result<(), EngineError> {
        (&mut *self.conn).execute("START TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        (&mut *self.conn).execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        // The server discards the transaction even if the ack is lost
        self.in_transaction = false;
        (&mut *self.conn).execute("ROLLBACK").await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        self.conn.ping().await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Builds a [`MySqlEngine`] for `mysql` and `mariadb` drivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlEngineFactory;

impl EngineFactory for MySqlEngineFactory {
    fn build(&self, registry: &Registry) -> PoolResult<Arc<dyn PoolEngine>> {
        let database = registry.database();
        if database.driver_kind().is_none() {
            return Err(PoolError::bootstrap(
                "pool_engine",
                format!("unsupported database driver '{}'", database.driver),
            ));
        }

        let engine = MySqlEngine::new(database, registry.pool().clone())
            .map_err(|e| PoolError::bootstrap("pool_engine", e.to_string()))?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_does_not_connect() {
        let database = DatabaseConfig {
            host: "db.invalid".to_string(),
            ..DatabaseConfig::default()
        };
        let engine = MySqlEngine::new(&database, PoolConfig::default()).unwrap();
        assert_eq!(engine.name(), "mysql");
    }

    #[tokio::test]
    async fn test_no_pools_before_first_lease() {
        let engine = MySqlEngine::new(&DatabaseConfig::default(), PoolConfig::default()).unwrap();
        assert_eq!(engine.pool_count().await, 0);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_closed_engine_does_not_reopen_pools() {
        let database = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..DatabaseConfig::default()
        };
        let engine = MySqlEngine::new(&database, PoolConfig::default()).unwrap();
        engine.close().await;
        assert!(engine.is_closed());

        let err = engine.acquire("default").await.unwrap_err();
        assert_eq!(err, EngineError::PoolClosed);
        assert_eq!(engine.pool_count().await, 0);
    }

    #[test]
    fn test_timeouts_name_the_pool() {
        let started = Instant::now();
        match with_pool_context(sqlx::Error::PoolTimedOut, "reports", started) {
            EngineError::Timeout { pool, .. } => assert_eq!(pool, "reports"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(
            with_pool_context(sqlx::Error::PoolClosed, "reports", started),
            EngineError::PoolClosed
        );
    }

    #[test]
    fn test_debug_hides_connect_options() {
        let database = DatabaseConfig {
            password: "s3cret".to_string(),
            ..DatabaseConfig::default()
        };
        let engine = MySqlEngine::new(&database, PoolConfig::default()).unwrap();
        assert!(!format!("{:?}", engine).contains("s3cret"));
    }
}
