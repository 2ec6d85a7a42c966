//! Ordered construction of the manager's collaborators.
//!
//! Bootstrap runs once, inside `ConnectionManager::new`, through these stages:
//!
//! ```text
//! Uninitialized -> LoggerReady -> RegistryReady -> EventChannelReady
//!               -> PoolEngineReady -> Initialized
//! ```
//!
//! Any failing step aborts the sequence; nothing half-built is kept.

use crate::config::{DatabaseConfig, ManagerConfig, PoolConfig};
use crate::db::events::EventChannel;
use crate::db::pool::ConnectionManager;
use crate::engine::{EngineFactory, PoolEngine};
use crate::error::{PoolError, PoolResult};
use std::sync::{Arc, Weak};
use tracing::{Span, debug, info, info_span};

/// Progress of the bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapStage {
    #[default]
    Uninitialized,
    LoggerReady,
    RegistryReady,
    EventChannelReady,
    PoolEngineReady,
    Initialized,
}

impl std::fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::LoggerReady => write!(f, "logger_ready"),
            Self::RegistryReady => write!(f, "registry_ready"),
            Self::EventChannelReady => write!(f, "event_channel_ready"),
            Self::PoolEngineReady => write!(f, "pool_engine_ready"),
            Self::Initialized => write!(f, "initialized"),
        }
    }
}

/// Named logger shared by the manager and its collaborators.
///
/// Lifecycle steps go to INFO when `verbose` (development), DEBUG otherwise.
#[derive(Debug, Clone)]
pub struct ManagerLogger {
    span: Span,
    verbose: bool,
}

impl ManagerLogger {
    pub fn new(verbose: bool) -> Self {
        let instance = uuid::Uuid::new_v4().simple().to_string();
        Self {
            span: info_span!("connection_manager", instance = %&instance[..8]),
            verbose,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a lifecycle step.
    pub fn lifecycle(&self, message: &str) {
        let _entered = self.span.enter();
        if self.verbose {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }
}

/// Bindings available to collaborators while they are constructed.
#[derive(Debug)]
pub struct Registry {
    database: DatabaseConfig,
    pool: PoolConfig,
    logger: Option<ManagerLogger>,
    manager: Weak<ConnectionManager>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.database
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn logger(&self) -> Option<&ManagerLogger> {
        self.logger.as_ref()
    }

    /// The manager the registry was built for, once it is fully constructed.
    pub fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.manager.upgrade()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    database: Option<DatabaseConfig>,
    pool: Option<PoolConfig>,
    logger: Option<ManagerLogger>,
    manager: Weak<ConnectionManager>,
}

impl RegistryBuilder {
    pub fn database(mut self, database: DatabaseConfig) -> Self {
        self.database = Some(database);
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn logger(mut self, logger: ManagerLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn manager(mut self, manager: Weak<ConnectionManager>) -> Self {
        self.manager = manager;
        self
    }

    /// Validate the bindings. Missing pool settings fall back to defaults.
    pub fn build(self) -> PoolResult<Registry> {
        let database = self
            .database
            .ok_or_else(|| PoolError::configuration("database configuration is not bound"))?;
        database.validate()?;
        let pool = self.pool.unwrap_or_default();
        pool.validate().map_err(PoolError::configuration)?;

        Ok(Registry {
            database,
            pool,
            logger: self.logger,
            manager: self.manager,
        })
    }
}

/// Collaborators produced by a successful bootstrap.
#[derive(Debug)]
pub(crate) struct Components {
    pub registry: Registry,
    pub events: EventChannel,
    pub engine: Arc<dyn PoolEngine>,
}

/// Run the registry, event channel and engine steps.
///
/// `stage` is advanced as each step completes, so on failure it names the
/// last stage that was reached.
pub(crate) fn bootstrap(
    config: &ManagerConfig,
    factory: &dyn EngineFactory,
    logger: &ManagerLogger,
    manager: Weak<ConnectionManager>,
    stage: &mut BootstrapStage,
) -> PoolResult<Components> {
    let registry = Registry::builder()
        .database(config.database.clone())
        .pool(config.pool.clone())
        .logger(logger.clone())
        .manager(manager)
        .build()?;
    *stage = BootstrapStage::RegistryReady;
    logger.lifecycle("Dependency registry ready");

    let events = EventChannel::open(&registry)?;
    *stage = BootstrapStage::EventChannelReady;
    logger.lifecycle("Event channel ready");

    let engine = factory.build(&registry).map_err(|e| match e {
        PoolError::Bootstrap { .. } => e,
        other => PoolError::bootstrap("pool_engine", other.to_string()),
    })?;
    *stage = BootstrapStage::PoolEngineReady;
    logger.lifecycle(&format!("Pool engine '{}' ready", engine.name()));

    Ok(Components {
        registry,
        events,
        engine,
    })
}
