//! Lazily constructed, resettable manager slot.
//!
//! Callers own a `ManagerCell` (typically in application state) instead of
//! relying on a process-wide static. The first `get` bootstraps a manager;
//! concurrent first calls construct it exactly once. `reset` shuts the
//! current manager down so the next `get` starts a fresh one.

use crate::config::ManagerConfig;
use crate::db::pool::ConnectionManager;
use crate::engine::EngineFactory;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

pub struct ManagerCell {
    config: ManagerConfig,
    factory: Arc<dyn EngineFactory>,
    instance: Mutex<Option<Arc<ConnectionManager>>>,
}

impl std::fmt::Debug for ManagerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerCell")
            .field("factory", &self.factory)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl ManagerCell {
    pub fn new(config: ManagerConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            config,
            factory,
            instance: Mutex::new(None),
        }
    }

    /// The current manager, bootstrapping one if none exists.
    pub fn get(&self) -> Arc<ConnectionManager> {
        let mut slot = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        let manager = slot.get_or_insert_with(|| {
            ConnectionManager::new(self.config.clone(), Arc::clone(&self.factory))
        });
        Arc::clone(manager)
    }

    pub fn is_loaded(&self) -> bool {
        self.instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Shut down and forget the current manager.
    ///
    /// Returns the number of connections that were still leased. Callers
    /// holding the old manager keep a valid but closed instance.
    pub async fn reset(&self) -> usize {
        let previous = self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match previous {
            Some(manager) => {
                let released = manager.shutdown().await;
                info!(released, "Connection manager reset");
                released
            }
            None => 0,
        }
    }
}
