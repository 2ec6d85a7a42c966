//! In-process pooling engine.
//!
//! Each pool name gets a semaphore sized to `max_connections`; a handle holds
//! one permit for its lifetime. Failures can be injected through
//! [`FaultSwitches`] to drive the manager's error paths without a server.

use super::{DriverHandle, EngineFactory, PoolEngine, return_to_pool};
use crate::db::Registry;
use crate::error::{EngineError, PoolError, PoolResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Toggles that make the next matching engine call fail.
#[derive(Debug, Default)]
pub struct FaultSwitches {
    pub fail_acquire: AtomicBool,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub fail_release: AtomicBool,
    message: Mutex<Option<String>>,
}

impl FaultSwitches {
    /// Override the text of injected failures.
    pub fn set_message(&self, message: impl Into<String>) {
        *self.message.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    fn check(&self, switch: &AtomicBool, operation: &str) -> Result<(), EngineError> {
        if !switch.load(Ordering::Acquire) {
            return Ok(());
        }
        let message = self
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| format!("injected {} failure", operation));
        Err(EngineError::Driver(message))
    }
}

/// Semaphore-backed engine with usage counters.
#[derive(Debug)]
pub struct MemoryEngine {
    capacity: usize,
    wait_timeout: Duration,
    pools: Mutex<HashMap<String, Arc<Semaphore>>>,
    faults: Arc<FaultSwitches>,
    in_use: Arc<AtomicUsize>,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl MemoryEngine {
    pub fn new(capacity: usize, wait_timeout: Duration) -> Self {
        Self {
            capacity,
            wait_timeout,
            pools: Mutex::new(HashMap::new()),
            faults: Arc::new(FaultSwitches::default()),
            in_use: Arc::new(AtomicUsize::new(0)),
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn faults(&self) -> &FaultSwitches {
        &self.faults
    }

    /// Handles currently leased out, across all pools.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn acquired_total(&self) -> u64 {
        self.acquired_total.load(Ordering::Acquire)
    }

    /// Handles given back through [`PoolEngine::release`].
    pub fn released_total(&self) -> u64 {
        self.released_total.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn semaphore(&self, pool_name: &str) -> Arc<Semaphore> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            pools
                .entry(pool_name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.capacity))),
        )
    }
}

#[async_trait]
impl PoolEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, pool_name: &str) -> Result<Box<dyn DriverHandle>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::PoolClosed);
        }
        self.faults.check(&self.faults.fail_acquire, "acquire")?;

        let semaphore = self.semaphore(pool_name);
        let started = Instant::now();
        let permit = match tokio::time::timeout(self.wait_timeout, semaphore.acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EngineError::PoolClosed),
            Err(_) => {
                return Err(EngineError::Timeout {
                    pool: pool_name.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.acquired_total.fetch_add(1, Ordering::AcqRel);
        self.in_use.fetch_add(1, Ordering::AcqRel);
        debug!(pool = %pool_name, handle = id, "Memory handle leased");

        Ok(Box::new(MemoryHandle {
            id,
            pool_name: pool_name.to_string(),
            in_transaction: false,
            faults: Arc::clone(&self.faults),
            in_use: Arc::clone(&self.in_use),
            _permit: permit,
        }))
    }

    async fn release(&self, handle: Box<dyn DriverHandle>) -> Result<(), EngineError> {
        self.released_total.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.faults.check(&self.faults.fail_release, "release") {
            // The permit still goes back when the handle drops
            drop(handle);
            return Err(e);
        }
        return_to_pool(handle).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        for semaphore in pools.values() {
            semaphore.close();
        }
    }
}

/// A leased in-memory handle. Dropping it returns the pool slot.
#[derive(Debug)]
pub struct MemoryHandle {
    id: u64,
    pool_name: String,
    in_transaction: bool,
    faults: Arc<FaultSwitches>,
    in_use: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl DriverHandle for MemoryHandle {
    fn pool_name(&self) -> &str {
        &self.pool_name
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin_transaction(&mut self) -> Result<(), EngineError> {
        self.faults.check(&self.faults.fail_begin, "begin")?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        self.faults.check(&self.faults.fail_commit, "commit")?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        self.faults.check(&self.faults.fail_rollback, "rollback")?;
        self.in_transaction = false;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Builds a fresh [`MemoryEngine`] on every bootstrap.
///
/// The most recently built engine stays reachable through
/// [`MemoryEngineFactory::engine`], so callers can flip fault switches and
/// read counters on the engine a manager is using.
#[derive(Debug, Default)]
pub struct MemoryEngineFactory {
    build_error: Option<String>,
    last: Mutex<Option<Arc<MemoryEngine>>>,
}

impl MemoryEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose every build fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            build_error: Some(message.into()),
            last: Mutex::new(None),
        }
    }

    /// The engine handed to the most recent successful bootstrap.
    pub fn engine(&self) -> Option<Arc<MemoryEngine>> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn build(&self, registry: &Registry) -> PoolResult<Arc<dyn PoolEngine>> {
        if let Some(message) = &self.build_error {
            return Err(PoolError::bootstrap("pool_engine", message.clone()));
        }

        let pool = registry.pool();
        let engine = Arc::new(MemoryEngine::new(
            pool.max_connections as usize,
            pool.wait_timeout_duration(),
        ));
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&engine));
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_and_timeout() {
        let engine = MemoryEngine::new(1, Duration::from_millis(20));
        let first = engine.acquire("default").await.unwrap();
        assert_eq!(engine.in_use(), 1);

        let err = engine.acquire("default").await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { ref pool, .. } if pool == "default"));

        // Separate pool names do not share capacity
        let other = engine.acquire("reports").await.unwrap();
        assert_eq!(engine.in_use(), 2);

        engine.release(first).await.unwrap();
        engine.release(other).await.unwrap();
        assert_eq!(engine.in_use(), 0);
        assert_eq!(engine.acquired_total(), 2);
        assert_eq!(engine.released_total(), 2);
        assert!(engine.acquire("default").await.is_ok());
    }

    #[tokio::test]
    async fn test_release_rolls_back_open_transaction() {
        let engine = MemoryEngine::new(2, Duration::from_millis(20));
        let mut handle = engine.acquire("default").await.unwrap();
        handle.begin_transaction().await.unwrap();
        assert!(handle.in_transaction());
        assert!(engine.release(handle).await.is_ok());
        assert_eq!(engine.in_use(), 0);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let engine = MemoryEngine::new(2, Duration::from_millis(20));
        engine.faults().fail_acquire.store(true, Ordering::Release);
        let err = engine.acquire("default").await.unwrap_err();
        assert_eq!(err, EngineError::Driver("injected acquire failure".into()));

        engine.faults().fail_acquire.store(false, Ordering::Release);
        engine.faults().fail_commit.store(true, Ordering::Release);
        engine.faults().set_message("deadlock found");
        let mut handle = engine.acquire("default").await.unwrap();
        handle.begin_transaction().await.unwrap();
        assert_eq!(
            handle.commit().await.unwrap_err(),
            EngineError::Driver("deadlock found".into())
        );
        assert!(handle.in_transaction());
    }

    #[tokio::test]
    async fn test_failed_release_still_frees_slot() {
        let engine = MemoryEngine::new(1, Duration::from_millis(20));
        engine.faults().fail_release.store(true, Ordering::Release);
        let handle = engine.acquire("default").await.unwrap();
        assert!(engine.release(handle).await.is_err());
        assert_eq!(engine.in_use(), 0);
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_acquire() {
        let engine = MemoryEngine::new(1, Duration::from_millis(20));
        let _ = engine.acquire("default").await.unwrap();
        engine.close().await;
        assert_eq!(engine.acquire("default").await.unwrap_err(), EngineError::PoolClosed);
    }
}
