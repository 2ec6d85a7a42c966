//! Pooling engine interface.
//!
//! The manager never pools connections itself. It talks to a [`PoolEngine`],
//! which owns, health-checks and queues the physical connections, and wraps
//! the [`DriverHandle`]s it hands out. Engines are constructed during
//! bootstrap by an [`EngineFactory`] from the dependency registry.
//!
//! Two engines are provided:
//! - [`mysql::MySqlEngine`]: sqlx `MySqlPool`s, one per pool name
//! - [`memory::MemoryEngine`]: in-process engine with fault injection

pub mod memory;
pub mod mysql;

pub use memory::{FaultSwitches, MemoryEngine, MemoryEngineFactory};
pub use mysql::{MySqlEngine, MySqlEngineFactory};

use crate::db::Registry;
use crate::error::{EngineError, PoolResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// A leased low-level connection.
#[async_trait]
pub trait DriverHandle: Send + std::fmt::Debug {
    /// Name of the pool the handle was leased from.
    fn pool_name(&self) -> &str;

    fn in_transaction(&self) -> bool;

    async fn begin_transaction(&mut self) -> Result<(), EngineError>;

    async fn commit(&mut self) -> Result<(), EngineError>;

    async fn rollback(&mut self) -> Result<(), EngineError>;

    /// Round-trip to the server.
    async fn ping(&mut self) -> Result<(), EngineError>;

    /// Close the physical connection instead of returning it to the pool.
    async fn close(self: Box<Self>) -> Result<(), EngineError>;
}

/// The external pooling engine.
#[async_trait]
pub trait PoolEngine: Send + Sync + std::fmt::Debug {
    /// Engine name for logging.
    fn name(&self) -> &'static str;

    /// Lease a handle from the named pool.
    ///
    /// May suspend until a handle is free; gives up with
    /// [`EngineError::Timeout`] once the engine's wait timeout elapses.
    async fn acquire(&self, pool_name: &str) -> Result<Box<dyn DriverHandle>, EngineError>;

    /// Give a handle back to its pool.
    async fn release(&self, handle: Box<dyn DriverHandle>) -> Result<(), EngineError>;

    /// Close every pool. Handles released afterwards are discarded.
    async fn close(&self);
}

/// Builds the pooling engine from the bootstrap registry.
pub trait EngineFactory: Send + Sync + std::fmt::Debug {
    fn build(&self, registry: &Registry) -> PoolResult<Arc<dyn PoolEngine>>;
}

/// Return a handle to its pool without leaking an open transaction.
///
/// A handle still inside a transaction is rolled back first; if the rollback
/// fails the physical connection is closed rather than reused.
pub(crate) async fn return_to_pool(mut handle: Box<dyn DriverHandle>) -> Result<(), EngineError> {
    if !handle.in_transaction() {
        drop(handle);
        return Ok(());
    }

    match handle.rollback().await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                pool = %handle.pool_name(),
                error = %e,
                "Rollback on release failed, closing connection"
            );
            handle.close().await?;
            Err(e)
        }
    }
}
