//! Connection lifecycle layer.
//!
//! This module provides the manager and everything it owns:
//! - Bootstrap of the registry, event channel and pooling engine
//! - Lease and release tracking
//! - Connection adapters with transaction state
//! - A resettable holder for the current manager

pub mod adapter;
pub mod bootstrap;
pub mod events;
pub mod instance;
pub mod pool;

pub use adapter::{Connection, ConnectionAdapter};
pub use bootstrap::{BootstrapStage, ManagerLogger, Registry, RegistryBuilder};
pub use events::{EventChannel, PoolEvent};
pub use instance::ManagerCell;
pub use pool::{ConnectionManager, DEFAULT_POOL, LeaseGuard};
