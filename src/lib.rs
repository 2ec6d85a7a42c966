//! DB Pool Manager Library
//!
//! Lifecycle coordinator and input guard around a MySQL connection-pooling
//! engine: bootstraps the engine, leases connections by pool name, tracks
//! outstanding leases and keeps credentials out of every error it reports.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod security;

pub use config::ManagerConfig;
pub use db::{Connection, ConnectionManager, DEFAULT_POOL, LeaseGuard, ManagerCell};
pub use error::{EngineError, PoolError, PoolResult};
