//! Data models for the connection pool manager.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod stats;

// Re-export commonly used types
pub use connection::{DatabaseDriver, ErrorContext, TransactionState};
pub use stats::{DatabaseSummary, PoolStatsSnapshot};
