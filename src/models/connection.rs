//! Connection-related data models.
//!
//! This module defines types for database drivers, adapter transaction state
//! and the context attached to acquisition failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    MySQL,
    MariaDB,
}

impl DatabaseDriver {
    /// Parse a `DB_DRIVER` value, case-insensitively.
    pub fn parse(driver: &str) -> Option<Self> {
        match driver.to_ascii_lowercase().as_str() {
            "mysql" => Some(Self::MySQL),
            "mariadb" => Some(Self::MariaDB),
            _ => None,
        }
    }

    /// Get the display name for this driver.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySQL => "MySQL",
            Self::MariaDB => "MariaDB",
        }
    }

    /// URL scheme understood by the driver.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::MySQL => "mysql",
            Self::MariaDB => "mariadb",
        }
    }
}

impl std::fmt::Display for DatabaseDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Transaction state of a connection adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    Idle,
    InTransaction,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InTransaction)
    }
}

/// Context recorded alongside an acquisition failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub pool: String,
    pub process_id: u32,
    pub timestamp: DateTime<Utc>,
    pub error_code: String,
}

impl ErrorContext {
    /// Capture the current process and time for a failure on `pool`.
    pub fn new(pool: impl Into<String>, error_code: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            process_id: std::process::id(),
            timestamp: Utc::now(),
            error_code: error_code.into(),
        }
    }
}
