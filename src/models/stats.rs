//! Point-in-time view of the manager's configuration and usage.

use crate::config::{DatabaseConfig, ExecutionContext, PoolConfig};
use serde::Serialize;

/// Database fields safe to expose (no credentials).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseSummary {
    pub driver: String,
    pub host: String,
    pub database: String,
}

impl From<&DatabaseConfig> for DatabaseSummary {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            driver: config.driver.clone(),
            host: config.host.clone(),
            database: config.database.clone(),
        }
    }
}

/// Immutable snapshot returned by `ConnectionManager::pool_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatsSnapshot {
    pub pool: PoolConfig,
    pub database: DatabaseSummary,
    pub active_connection_count: usize,
    pub initialized: bool,
    pub execution_context: ExecutionContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serialization_excludes_credentials() {
        let database = DatabaseConfig {
            password: "topsecret".to_string(),
            ..DatabaseConfig::default()
        };
        let snapshot = PoolStatsSnapshot {
            pool: PoolConfig::default(),
            database: DatabaseSummary::from(&database),
            active_connection_count: 3,
            initialized: true,
            execution_context: ExecutionContext::ServerRuntime,
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("topsecret"));
        assert!(json.contains(r#""execution_context":"server_runtime""#));
        assert!(json.contains(r#""active_connection_count":3"#));
        assert!(json.contains(r#""max_connections":16"#));
    }
}
