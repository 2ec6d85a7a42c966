//! Error types for the connection pool manager.
//!
//! `PoolError` is the taxonomy callers can observe; `EngineError` is what the
//! pooling engine and its driver handles report. Engine errors never cross the
//! manager boundary as-is: they are wrapped, redacted and stored.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Bootstrap error: {component} - {message}")]
    Bootstrap { component: String, message: String },

    #[error("Failed to get connection from pool '{pool}': {message}")]
    ConnectionAcquisition { pool: String, message: String },

    #[error("No connection available")]
    NoConnection,

    #[error("Transaction already in progress")]
    AlreadyInTransaction,

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction {operation} failed: {message}")]
    Transaction { operation: String, message: String },

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },
}

impl PoolError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a bootstrap error for the component that failed to construct.
    pub fn bootstrap(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bootstrap {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a connection acquisition error.
    pub fn acquisition(pool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionAcquisition {
            pool: pool.into(),
            message: message.into(),
        }
    }

    /// Create a transaction error carrying the driver message.
    pub fn transaction(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transaction {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code, used in error contexts and events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Bootstrap { .. } => "BOOTSTRAP_ERROR",
            Self::ConnectionAcquisition { .. } => "CONNECTION_ACQUISITION_ERROR",
            Self::NoConnection => "NO_CONNECTION",
            Self::AlreadyInTransaction => "ALREADY_IN_TRANSACTION",
            Self::NoActiveTransaction => "NO_ACTIVE_TRANSACTION",
            Self::Transaction { .. } => "TRANSACTION_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
        }
    }

    /// Check if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionAcquisition { .. } | Self::Transaction { .. }
        )
    }
}

/// Result type alias for manager operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors reported by a pooling engine or one of its driver handles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Timed out after {waited_ms}ms waiting for a connection from pool '{pool}'")]
    Timeout { pool: String, waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver(message.into())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => EngineError::Timeout {
                pool: "unknown".to_string(),
                waited_ms: 0,
            },
            sqlx::Error::PoolClosed => EngineError::PoolClosed,
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => EngineError::Driver(format!("{} (code: {})", db_err.message(), code)),
                None => EngineError::Driver(db_err.message().to_string()),
            },
            sqlx::Error::Io(io_err) => EngineError::Driver(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => EngineError::Driver(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => EngineError::Driver(format!("Protocol error: {}", msg)),
            sqlx::Error::Configuration(msg) => {
                EngineError::Unavailable(format!("Invalid configuration: {}", msg))
            }
            sqlx::Error::WorkerCrashed => {
                EngineError::Unavailable("Database worker crashed".into())
            }
            other => EngineError::Driver(other.to_string()),
        }
    }
}
