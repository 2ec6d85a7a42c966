//! Configuration handling for the connection pool manager.
//!
//! Configuration is read once, from a key-value environment, into typed
//! structs that are then handed to the manager. Lookups are lenient: a
//! missing, empty or unparsable value silently falls back to its default.

use crate::error::{PoolError, PoolResult};
use crate::models::DatabaseDriver;
use crate::security::{
    DEFAULT_POOL_NAME, REDACTION_MASK, require_valid_database_name, require_valid_host,
    sanitize_env_value,
};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_DRIVER: &str = "mysql";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3306;
pub const DEFAULT_DATABASE: &str = "app_db";
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_CHARSET: &str = "utf8mb4";
pub const DEFAULT_COLLATION: &str = "utf8mb4_unicode_ci";

// Pool configuration defaults
pub const DEFAULT_MIN_CONNECTIONS: u32 = 8;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_WAIT_TIMEOUT_SECS: f64 = 2.0;
pub const DEFAULT_MAX_IDLE_TIME_SECS: f64 = 60.0;
/// Negative disables the heartbeat.
pub const DEFAULT_HEARTBEAT_SECS: i64 = -1;

/// Environment keys read by [`ManagerConfig::from_env`].
pub mod keys {
    pub const DB_DRIVER: &str = "DB_DRIVER";
    pub const DB_HOST: &str = "DB_HOST";
    pub const DB_HOST_CLI_DEV: &str = "DB_HOST_CLI_DEV";
    pub const DB_PORT: &str = "DB_PORT";
    pub const DB_NAME: &str = "DB_NAME";
    pub const DB_USER: &str = "DB_USER";
    pub const DB_PASSWORD: &str = "DB_PASSWORD";
    pub const DB_CHARSET: &str = "DB_CHARSET";
    pub const DB_COLLATION: &str = "DB_COLLATION";
    pub const MIN_DB_CONNECTION_POOL: &str = "MIN_DB_CONNECTION_POOL";
    pub const MAX_DB_CONNECTION_POOL: &str = "MAX_DB_CONNECTION_POOL";
    pub const DB_CONNECTION_TIME_OUT: &str = "DB_CONNECTION_TIME_OUT";
    /// Wait timeout for a free connection. The misspelling is the deployed key.
    pub const DB_CONNECTION_EXPIER_TIME: &str = "DB_CONNECTION_EXPIER_TIME";
    pub const DB_HEARTBEAT: &str = "DB_HEARTBEAT";
    pub const DB_CONNECTION_MAX_AGE: &str = "DB_CONNECTION_MAX_AGE";
    pub const APP_ENV: &str = "APP_ENV";
    /// Set by CGI-style web servers.
    pub const GATEWAY_INTERFACE: &str = "GATEWAY_INTERFACE";
}

/// A source of raw environment values.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Typed accessors over an [`EnvSource`].
#[derive(Debug, Clone, Default)]
pub struct EnvReader<S = ProcessEnv> {
    source: S,
}

impl EnvReader<ProcessEnv> {
    /// Read from the process environment.
    pub fn from_process() -> Self {
        Self { source: ProcessEnv }
    }
}

impl<S: EnvSource> EnvReader<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Sanitized value, `None` when unset or empty.
    pub fn get_optional(&self, key: &str) -> Option<String> {
        self.source
            .var(key)
            .map(|v| sanitize_env_value(&v))
            .filter(|v| !v.is_empty())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_optional(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_optional(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Non-finite values (`NaN`, `inf`) are treated as unparsable.
    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get_optional(key)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    }

    /// Accepts `true/false`, `1/0`, `yes/no` and `on/off`, case-insensitively.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_optional(key) {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            None => default,
        }
    }

    fn get_u32(&self, key: &str, default: u32) -> u32 {
        u32::try_from(self.get_int(key, i64::from(default))).unwrap_or(default)
    }

    fn get_u16(&self, key: &str, default: u16) -> u16 {
        u16::try_from(self.get_int(key, i64::from(default))).unwrap_or(default)
    }

    /// Non-negative seconds that fit in a `Duration`.
    fn get_secs(&self, key: &str, default: f64) -> f64 {
        let value = self.get_float(key, default);
        if Duration::try_from_secs_f64(value).is_ok() {
            value
        } else {
            default
        }
    }
}

/// Which kind of process the manager is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    /// Long-lived async server runtime.
    ServerRuntime,
    CliContext,
    /// Request-scoped process spawned by a web server.
    WebServerContext,
}

impl ExecutionContext {
    /// Detect the context of the calling code.
    pub fn detect<S: EnvSource>(env: &EnvReader<S>) -> Self {
        if tokio::runtime::Handle::try_current().is_ok() {
            Self::ServerRuntime
        } else if env.get_optional(keys::GATEWAY_INTERFACE).is_some() {
            Self::WebServerContext
        } else {
            Self::CliContext
        }
    }
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerRuntime => write!(f, "server_runtime"),
            Self::CliContext => write!(f, "cli"),
            Self::WebServerContext => write!(f, "web_server"),
        }
    }
}

/// Connection pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    /// Seconds allowed for establishing a physical connection.
    pub connect_timeout: f64,
    /// Seconds a caller may wait for a free connection.
    pub wait_timeout: f64,
    /// Seconds an idle connection is kept before the engine reaps it.
    pub max_idle_time: f64,
    /// Heartbeat interval in seconds; negative disables it.
    pub heartbeat: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            wait_timeout: DEFAULT_WAIT_TIMEOUT_SECS,
            max_idle_time: DEFAULT_MAX_IDLE_TIME_SECS,
            heartbeat: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl PoolConfig {
    pub fn connect_timeout_duration(&self) -> Duration {
        secs(self.connect_timeout)
    }

    pub fn wait_timeout_duration(&self) -> Duration {
        secs(self.wait_timeout)
    }

    pub fn max_idle_time_duration(&self) -> Duration {
        secs(self.max_idle_time)
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        u64::try_from(self.heartbeat)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.min_connections > self.max_connections {
            return Err(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            ));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("wait_timeout", self.wait_timeout),
            ("max_idle_time", self.max_idle_time),
        ] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(format!("{} must be a non-negative number of seconds", name));
            }
        }
        Ok(())
    }
}

/// Database connection target and credentials.
#[derive(Clone, PartialEq, Serialize)]
pub struct DatabaseConfig {
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    #[serde(skip_serializing)]
    pub username: String,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub password: String,
    pub charset: String,
    pub collation: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DEFAULT_DRIVER.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            username: DEFAULT_USER.to_string(),
            password: String::new(),
            charset: DEFAULT_CHARSET.to_string(),
            collation: DEFAULT_COLLATION.to_string(),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &REDACTION_MASK)
            .field("charset", &self.charset)
            .field("collation", &self.collation)
            .finish()
    }
}

impl DatabaseConfig {
    /// Known password for redaction, `None` when empty.
    pub fn secret(&self) -> Option<&str> {
        Some(self.password.as_str()).filter(|p| !p.is_empty())
    }

    /// Check that the configuration can be handed to a pooling engine.
    pub fn validate(&self) -> PoolResult<()> {
        if self.driver.is_empty() {
            return Err(PoolError::configuration("database driver is empty"));
        }
        if self.host.is_empty() {
            return Err(PoolError::configuration("database host is empty"));
        }
        if self.database.is_empty() {
            return Err(PoolError::configuration("database name is empty"));
        }
        require_valid_host(&self.host).map_err(|e| PoolError::configuration(e.to_string()))?;
        require_valid_database_name(&self.database)
            .map_err(|e| PoolError::configuration(e.to_string()))?;
        Ok(())
    }

    /// Parsed driver, `None` when unsupported.
    pub fn driver_kind(&self) -> Option<DatabaseDriver> {
        DatabaseDriver::parse(&self.driver)
    }

    /// Build the driver URL, credentials percent-encoded.
    pub fn connection_url(&self) -> PoolResult<Url> {
        let scheme = self
            .driver_kind()
            .map(|d| d.scheme())
            .unwrap_or(DEFAULT_DRIVER);
        let mut url = Url::parse(&format!("{}://placeholder", scheme))
            .map_err(|e| PoolError::configuration(format!("Invalid driver scheme: {}", e)))?;
        url.set_host(Some(&self.host))
            .map_err(|e| PoolError::configuration(format!("Invalid database host: {}", e)))?;
        url.set_port(Some(self.port))
            .map_err(|_| PoolError::configuration("Invalid database port"))?;
        url.set_username(&self.username)
            .map_err(|_| PoolError::configuration("Invalid database user"))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| PoolError::configuration("Invalid database password"))?;
        }
        url.set_path(&format!("/{}", self.database));
        Ok(url)
    }

    /// Get a display-safe version of the connection URL (password masked).
    pub fn masked_connection_url(&self) -> String {
        match self.connection_url() {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some(REDACTION_MASK));
                }
                url.to_string()
            }
            Err(_) => format!("{}://{}/{}", self.driver, self.host, self.database),
        }
    }
}

/// Everything the manager needs, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub context: ExecutionContext,
    /// Log lifecycle steps at INFO instead of DEBUG (`APP_ENV=dev`).
    pub verbose_lifecycle: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            pool: PoolConfig::default(),
            context: ExecutionContext::CliContext,
            verbose_lifecycle: false,
        }
    }
}

impl ManagerConfig {
    /// Load from the process environment.
    pub fn from_process_env() -> Self {
        Self::from_env(&EnvReader::from_process())
    }

    /// Load from any environment source, detecting the execution context.
    pub fn from_env<S: EnvSource>(env: &EnvReader<S>) -> Self {
        Self::from_env_in(env, ExecutionContext::detect(env))
    }

    /// Load from any environment source for a known execution context.
    pub fn from_env_in<S: EnvSource>(env: &EnvReader<S>, context: ExecutionContext) -> Self {
        let host = match (context, env.get_optional(keys::DB_HOST_CLI_DEV)) {
            (ExecutionContext::CliContext, Some(cli_host)) => cli_host,
            _ => env.get_string(keys::DB_HOST, DEFAULT_HOST),
        };

        let database = DatabaseConfig {
            driver: env.get_string(keys::DB_DRIVER, DEFAULT_DRIVER),
            host,
            port: env.get_u16(keys::DB_PORT, DEFAULT_PORT),
            database: env.get_string(keys::DB_NAME, DEFAULT_DATABASE),
            username: env.get_string(keys::DB_USER, DEFAULT_USER),
            password: env.get_string(keys::DB_PASSWORD, ""),
            charset: env.get_string(keys::DB_CHARSET, DEFAULT_CHARSET),
            collation: env.get_string(keys::DB_COLLATION, DEFAULT_COLLATION),
        };

        let max_connections = env.get_u32(keys::MAX_DB_CONNECTION_POOL, DEFAULT_MAX_CONNECTIONS);
        // A lowered cap pulls the minimum down with it
        let min_connections = env
            .get_u32(keys::MIN_DB_CONNECTION_POOL, DEFAULT_MIN_CONNECTIONS)
            .min(max_connections);

        let pool = PoolConfig {
            min_connections,
            max_connections,
            connect_timeout: env
                .get_secs(keys::DB_CONNECTION_TIME_OUT, DEFAULT_CONNECT_TIMEOUT_SECS),
            wait_timeout: env.get_secs(keys::DB_CONNECTION_EXPIER_TIME, DEFAULT_WAIT_TIMEOUT_SECS),
            max_idle_time: env.get_secs(keys::DB_CONNECTION_MAX_AGE, DEFAULT_MAX_IDLE_TIME_SECS),
            heartbeat: env.get_int(keys::DB_HEARTBEAT, DEFAULT_HEARTBEAT_SECS),
        };

        Self {
            database,
            pool,
            context,
            verbose_lifecycle: env
                .get_optional(keys::APP_ENV)
                .is_some_and(|v| v.eq_ignore_ascii_case("dev")),
        }
    }
}

/// Pooling engine selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum EngineKind {
    /// sqlx MySQL/MariaDB pools
    #[default]
    Mysql,
    /// In-process engine, no server required
    Memory,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Mysql => write!(f, "mysql"),
            EngineKind::Memory => write!(f, "memory"),
        }
    }
}

/// Command-line options of the `db-pool-manager` binary.
///
/// Database and pool settings come from the environment (see [`keys`]);
/// these flags only control logging and what the binary does.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-pool-manager",
    about = "Bootstrap a connection pool manager, lease connections and print pool statistics",
    version
)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "POOL_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, env = "POOL_JSON_LOGS")]
    pub json_logs: bool,

    /// Pooling engine
    #[arg(long, value_enum, default_value = "mysql", env = "POOL_ENGINE")]
    pub engine: EngineKind,

    /// Pool name to lease from (sanitized before use)
    #[arg(short, long, default_value = DEFAULT_POOL_NAME)]
    pub pool: String,

    /// Number of connections to lease
    #[arg(short = 'n', long, default_value_t = 1)]
    pub leases: usize,

    /// Ping the server through every leased connection
    #[arg(long)]
    pub ping: bool,

    /// Keep the leases open until Ctrl+C
    #[arg(long)]
    pub hold: bool,
}
