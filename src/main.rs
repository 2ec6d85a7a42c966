//! DB Pool Manager - Main entry point.
//!
//! Bootstraps a connection manager from the environment, leases the requested
//! number of connections and prints the pool statistics as JSON.

use clap::Parser;
use db_pool_manager::config::{Cli, EngineKind, EnvReader, ExecutionContext, ManagerConfig};
use db_pool_manager::db::ManagerCell;
use db_pool_manager::engine::{EngineFactory, MemoryEngineFactory, MySqlEngineFactory};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // Running under tokio, but this is a command-line process
    let config =
        ManagerConfig::from_env_in(&EnvReader::from_process(), ExecutionContext::CliContext);
    info!(
        engine = %cli.engine,
        database = %config.database.masked_connection_url(),
        context = %config.context,
        "Starting DB Pool Manager v{}",
        env!("CARGO_PKG_VERSION")
    );

    let factory: Arc<dyn EngineFactory> = match cli.engine {
        EngineKind::Mysql => Arc::new(MySqlEngineFactory),
        EngineKind::Memory => Arc::new(MemoryEngineFactory::new()),
    };
    let cell = ManagerCell::new(config, factory);
    let manager = cell.get();

    if !manager.is_initialized() {
        let reason = manager.error().unwrap_or_default();
        error!(stage = %manager.stage(), error = %reason, "Connection manager failed to start");
        return Err(reason.into());
    }

    let mut leased = Vec::with_capacity(cli.leases);
    for _ in 0..cli.leases {
        let Some(connection) = manager.get_connection(&cli.pool).await else {
            warn!(
                leased = leased.len(),
                error = ?manager.error(),
                "Could not lease connection"
            );
            break;
        };

        if cli.ping {
            match connection.ping().await {
                Ok(()) => info!(lease_id = %connection.lease_id(), "Ping ok"),
                Err(e) => warn!(lease_id = %connection.lease_id(), error = %e, "Ping failed"),
            }
        }
        leased.push(connection);
    }

    println!("{}", serde_json::to_string_pretty(&manager.pool_stats())?);

    if cli.hold && !leased.is_empty() {
        info!(leased = leased.len(), "Holding leases, press Ctrl+C to release");
        tokio::signal::ctrl_c().await?;
    }

    for connection in &leased {
        manager.release_connection(connection).await;
    }
    drop(manager);
    cell.reset().await;

    info!("Shutdown complete");
    Ok(())
}
