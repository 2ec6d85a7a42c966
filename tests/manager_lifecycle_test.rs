//! Integration tests for the manager's lease/release lifecycle.
//!
//! These run against the in-memory engine, so no database server is needed.

use db_pool_manager::config::{DatabaseConfig, EnvReader, ExecutionContext, ManagerConfig};
use db_pool_manager::db::{BootstrapStage, ConnectionManager, DEFAULT_POOL, ManagerCell, PoolEvent};
use db_pool_manager::engine::MemoryEngineFactory;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn config_with_cap(max_connections: u32) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.pool.min_connections = 0;
    config.pool.max_connections = max_connections;
    config.pool.wait_timeout = 0.1;
    config
}

fn setup(max_connections: u32) -> (Arc<MemoryEngineFactory>, Arc<ConnectionManager>) {
    let factory = Arc::new(MemoryEngineFactory::new());
    let manager = ConnectionManager::new(config_with_cap(max_connections), factory.clone());
    (factory, manager)
}

#[tokio::test]
async fn test_leases_are_distinct_and_tracked() {
    let (_factory, manager) = setup(8);

    let mut leased = Vec::new();
    for _ in 0..5 {
        leased.push(manager.get_connection("p").await.expect("lease"));
    }

    assert_eq!(manager.active_connection_count(), 5);
    for (i, a) in leased.iter().enumerate() {
        for b in leased.iter().skip(i + 1) {
            assert!(!Arc::ptr_eq(a, b));
            assert_ne!(a.lease_id(), b.lease_id());
        }
    }
    assert!(manager.error().is_none());
}

#[tokio::test]
async fn test_double_release_is_harmless() {
    let (factory, manager) = setup(4);
    let conn = manager.get_connection(DEFAULT_POOL).await.unwrap();

    manager.release_connection(&conn).await;
    assert!(!manager.is_tracked(&conn));
    assert_eq!(manager.active_connection_count(), 0);

    manager.release_connection(&conn).await;
    assert_eq!(manager.active_connection_count(), 0);

    let engine = factory.engine().unwrap();
    assert_eq!(engine.released_total(), 1);
    assert_eq!(engine.in_use(), 0);
}

#[tokio::test]
async fn test_cap_exhaustion_times_out_with_error() {
    let mut env = HashMap::new();
    env.insert("MAX_DB_CONNECTION_POOL".to_string(), "2".to_string());
    env.insert("DB_CONNECTION_EXPIER_TIME".to_string(), "0.1".to_string());
    let config = ManagerConfig::from_env_in(&EnvReader::new(env), ExecutionContext::ServerRuntime);

    let factory = Arc::new(MemoryEngineFactory::new());
    let manager = ConnectionManager::new(config, factory.clone());
    assert!(manager.is_initialized());

    let started = Instant::now();
    let mut leased = Vec::new();
    let mut failures = 0;
    for _ in 0..10 {
        match manager.get_connection(DEFAULT_POOL).await {
            Some(conn) => leased.push(conn),
            None => failures += 1,
        }
    }

    assert_eq!(leased.len(), 2);
    assert_eq!(failures, 8);
    assert_eq!(factory.engine().unwrap().in_use(), 2);
    // Eight waits of 100ms each, nowhere near hanging
    assert!(started.elapsed() < Duration::from_secs(5));

    let error = manager.error().unwrap();
    assert!(error.starts_with("Failed to get connection from pool 'default'"));

    manager.release_connection(&leased[0]).await;
    assert!(manager.get_connection(DEFAULT_POOL).await.is_some());
    assert!(manager.error().is_none());
}

#[tokio::test]
async fn test_pool_names_are_sanitized() {
    let (_factory, manager) = setup(4);
    let conn = manager.get_connection("pool; DROP TABLE x;--").await.unwrap();
    assert_eq!(conn.pool_name(), "poolDROPTABLEx--");

    let conn = manager.get_connection("").await.unwrap();
    assert_eq!(conn.pool_name(), "default");
}

#[tokio::test]
async fn test_acquire_failure_is_redacted() {
    let mut config = config_with_cap(2);
    config.database.password = "hunter2".to_string();
    let factory = Arc::new(MemoryEngineFactory::new());
    let manager = ConnectionManager::new(config, factory.clone());

    let engine = factory.engine().unwrap();
    engine.faults().fail_acquire.store(true, Ordering::Release);
    engine
        .faults()
        .set_message("connect to mysql://root:hunter2@db:3306/app_db refused, password=hunter2");

    assert!(manager.get_connection(DEFAULT_POOL).await.is_none());
    let error = manager.error().unwrap();
    assert!(!error.contains("hunter2"));
    assert!(error.contains("Failed to get connection"));
    assert_eq!(manager.active_connection_count(), 0);
}

#[tokio::test]
async fn test_bootstrap_failure_is_contained() {
    let factory = Arc::new(MemoryEngineFactory::failing("engine offline"));
    let manager = ConnectionManager::new(config_with_cap(2), factory);

    assert!(!manager.is_initialized());
    assert_eq!(manager.stage(), BootstrapStage::EventChannelReady);
    let error = manager.error().unwrap();
    assert!(error.starts_with("Failed to initialize connection pool"));
    assert!(error.contains("engine offline"));

    assert!(manager.get_connection(DEFAULT_POOL).await.is_none());
    assert!(manager.error().unwrap().contains("not initialized"));
    assert!(!manager.pool_stats().initialized);
}

#[tokio::test]
async fn test_invalid_database_config_fails_at_registry() {
    let mut config = config_with_cap(2);
    config.database = DatabaseConfig {
        host: "db host; rm -rf".to_string(),
        password: "hunter2".to_string(),
        ..DatabaseConfig::default()
    };
    let manager = ConnectionManager::new(config, Arc::new(MemoryEngineFactory::new()));

    assert!(!manager.is_initialized());
    assert_eq!(manager.stage(), BootstrapStage::LoggerReady);
    let error = manager.error().unwrap();
    assert!(error.contains("Configuration error"));
    assert!(!error.contains("hunter2"));
}

#[tokio::test]
async fn test_pool_stats_snapshot() {
    let (_factory, manager) = setup(3);
    let _a = manager.get_connection(DEFAULT_POOL).await.unwrap();
    let _b = manager.get_connection(DEFAULT_POOL).await.unwrap();

    let stats = manager.pool_stats();
    assert!(stats.initialized);
    assert_eq!(stats.active_connection_count, 2);
    assert_eq!(stats.pool.max_connections, 3);
    assert_eq!(stats.database.database, "app_db");

    let json = serde_json::to_string(&stats).unwrap();
    assert!(!json.contains("password"));
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let (_factory, manager) = setup(1);
    let mut events = manager.subscribe().unwrap();
    // Nothing is replayed from before the subscription
    assert_eq!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    );

    let conn = manager.get_connection("reports").await.unwrap();
    manager.release_connection(&conn).await;
    manager.release_connection(&conn).await;

    assert_eq!(
        events.recv().await.unwrap(),
        PoolEvent::Leased {
            pool: "reports".into(),
            lease_id: conn.lease_id().into(),
        }
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        PoolEvent::Released { tracked: true, .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        PoolEvent::Released { tracked: false, .. }
    ));
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let (factory, manager) = setup(4);
    for _ in 0..3 {
        manager.get_connection(DEFAULT_POOL).await.unwrap();
    }
    let engine = factory.engine().unwrap();
    assert_eq!(engine.in_use(), 3);

    assert_eq!(manager.shutdown().await, 3);
    assert_eq!(manager.active_connection_count(), 0);
    assert_eq!(engine.in_use(), 0);
    assert!(engine.is_closed());
}

#[tokio::test]
async fn test_shutdown_continues_past_release_failures() {
    let (factory, manager) = setup(4);
    let conn = manager.get_connection(DEFAULT_POOL).await.unwrap();
    conn.begin_transaction().await.unwrap();
    manager.get_connection(DEFAULT_POOL).await.unwrap();

    let engine = factory.engine().unwrap();
    engine.faults().fail_rollback.store(true, Ordering::Release);
    engine.faults().fail_release.store(true, Ordering::Release);

    assert_eq!(manager.shutdown().await, 2);
    assert_eq!(engine.in_use(), 0);
    assert!(!conn.in_transaction());
}

#[tokio::test]
async fn test_cell_reset_reinitializes() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let cell = ManagerCell::new(config_with_cap(4), factory.clone());
    assert!(!cell.is_loaded());

    let first = cell.get();
    assert!(Arc::ptr_eq(&first, &cell.get()));
    first.get_connection(DEFAULT_POOL).await.unwrap();
    let first_engine = factory.engine().unwrap();

    assert_eq!(cell.reset().await, 1);
    assert!(!cell.is_loaded());
    assert_eq!(first_engine.in_use(), 0);

    let second = cell.get();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_initialized());
    assert_eq!(second.active_connection_count(), 0);
    assert!(!Arc::ptr_eq(&first_engine, &factory.engine().unwrap()));

    assert_eq!(cell.reset().await, 0);
    assert_eq!(cell.reset().await, 0);
}

#[tokio::test]
async fn test_cell_constructs_once_under_contention() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let cell = Arc::new(ManagerCell::new(config_with_cap(4), factory));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.get() })
        })
        .collect();

    let mut managers = Vec::new();
    for handle in handles {
        managers.push(handle.await.unwrap());
    }
    assert!(managers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[tokio::test]
async fn test_lease_guard() {
    let (factory, manager) = setup(1);

    let guard = assert_ok!(manager.lease(DEFAULT_POOL).await);
    assert_err!(manager.lease(DEFAULT_POOL).await);
    guard.release().await;
    assert_eq!(manager.active_connection_count(), 0);

    {
        let guard = assert_ok!(manager.lease(DEFAULT_POOL).await);
        assert_ok!(guard.begin_transaction().await);
    }
    // Drop hands the release to a spawned task
    for _ in 0..50 {
        if manager.active_connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.active_connection_count(), 0);
    assert_eq!(factory.engine().unwrap().in_use(), 0);
}
