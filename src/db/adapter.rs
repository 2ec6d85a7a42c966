//! Caller-facing wrapper around one leased driver handle.
//!
//! The adapter owns the handle until the manager releases it and tracks a
//! two-state transaction machine:
//!
//! ```text
//! Idle --begin ok--> InTransaction --commit ok--> Idle
//!                    InTransaction --rollback ok|err--> Idle
//! ```
//!
//! A failed commit keeps the adapter `InTransaction` so the caller can still
//! roll back; a failed rollback lands in `Idle` because the server discards
//! the transaction either way. Operations never panic: failures come back as
//! [`PoolError`] and the redacted message is kept for [`ConnectionAdapter::error`].

use crate::engine::{DriverHandle, PoolEngine};
use crate::error::{PoolError, PoolResult};
use crate::models::TransactionState;
use crate::security::sanitize_error_message;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

/// Shared reference to a leased adapter.
///
/// The manager's active set and the caller hold the same `Arc`; identity is
/// pointer identity.
pub type Connection = Arc<ConnectionAdapter>;

pub struct ConnectionAdapter {
    lease_id: String,
    pool_name: String,
    secret: Option<String>,
    /// Held across driver calls, which serializes operations per adapter.
    handle: TokioMutex<Option<Box<dyn DriverHandle>>>,
    state: Mutex<TransactionState>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for ConnectionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAdapter")
            .field("lease_id", &self.lease_id)
            .field("pool_name", &self.pool_name)
            .field("state", &self.state())
            .field("last_error", &self.error())
            .finish_non_exhaustive()
    }
}

impl ConnectionAdapter {
    /// Wrap a handle. `secret` is masked out of stored error messages.
    pub fn new(
        handle: Option<Box<dyn DriverHandle>>,
        pool_name: impl Into<String>,
        secret: Option<&str>,
    ) -> Self {
        Self {
            lease_id: uuid::Uuid::new_v4().to_string(),
            pool_name: pool_name.into(),
            secret: secret.map(String::from),
            handle: TokioMutex::new(handle),
            state: Mutex::new(TransactionState::Idle),
            last_error: Mutex::new(None),
        }
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_transaction(&self) -> bool {
        self.state().is_active()
    }

    /// Message of the last failed operation, if any.
    pub fn error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a driver handle is still attached.
    pub async fn has_handle(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    pub async fn begin_transaction(&self) -> PoolResult<()> {
        let mut handle = self.handle.lock().await;
        let result = match handle.as_mut() {
            None => Err(PoolError::NoConnection),
            Some(_) if self.in_transaction() => Err(PoolError::AlreadyInTransaction),
            Some(h) => h
                .begin_transaction()
                .await
                .map_err(|e| PoolError::transaction("begin", e.to_string())),
        };
        if result.is_ok() {
            self.set_state(TransactionState::InTransaction);
        }
        self.record("begin", result)
    }

    pub async fn commit(&self) -> PoolResult<()> {
        let mut handle = self.handle.lock().await;
        let result = match handle.as_mut() {
            _ if !self.in_transaction() => Err(PoolError::NoActiveTransaction),
            None => Err(PoolError::NoConnection),
            Some(h) => h
                .commit()
                .await
                .map_err(|e| PoolError::transaction("commit", e.to_string())),
        };
        if result.is_ok() {
            self.set_state(TransactionState::Idle);
        }
        self.record("commit", result)
    }

    pub async fn rollback(&self) -> PoolResult<()> {
        let mut handle = self.handle.lock().await;
        let result = match handle.as_mut() {
            _ if !self.in_transaction() => Err(PoolError::NoActiveTransaction),
            None => Err(PoolError::NoConnection),
            Some(h) => {
                let result = h
                    .rollback()
                    .await
                    .map_err(|e| PoolError::transaction("rollback", e.to_string()));
                self.set_state(TransactionState::Idle);
                result
            }
        };
        self.record("rollback", result)
    }

    /// Round-trip to the server through the attached handle.
    pub async fn ping(&self) -> PoolResult<()> {
        let mut handle = self.handle.lock().await;
        let result = match handle.as_mut() {
            None => Err(PoolError::NoConnection),
            Some(h) => h
                .ping()
                .await
                .map_err(|e| PoolError::transaction("ping", e.to_string())),
        };
        self.record("ping", result)
    }

    /// Hand the driver handle back to `engine` and reset to `Idle`.
    ///
    /// Tolerates an adapter that has no handle. Engine failures are logged;
    /// the adapter is detached regardless.
    pub(crate) async fn release(&self, engine: &dyn PoolEngine) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = engine.release(handle).await {
                warn!(
                    pool = %self.pool_name,
                    lease_id = %self.lease_id,
                    error = %self.redact(&e.to_string()),
                    "Engine failed to release connection"
                );
            }
        }
        self.set_state(TransactionState::Idle);
    }

    /// Drop the driver handle without going through an engine.
    pub(crate) async fn detach(&self) {
        drop(self.handle.lock().await.take());
        self.set_state(TransactionState::Idle);
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn redact(&self, message: &str) -> String {
        sanitize_error_message(message, self.secret.as_deref())
    }

    fn record(&self, operation: &str, result: PoolResult<()>) -> PoolResult<()> {
        let mut last_error = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => {
                *last_error = None;
                debug!(
                    pool = %self.pool_name,
                    lease_id = %self.lease_id,
                    operation,
                    "Adapter operation succeeded"
                );
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    PoolError::Transaction { operation, message } => {
                        PoolError::transaction(operation, self.redact(&message))
                    }
                    other => other,
                };
                let message = e.to_string();
                warn!(
                    pool = %self.pool_name,
                    lease_id = %self.lease_id,
                    operation,
                    error = %message,
                    "Adapter operation failed"
                );
                *last_error = Some(message);
                Err(e)
            }
        }
    }
}
