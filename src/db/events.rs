//! Lifecycle event channel.
//!
//! Events are broadcast to any number of subscribers. Sending never blocks
//! and never fails the operation that produced the event; a subscriber that
//! falls behind skips ahead (`RecvError::Lagged`).

use crate::db::bootstrap::{ManagerLogger, Registry};
use crate::error::{PoolError, PoolResult};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Leased { pool: String, lease_id: String },
    /// `tracked` is false when the adapter was not in the active set.
    Released {
        pool: String,
        lease_id: String,
        tracked: bool,
    },
    AcquireFailed { pool: String, error_code: String },
    Reset { released: usize },
}

#[derive(Debug)]
pub struct EventChannel {
    sender: broadcast::Sender<PoolEvent>,
    logger: ManagerLogger,
}

impl EventChannel {
    pub const CAPACITY: usize = 256;

    /// Open the channel. Needs the registry's logger binding.
    pub fn open(registry: &Registry) -> PoolResult<Self> {
        let logger = registry
            .logger()
            .cloned()
            .ok_or_else(|| PoolError::bootstrap("event_channel", "logger binding is missing"))?;
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Ok(Self { sender, logger })
    }

    pub fn emit(&self, event: PoolEvent) {
        trace!(parent: self.logger.span(), event = ?event, "Pool event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}
