//! Observer registration and the callback dispatcher thread.
//!
//! Callbacks never run on the sender or receiver loops. Events are pushed
//! onto a channel and a dedicated thread invokes the registered callbacks,
//! so a slow or panicking callback cannot stall replication.

use crate::connection::ConnectionState;
use gymsync_protocol::{ConflictData, OperationType, Record, ResolutionStrategy};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Table key that matches every table in [`add_data_callback`](crate::SyncEngine::add_data_callback).
pub const ALL_TABLES: &str = "*";

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// Automatic reconnection gave up; a human should look at this.
    ReconnectExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },
    /// The server refused the session (e.g. a rejected token); nothing is
    /// retried until [`reconnect`](crate::SyncEngine::reconnect).
    ConnectionRejected {
        /// Reason given by the server.
        reason: String,
    },
    /// An outbound operation was dropped after its last delivery attempt.
    DeliveryExhausted {
        /// Operation id.
        operation_id: String,
        /// Table of the operation.
        table: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// An inbound change to apply locally.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    /// Table of the record.
    pub table: String,
    /// Operation kind to apply.
    pub operation: OperationType,
    /// Record to apply.
    pub data: Record,
    /// Id of the remote operation, if the change came from one.
    pub operation_id: Option<String>,
    /// Strategy used when the change settled a conflict.
    pub resolved_with: Option<ResolutionStrategy>,
}

/// Callback for status events.
pub type StatusCallback = Arc<dyn Fn(&StatusEvent) + Send + Sync>;
/// Callback for applied data changes.
pub type DataCallback = Arc<dyn Fn(&DataChange) + Send + Sync>;
/// Callback for resolved conflicts.
pub type ConflictCallback = Arc<dyn Fn(&ConflictData) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Callbacks {
    status: Vec<StatusCallback>,
    data: Vec<(String, DataCallback)>,
    conflict: Vec<ConflictCallback>,
}

pub(crate) enum Dispatch {
    Status(StatusEvent),
    Data(DataChange),
    Conflict(ConflictData),
}

/// Shared callback registry.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    callbacks: Arc<RwLock<Callbacks>>,
}

impl Registry {
    pub(crate) fn add_status(&self, callback: StatusCallback) {
        self.callbacks.write().status.push(callback);
    }

    pub(crate) fn add_data(&self, table: String, callback: DataCallback) {
        self.callbacks.write().data.push((table, callback));
    }

    pub(crate) fn add_conflict(&self, callback: ConflictCallback) {
        self.callbacks.write().conflict.push(callback);
    }

    /// Invokes every callback interested in `event`.
    ///
    /// The registry lock is released before any callback runs, so callbacks
    /// may register further callbacks.
    pub(crate) fn dispatch(&self, event: &Dispatch) {
        match event {
            Dispatch::Status(status) => {
                let targets = self.callbacks.read().status.clone();
                for callback in targets {
                    guarded("status", || callback(status));
                }
            }
            Dispatch::Data(change) => {
                let targets: Vec<DataCallback> = self
                    .callbacks
                    .read()
                    .data
                    .iter()
                    .filter(|(table, _)| table == ALL_TABLES || *table == change.table)
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect();
                if targets.is_empty() {
                    debug!(table = %change.table, "no data callback registered for table");
                }
                for callback in targets {
                    guarded("data", || callback(change));
                }
            }
            Dispatch::Conflict(conflict) => {
                let targets = self.callbacks.read().conflict.clone();
                for callback in targets {
                    guarded("conflict", || callback(conflict));
                }
            }
        }
    }

    /// Spawns the dispatcher thread; it exits once every sender is dropped.
    pub(crate) fn spawn_dispatcher(
        &self,
        mut events: mpsc::UnboundedReceiver<Dispatch>,
    ) -> std::io::Result<JoinHandle<()>> {
        let registry = self.clone();
        std::thread::Builder::new()
            .name("gymsync-callbacks".into())
            .spawn(move || {
                while let Some(event) = events.blocking_recv() {
                    registry.dispatch(&event);
                }
                debug!("callback dispatcher stopped");
            })
    }
}

fn guarded<F: FnOnce()>(kind: &'static str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(kind, "callback panicked");
    }
}
