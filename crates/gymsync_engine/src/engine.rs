//! The sync engine: wires the queue, connection, codec and resolver together.

use crate::callbacks::{DataChange, Dispatch, Registry, StatusEvent};
use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionState};
use crate::error::{SyncError, SyncResult};
use crate::providers::TokenProvider;
use crate::queue::{OperationQueue, QueuedOperation};
use crate::resolver::{ConflictResolver, ConflictStats, Resolution, Winner};
use crate::transport::Connector;
use crate::websocket::WebSocketConnector;
use chrono::Utc;
use gymsync_protocol::{
    into_record, Capabilities, CompressionStats, Compressor, ConflictData, OperationIdGenerator,
    OperationType, Origin, SyncMessage, SyncOperation,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Statistics about the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    /// Operations transmitted to the server.
    pub operations_sent: u64,
    /// `sync_operation` messages received from the server.
    pub operations_received: u64,
    /// Conflicts resolved, local and server-reported.
    pub conflicts_resolved: u64,
    /// Time since the current connection opened (zero when disconnected).
    pub connection_uptime: Duration,
    /// Reconnects scheduled since start.
    pub reconnect_attempts: u64,
    /// Envelope codec counters.
    pub compression: CompressionStats,
    /// Conflict resolver counters.
    pub conflicts: ConflictStats,
    /// Operations waiting in the outbound queue.
    pub queue_len: usize,
    /// Operations dropped after exhausting their delivery attempts.
    pub delivery_failures: u64,
    /// Inbound operations skipped because this device produced them.
    pub echoes_skipped: u64,
    /// Inbound operations skipped by selective sync.
    pub filtered_operations: u64,
    /// Inbound operations rejected for a bad checksum or missing record id.
    pub rejected_operations: u64,
    /// Frames dropped for failing integrity or parsing.
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    operations_sent: u64,
    operations_received: u64,
    conflicts_resolved: u64,
    delivery_failures: u64,
    echoes_skipped: u64,
    filtered_operations: u64,
    rejected_operations: u64,
}

struct Inner {
    config: SyncConfig,
    tokens: Arc<dyn TokenProvider>,
    connection: ConnectionManager,
    queue: OperationQueue,
    resolver: ConflictResolver,
    compressor: Arc<Compressor>,
    ids: OperationIdGenerator,
    selective: RwLock<Option<BTreeSet<String>>>,
    in_flight: Mutex<Option<SyncOperation>>,
    registry: Registry,
    dispatch: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
    counters: Mutex<Counters>,
    shutdown: watch::Sender<bool>,
}

/// The sync engine.
///
/// Construct one per client and own it explicitly; there is no global
/// instance. [`start`](Self::start) spawns the connection, sender and
/// receiver tasks plus the callback dispatcher thread.
///
/// Delivery is at-least-once with a per-operation attempt cap. After
/// [`stop`](Self::stop), [`send_operation`](Self::send_operation) fails with
/// [`SyncError::Stopped`] and anything still queued is discarded.
pub struct SyncEngine {
    inner: Arc<Inner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<Dispatch>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

fn capabilities_for(compression: bool, tables: Option<&BTreeSet<String>>) -> Capabilities {
    match tables {
        Some(tables) => Capabilities::selective(compression, tables.iter().cloned().collect()),
        None => Capabilities::all_tables(compression),
    }
}

impl SyncEngine {
    /// Creates an engine that connects through `connector`.
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let compressor = Arc::new(Compressor::new(config.compression.clone()));
        let selective: Option<BTreeSet<String>> = config
            .sync_tables
            .as_ref()
            .map(|tables| tables.iter().cloned().collect());
        let capabilities = capabilities_for(config.compression.enabled, selective.as_ref());

        let (connection, events) = ConnectionManager::new(
            ConnectionSettings::from_config(&config),
            connector,
            Arc::clone(&tokens),
            Arc::clone(&compressor),
            capabilities,
        );
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            queue: OperationQueue::new(config.queue_capacity, config.queue_warn_threshold),
            resolver: ConflictResolver::with_overrides(
                &config.table_policies,
                config.conflict_history_limit,
            ),
            config,
            tokens,
            connection,
            compressor,
            ids: OperationIdGenerator::new(),
            selective: RwLock::new(selective),
            in_flight: Mutex::new(None),
            registry: Registry::default(),
            dispatch: Mutex::new(Some(dispatch_tx)),
            counters: Mutex::new(Counters::default()),
            shutdown,
        };

        Ok(Self {
            inner: Arc::new(inner),
            events: Mutex::new(Some(events)),
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Creates an engine that connects over WebSocket.
    pub fn websocket(config: SyncConfig, tokens: Arc<dyn TokenProvider>) -> SyncResult<Self> {
        Self::new(config, Arc::new(WebSocketConnector::new()), tokens)
    }

    /// Starts connecting and replicating. Must be called within a Tokio
    /// runtime; calling it again is a no-op.
    pub fn start(&self) -> SyncResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::Config("start() must be called within a Tokio runtime".into()))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(rx) = self.dispatch_rx.lock().take() {
            self.inner
                .registry
                .spawn_dispatcher(rx)
                .map_err(|e| SyncError::Config(format!("failed to spawn callback thread: {e}")))?;
        }

        let mut tasks = self.tasks.lock();
        if let Some(events) = self.events.lock().take() {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown.subscribe();
            tasks.push(runtime.spawn(receiver_loop(inner, events, shutdown)));
        }
        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        tasks.push(runtime.spawn(sender_loop(inner, shutdown)));

        self.inner.connection.start();
        info!(
            url = %self.inner.config.websocket_url,
            device_id = %self.inner.config.device_id,
            "sync engine started"
        );
        Ok(())
    }

    /// Queues an operation for replication and returns its id.
    ///
    /// Returns immediately; transmission happens on the sender loop.
    /// Operations on the same table are sent in the order they were queued.
    pub fn send_operation(
        &self,
        table: &str,
        operation: OperationType,
        data: Value,
    ) -> SyncResult<String> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        if table.trim().is_empty() {
            return Err(SyncError::InvalidOperation("table name is empty".into()));
        }

        let record = into_record(data)?;
        let now = Utc::now();
        let id = self.inner.ids.next_id(table, now);
        let origin = Origin::new(
            self.inner.tokens.user_id().unwrap_or_default(),
            self.inner.config.device_id.clone(),
        );
        let op = SyncOperation::new(id.clone(), table, operation, record, now, origin)?;
        let queue_len = self.inner.queue.enqueue(op)?;
        debug!(operation_id = %id, table, %operation, queue_len, "operation queued");
        Ok(id)
    }

    /// Current connection state.
    pub fn get_status(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Current statistics.
    pub fn get_stats(&self) -> SyncStats {
        let connection = self.inner.connection.stats();
        let counters = self.inner.counters.lock();
        SyncStats {
            operations_sent: counters.operations_sent,
            operations_received: counters.operations_received,
            conflicts_resolved: counters.conflicts_resolved,
            connection_uptime: connection.uptime.unwrap_or_default(),
            reconnect_attempts: connection.reconnect_attempts,
            compression: self.inner.compressor.stats(),
            conflicts: self.inner.resolver.stats(),
            queue_len: self.inner.queue.len(),
            delivery_failures: counters.delivery_failures,
            echoes_skipped: counters.echoes_skipped,
            filtered_operations: counters.filtered_operations,
            rejected_operations: counters.rejected_operations,
            frames_dropped: connection.frames_dropped,
        }
    }

    /// Number of operations waiting for transmission.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Resolved conflicts, oldest first.
    pub fn conflict_history(&self) -> Vec<ConflictData> {
        self.inner.resolver.history()
    }

    /// Conflicts settled under the manual policy, awaiting human review.
    pub fn manual_backlog(&self) -> Vec<ConflictData> {
        self.inner.resolver.manual_backlog()
    }

    /// Restricts inbound replication to `tables`.
    ///
    /// Outbound operations are never filtered. The new table list is
    /// announced to the server right away when connected.
    pub async fn enable_selective_sync<I, S>(&self, tables: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables: BTreeSet<String> = tables.into_iter().map(Into::into).collect();
        info!(tables = ?tables, "selective sync enabled");
        let capabilities =
            capabilities_for(self.inner.config.compression.enabled, Some(&tables));
        *self.inner.selective.write() = Some(tables);
        self.inner.connection.update_capabilities(capabilities).await
    }

    /// Subscribes to every table again.
    pub async fn disable_selective_sync(&self) -> SyncResult<()> {
        info!("selective sync disabled");
        *self.inner.selective.write() = None;
        let capabilities = capabilities_for(self.inner.config.compression.enabled, None);
        self.inner.connection.update_capabilities(capabilities).await
    }

    /// Registers a callback for status events.
    pub fn add_status_callback<F>(&self, callback: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.inner.registry.add_status(Arc::new(callback));
    }

    /// Registers a callback for changes to `table`, or to every table with `"*"`.
    pub fn add_data_callback<F>(&self, table: impl Into<String>, callback: F)
    where
        F: Fn(&DataChange) + Send + Sync + 'static,
    {
        self.inner.registry.add_data(table.into(), Arc::new(callback));
    }

    /// Registers a callback for resolved conflicts.
    pub fn add_conflict_callback<F>(&self, callback: F)
    where
        F: Fn(&ConflictData) + Send + Sync + 'static,
    {
        self.inner.registry.add_conflict(Arc::new(callback));
    }

    /// Reconnects now, also after automatic reconnection gave up.
    pub fn reconnect(&self) {
        self.inner.connection.reconnect();
    }

    /// Stops all loops and closes the connection.
    ///
    /// Does not wait for a callback that is currently running.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping sync engine");

        let before = self.inner.connection.state();
        self.inner.shutdown.send_replace(true);
        let discarded = self.inner.queue.close();
        if discarded > 0 {
            warn!(discarded, "discarding operations still queued at stop");
        }

        self.inner.connection.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        if before != ConnectionState::Disconnected {
            self.inner.dispatch(Dispatch::Status(StatusEvent::StateChanged(
                ConnectionState::Disconnected,
            )));
        }
        // Dropping the sender lets the dispatcher thread finish on its own.
        self.inner.dispatch.lock().take();
        info!("sync engine stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        self.inner.queue.close();
        self.inner.dispatch.lock().take();
    }
}

impl Inner {
    fn dispatch(&self, event: Dispatch) {
        if let Some(tx) = self.dispatch.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                self.dispatch(Dispatch::Status(StatusEvent::StateChanged(state)));
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                error!(attempts, "reconnection attempts exhausted, sync is offline");
                self.dispatch(Dispatch::Status(StatusEvent::ReconnectExhausted { attempts }));
            }
            ConnectionEvent::Rejected { reason } => {
                error!(%reason, "sync server rejected the session, sync is offline");
                self.dispatch(Dispatch::Status(StatusEvent::ConnectionRejected { reason }));
            }
            ConnectionEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_message(&self, message: SyncMessage) {
        match message {
            SyncMessage::Operation { operation } => self.handle_remote_operation(operation),
            SyncMessage::Conflict { conflict } => self.handle_server_conflict(conflict),
            SyncMessage::Status { payload } => info!(status = ?payload, "server status"),
            SyncMessage::AuthAck { message, .. } => {
                info!(message = ?message, "authenticated with sync server");
            }
            other => debug!(message_type = other.type_name(), "ignoring message"),
        }
    }

    fn pending_for(&self, table: &str, record_id: &str) -> Option<SyncOperation> {
        self.queue.find_pending(table, record_id).or_else(|| {
            self.in_flight
                .lock()
                .as_ref()
                .filter(|op| {
                    op.table() == table && op.record_id().as_deref() == Some(record_id)
                })
                .cloned()
        })
    }

    fn handle_remote_operation(&self, remote: SyncOperation) {
        self.counters.lock().operations_received += 1;

        if remote.is_from_device(&self.config.device_id) {
            self.counters.lock().echoes_skipped += 1;
            debug!(operation_id = remote.id(), "skipping operation produced by this device");
            return;
        }

        let subscribed = match self.selective.read().as_ref() {
            Some(tables) => tables.contains(remote.table()),
            None => true,
        };
        if !subscribed {
            self.counters.lock().filtered_operations += 1;
            debug!(table = remote.table(), "table not subscribed, skipping operation");
            return;
        }

        if !remote.verify_checksum() {
            self.counters.lock().rejected_operations += 1;
            warn!(
                operation_id = remote.id(),
                table = remote.table(),
                "operation checksum does not match its data, dropping"
            );
            return;
        }
        let Some(record_id) = remote.record_id() else {
            self.counters.lock().rejected_operations += 1;
            warn!(operation_id = remote.id(), "operation has no record id, dropping");
            return;
        };

        let conflict = self.pending_for(remote.table(), &record_id).and_then(|local| {
            self.resolver
                .detect(&local, &remote)
                .map(|conflict| (local, conflict))
        });

        match conflict {
            Some((local, mut conflict)) => {
                self.connection.enter_substate(ConnectionState::Conflict);
                let resolution = self.resolver.resolve(&mut conflict);
                self.counters.lock().conflicts_resolved += 1;
                info!(
                    table = remote.table(),
                    record_id = %record_id,
                    strategy = %resolution.strategy,
                    "resolved conflict with pending local operation"
                );
                self.settle_pending(&local, &record_id, &resolution);
                self.dispatch(Dispatch::Conflict(conflict));
                self.dispatch(Dispatch::Data(DataChange {
                    table: remote.table().to_string(),
                    operation: resolution.operation,
                    data: resolution.data,
                    operation_id: Some(remote.id().to_string()),
                    resolved_with: Some(resolution.strategy),
                }));
            }
            None => {
                self.connection.enter_substate(ConnectionState::Syncing);
                debug!(operation_id = remote.id(), table = remote.table(), "applying remote operation");
                self.dispatch(Dispatch::Data(DataChange {
                    table: remote.table().to_string(),
                    operation: remote.operation(),
                    data: remote.data().clone(),
                    operation_id: Some(remote.id().to_string()),
                    resolved_with: None,
                }));
            }
        }
        self.connection.leave_substate();
    }

    /// Brings the queued local operation in line with a resolution so the
    /// losing payload is never sent.
    fn settle_pending(&self, local: &SyncOperation, record_id: &str, resolution: &Resolution) {
        let table = local.table();
        match resolution.winner {
            Winner::Remote => {
                let dropped = self.queue.discard_pending(table, record_id);
                debug!(table, record_id, dropped, "dropped superseded local operations");
            }
            Winner::Merged => {
                let merged = SyncOperation::new(
                    local.id(),
                    table,
                    local.operation(),
                    resolution.data.clone(),
                    Utc::now(),
                    Origin::new(local.origin_user_id(), local.origin_device_id()),
                );
                match merged {
                    Ok(merged) => {
                        if !self.queue.replace_pending(table, record_id, merged) {
                            debug!(table, record_id, "merged operation already in flight");
                        }
                    }
                    Err(err) => warn!(table, record_id, error = %err, "could not rebuild merged operation"),
                }
            }
            // The queued payload already is the winning one.
            Winner::Local => {}
        }
    }

    fn handle_server_conflict(&self, mut conflict: ConflictData) {
        self.connection.enter_substate(ConnectionState::Conflict);
        let resolution = self.resolver.resolve(&mut conflict);
        self.counters.lock().conflicts_resolved += 1;
        info!(
            table = %conflict.table,
            record_id = %conflict.record_id,
            strategy = %resolution.strategy,
            "resolved conflict reported by server"
        );
        let change = DataChange {
            table: conflict.table.clone(),
            operation: resolution.operation,
            data: resolution.data,
            operation_id: None,
            resolved_with: Some(resolution.strategy),
        };
        self.dispatch(Dispatch::Conflict(conflict));
        self.dispatch(Dispatch::Data(change));
        self.connection.leave_substate();
    }

    fn delivery_exhausted(&self, entry: &QueuedOperation, err: &SyncError) {
        self.counters.lock().delivery_failures += 1;
        let exhausted = SyncError::DeliveryExhausted {
            operation_id: entry.operation.id().to_string(),
            attempts: entry.attempts,
        };
        error!(
            table = entry.operation.table(),
            last_error = %err,
            "{exhausted}"
        );
        self.dispatch(Dispatch::Status(StatusEvent::DeliveryExhausted {
            operation_id: entry.operation.id().to_string(),
            table: entry.operation.table().to_string(),
            attempts: entry.attempts,
        }));
    }
}

async fn receiver_loop(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            event = events.recv() => match event {
                Some(event) => inner.handle_event(event),
                None => break,
            },
        }
    }
    debug!("receiver loop stopped");
}

/// Resolves once shutdown has been signalled.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Sleeps for `delay`, returning false if shutdown was signalled first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stopped(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn sender_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let max_attempts = inner.config.max_delivery_attempts;
    let retry_delay = inner.config.delivery_retry_delay;

    loop {
        let ready = tokio::select! {
            _ = stopped(&mut shutdown) => false,
            ready = inner.connection.wait_until_sendable() => ready,
        };
        if !ready {
            break;
        }

        let entry = tokio::select! {
            _ = stopped(&mut shutdown) => None,
            entry = inner.queue.dequeue() => entry,
        };
        let Some(mut entry) = entry else {
            break;
        };

        *inner.in_flight.lock() = Some(entry.operation.clone());
        let message = SyncMessage::operation(entry.operation.clone());
        let result = inner.connection.send(&message).await;
        *inner.in_flight.lock() = None;

        match result {
            Ok(()) => {
                inner.counters.lock().operations_sent += 1;
                debug!(
                    operation_id = entry.operation.id(),
                    table = entry.operation.table(),
                    "operation sent"
                );
            }
            // The connection went away or is throttled; try again without
            // spending an attempt.
            Err(err @ (SyncError::NotConnected | SyncError::RateLimited { .. })) => {
                debug!(operation_id = entry.operation.id(), error = %err, "operation deferred");
                if !inner.queue.requeue_front(entry) || !pause(retry_delay, &mut shutdown).await {
                    break;
                }
            }
            Err(err) => {
                entry.attempts += 1;
                if !err.is_retryable() || entry.attempts >= max_attempts {
                    inner.delivery_exhausted(&entry, &err);
                    continue;
                }
                warn!(
                    operation_id = entry.operation.id(),
                    attempt = entry.attempts,
                    error = %err,
                    "operation delivery failed, retrying"
                );
                if !inner.queue.requeue_front(entry) || !pause(retry_delay, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    debug!("sender loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StaticTokenProvider;
    use crate::transport::MockConnector;
    use serde_json::json;

    fn engine() -> SyncEngine {
        SyncEngine::new(
            SyncConfig::new("ws://localhost/ws", "tablet-1"),
            Arc::new(MockConnector::new()),
            Arc::new(StaticTokenProvider::new("token", "u1")),
        )
        .unwrap()
    }

    #[test]
    fn send_operation_validates_payload() {
        let engine = engine();
        let err = engine
            .send_operation("pagos", OperationType::Update, json!([1, 2]))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        let err = engine
            .send_operation("pagos", OperationType::Update, json!({"monto": 5}))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        let err = engine
            .send_operation(" ", OperationType::Update, json!({"id": 1}))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
    }

    #[test]
    fn send_operation_queues_without_a_connection() {
        let engine = engine();
        let first = engine
            .send_operation("pagos", OperationType::Create, json!({"id": 1, "monto": 10}))
            .unwrap();
        let second = engine
            .send_operation("pagos", OperationType::Create, json!({"id": 2, "monto": 20}))
            .unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("pagos_"));
        assert_eq!(engine.queue_len(), 2);
        assert_eq!(engine.get_stats().queue_len, 2);
        assert_eq!(engine.get_status(), ConnectionState::Disconnected);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = SyncEngine::new(
            SyncConfig::new("http://localhost", "d1"),
            Arc::new(MockConnector::new()),
            Arc::new(StaticTokenProvider::new("token", "u1")),
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn start_requires_runtime() {
        let engine = engine();
        assert!(matches!(engine.start(), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn stop_rejects_further_operations() {
        let engine = engine();
        engine.start().unwrap();
        engine
            .send_operation("pagos", OperationType::Update, json!({"id": 1}))
            .ok();
        engine.stop().await;

        assert_eq!(engine.queue_len(), 0);
        let err = engine
            .send_operation("pagos", OperationType::Update, json!({"id": 2}))
            .unwrap_err();
        assert!(matches!(err, SyncError::Stopped));
        assert!(matches!(engine.start(), Err(SyncError::Stopped)));
        assert_eq!(engine.get_status(), ConnectionState::Disconnected);
    }

    fn remote(table: &str, data: Value) -> SyncOperation {
        SyncOperation::new(
            format!("{table}_remote"),
            table,
            OperationType::Update,
            into_record(data).unwrap(),
            Utc::now(),
            Origin::new("u2", "recepcion"),
        )
        .unwrap()
    }

    #[test]
    fn losing_local_operation_is_dropped() {
        let engine = engine();
        engine
            .send_operation("pagos", OperationType::Update, json!({"id": 7, "monto": 50}))
            .unwrap();
        engine
            .send_operation("pagos", OperationType::Update, json!({"id": 8, "monto": 5}))
            .unwrap();

        engine
            .inner
            .handle_remote_operation(remote("pagos", json!({"id": 7, "monto": 80})));

        assert_eq!(engine.conflict_history().len(), 1);
        assert_eq!(engine.queue_len(), 1);
        assert!(engine.inner.queue.find_pending("pagos", "7").is_none());
        assert!(engine.inner.queue.find_pending("pagos", "8").is_some());
    }

    #[test]
    fn merged_payload_replaces_local_operation() {
        let engine = engine();
        let id = engine
            .send_operation(
                "asistencias",
                OperationType::Update,
                json!({"id": 1, "visitas": 2, "nota": "x"}),
            )
            .unwrap();

        engine
            .inner
            .handle_remote_operation(remote("asistencias", json!({"id": 1, "visitas": 5})));

        let pending = engine.inner.queue.find_pending("asistencias", "1").unwrap();
        assert_eq!(pending.id(), id);
        assert_eq!(pending.origin_device_id(), "tablet-1");
        assert!(pending.verify_checksum());
        assert_eq!(
            Value::Object(pending.data().clone()),
            json!({"id": 1, "visitas": 5, "nota": "x"})
        );
        assert_eq!(engine.queue_len(), 1);
    }

    #[test]
    fn winning_local_operation_stays_queued() {
        let engine = engine();
        engine
            .send_operation("preferencias", OperationType::Update, json!({"id": 1, "tema": "oscuro"}))
            .unwrap();

        engine
            .inner
            .handle_remote_operation(remote("preferencias", json!({"id": 1, "tema": "claro"})));

        let pending = engine.inner.queue.find_pending("preferencias", "1").unwrap();
        assert_eq!(pending.data()["tema"], json!("oscuro"));
    }

    #[test]
    fn stats_serialize_to_json() {
        let engine = engine();
        let value = serde_json::to_value(engine.get_stats()).unwrap();
        assert_eq!(value["operations_sent"], 0);
        assert!(value["compression"].is_object());
        assert!(value["conflicts"]["by_strategy"].is_object());
    }
}
