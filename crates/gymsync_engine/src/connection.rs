//! Connection lifecycle: connect, authenticate, exchange frames, reconnect.
//!
//! A single task owns the socket. It selects over inbound frames, outbound
//! frames, explicit reconnect requests and the shutdown signal, so the
//! connection state has exactly one writer on the transport side.

use crate::config::{ReconnectConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::providers::TokenProvider;
use crate::transport::{ConnectRequest, Connection, Connector};
use gymsync_protocol::{Capabilities, Compressor, SyncMessage};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State of the connection to the sync server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Connected and authenticated.
    Connected,
    /// Waiting before the next connection attempt.
    Reconnecting,
    /// The last connection failed.
    Error,
    /// Connected, applying inbound operations.
    Syncing,
    /// Connected, resolving a conflict.
    Conflict,
}

impl ConnectionState {
    /// Returns true if frames can be sent in this state.
    pub fn can_send(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Syncing | ConnectionState::Conflict
        )
    }

    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
            ConnectionState::Syncing => "SYNCING",
            ConnectionState::Conflict => "CONFLICT",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the connection task reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A decoded message other than `ping`.
    Message(SyncMessage),
    /// Automatic reconnection gave up after this many consecutive failures.
    ReconnectExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },
    /// The server refused the session; no retry until `reconnect()`.
    Rejected {
        /// Why the session was refused.
        reason: String,
    },
}

/// Connection settings derived from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Server endpoint.
    pub url: String,
    /// This device.
    pub device_id: String,
    /// Reconnection behaviour.
    pub reconnect: ReconnectConfig,
    /// Time allowed for opening the socket.
    pub connect_timeout: Duration,
    /// Outbound messages allowed per minute.
    pub max_messages_per_minute: Option<u32>,
}

impl ConnectionSettings {
    /// Extracts the connection settings from the engine configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            url: config.websocket_url.clone(),
            device_id: config.device_id.clone(),
            reconnect: config.reconnect.clone(),
            connect_timeout: config.connect_timeout,
            max_messages_per_minute: config.max_messages_per_minute,
        }
    }
}

/// Snapshot of connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Reconnects scheduled since start.
    pub reconnect_attempts: u64,
    /// Failures since the last successful connect.
    pub consecutive_failures: u32,
    /// Time since the current connection opened.
    pub uptime: Option<Duration>,
    /// Frames written.
    pub frames_sent: u64,
    /// Frames decoded successfully.
    pub frames_received: u64,
    /// Frames dropped for failing integrity or parsing.
    pub frames_dropped: u64,
    /// Pings answered.
    pub pings_answered: u64,
}

/// Fixed one-minute window counting outbound messages.
#[derive(Debug, Default)]
struct RateWindow {
    started: Option<Instant>,
    count: u32,
}

impl RateWindow {
    const LENGTH: Duration = Duration::from_secs(60);

    fn try_acquire(&mut self, limit: Option<u32>, now: Instant) -> bool {
        let Some(limit) = limit else {
            return true;
        };
        match self.started {
            Some(started) if now.duration_since(started) < Self::LENGTH => {}
            _ => {
                self.started = Some(now);
                self.count = 0;
            }
        }
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Debug, Default)]
struct Counters {
    reconnect_attempts: u64,
    consecutive_failures: u32,
    connected_since: Option<Instant>,
    frames_sent: u64,
    frames_received: u64,
    frames_dropped: u64,
    pings_answered: u64,
    rate: RateWindow,
}

struct OutboundFrame {
    text: String,
    ack: oneshot::Sender<SyncResult<()>>,
}

enum SessionEnd {
    Shutdown,
    Reconnect,
    Closed,
    Failed(SyncError),
}

enum Wake {
    Shutdown,
    Reconnect,
    Elapsed,
}

struct Shared {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    compressor: Arc<Compressor>,
    capabilities: RwLock<Capabilities>,
    state: watch::Sender<ConnectionState>,
    counters: Mutex<Counters>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    /// Bumped on every manual reconnect request.
    reconnect: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
}

/// Owns the connection to the sync server.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundFrame>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates a manager and the channel its events are delivered on.
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        compressor: Arc<Compressor>,
        capabilities: Capabilities,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let (reconnect, _) = watch::channel(0u64);

        let shared = Arc::new(Shared {
            settings,
            connector,
            tokens,
            compressor,
            capabilities: RwLock::new(capabilities),
            state,
            counters: Mutex::new(Counters::default()),
            outbound: outbound_tx,
            events: events_tx,
            reconnect,
            shutdown,
        });

        let manager = Self {
            shared,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            task: Mutex::new(None),
        };
        (manager, events_rx)
    }

    /// Starts the connection task. Must be called within a Tokio runtime.
    ///
    /// Returns false if the task was already started.
    pub fn start(&self) -> bool {
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.subscribe();
        let handle = tokio::spawn(run(shared, outbound_rx, shutdown));
        *self.task.lock() = Some(handle);
        true
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Waits until frames can be sent.
    ///
    /// Returns false if the manager shut down first.
    pub async fn wait_until_sendable(&self) -> bool {
        let mut state = self.shared.state.subscribe();
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            ready = async { state.wait_for(|s| s.can_send()).await.is_ok() } => ready,
            _ = async { shutdown.wait_for(|stopped| *stopped).await.is_ok() } => false,
        }
    }

    /// Sends a message over the current connection.
    ///
    /// Nothing is buffered here: if the connection is not usable the message
    /// is dropped and `NotConnected` returned so the caller can retry later.
    pub async fn send(&self, message: &SyncMessage) -> SyncResult<()> {
        let state = self.state();
        if !state.can_send() {
            debug!(message_type = message.type_name(), %state, "dropping outbound message, not connected");
            return Err(SyncError::NotConnected);
        }

        let limit = self.shared.settings.max_messages_per_minute;
        if !self.shared.counters.lock().rate.try_acquire(limit, Instant::now()) {
            let limit = limit.unwrap_or_default();
            warn!(limit, "outbound rate limit reached");
            return Err(SyncError::RateLimited { limit });
        }

        let text = self.shared.compressor.encode_frame(message)?;
        let (ack, done) = oneshot::channel();
        self.shared
            .outbound
            .send(OutboundFrame { text, ack })
            .map_err(|_| SyncError::Stopped)?;
        done.await.map_err(|_| SyncError::NotConnected)?
    }

    /// Current capabilities.
    pub fn capabilities(&self) -> Capabilities {
        self.shared.capabilities.read().clone()
    }

    /// Replaces the announced capabilities and re-announces them if connected.
    pub async fn update_capabilities(&self, capabilities: Capabilities) -> SyncResult<()> {
        *self.shared.capabilities.write() = capabilities;
        if !self.state().can_send() {
            return Ok(());
        }
        let auth = self.shared.auth_message();
        match self.send(&auth).await {
            Err(SyncError::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// Enters a transient sub-state (`Syncing` or `Conflict`) while connected.
    pub fn enter_substate(&self, substate: ConnectionState) {
        debug_assert!(matches!(
            substate,
            ConnectionState::Syncing | ConnectionState::Conflict
        ));
        self.shared
            .transition(|current| current.can_send().then_some(substate));
    }

    /// Returns from a transient sub-state to `Connected`.
    pub fn leave_substate(&self) {
        self.shared.transition(|current| {
            matches!(
                current,
                ConnectionState::Syncing | ConnectionState::Conflict
            )
            .then_some(ConnectionState::Connected)
        });
    }

    /// Requests an immediate reconnect, resetting the failure counter.
    ///
    /// This is the only way out of the settled state after reconnection gave
    /// up or the server rejected the session. A request made while a
    /// connection is being opened is satisfied by that connection.
    pub fn reconnect(&self) {
        info!("reconnect requested");
        self.shared.reconnect.send_modify(|requests| *requests += 1);
    }

    /// Returns a snapshot of the connection counters.
    pub fn stats(&self) -> ConnectionStats {
        let counters = self.shared.counters.lock();
        ConnectionStats {
            reconnect_attempts: counters.reconnect_attempts,
            consecutive_failures: counters.consecutive_failures,
            uptime: counters.connected_since.map(|since| since.elapsed()),
            frames_sent: counters.frames_sent,
            frames_received: counters.frames_received,
            frames_dropped: counters.frames_dropped,
            pings_answered: counters.pings_answered,
        }
    }

    /// Stops the connection task and closes the socket.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                warn!("connection task did not stop in time, aborting");
                handle.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    fn transition<F>(&self, next: F)
    where
        F: FnOnce(ConnectionState) -> Option<ConnectionState>,
    {
        let mut changed = None;
        self.state.send_if_modified(|current| match next(*current) {
            Some(state) if state != *current => {
                *current = state;
                changed = Some(state);
                true
            }
            _ => false,
        });
        if let Some(state) = changed {
            debug!(%state, "connection state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged(state));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.transition(|_| Some(state));
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn auth_message(&self) -> SyncMessage {
        SyncMessage::auth(
            self.tokens.user_id().unwrap_or_default(),
            self.settings.device_id.clone(),
            self.capabilities.read().clone(),
        )
    }

    fn connect_request(&self) -> SyncResult<ConnectRequest> {
        let token = self
            .tokens
            .token()
            .ok_or_else(|| SyncError::connection_retryable("no auth token available"))?;
        Ok(ConnectRequest {
            url: self.settings.url.clone(),
            token,
            user_id: self.tokens.user_id().unwrap_or_default(),
            device_id: self.settings.device_id.clone(),
            capabilities: self.capabilities.read().clone(),
        })
    }

    async fn connect(&self) -> SyncResult<Box<dyn Connection>> {
        let request = self.connect_request()?;
        match tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn write(&self, conn: &mut dyn Connection, message: &SyncMessage) -> SyncResult<()> {
        let text = self.compressor.encode_frame(message)?;
        self.write_text(conn, text).await
    }

    async fn write_text(&self, conn: &mut dyn Connection, text: String) -> SyncResult<()> {
        conn.send_text(text).await?;
        self.counters.lock().frames_sent += 1;
        Ok(())
    }

    async fn session(
        &self,
        conn: &mut dyn Connection,
        outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>,
        shutdown: &mut watch::Receiver<bool>,
        reconnect: &mut watch::Receiver<u64>,
    ) -> SessionEnd {
        let auth = self.auth_message();
        if let Err(err) = self.write(conn, &auth).await {
            return SessionEnd::Failed(err);
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                _ = reconnect.changed() => return SessionEnd::Reconnect,
                frame = outbound.recv() => {
                    let Some(OutboundFrame { text, ack }) = frame else {
                        return SessionEnd::Shutdown;
                    };
                    match self.write_text(conn, text).await {
                        Ok(()) => {
                            let _ = ack.send(Ok(()));
                        }
                        Err(err) => {
                            let reason = err.to_string();
                            let _ = ack.send(Err(err));
                            return SessionEnd::Failed(SyncError::connection_retryable(reason));
                        }
                    }
                }
                incoming = conn.next_text() => match incoming {
                    Ok(Some(text)) => {
                        if let Err(err) = self.handle_frame(conn, &text).await {
                            return SessionEnd::Failed(err);
                        }
                    }
                    Ok(None) => return SessionEnd::Closed,
                    Err(err) => return SessionEnd::Failed(err),
                },
            }
        }
    }

    async fn handle_frame(&self, conn: &mut dyn Connection, text: &str) -> SyncResult<()> {
        let message: SyncMessage = match self.compressor.decode_frame(text) {
            Ok(message) => message,
            Err(err) => {
                self.counters.lock().frames_dropped += 1;
                if err.is_integrity() {
                    warn!(error = %err, "dropping frame that failed integrity check");
                } else {
                    warn!(error = %err, "dropping malformed frame");
                }
                return Ok(());
            }
        };
        self.counters.lock().frames_received += 1;

        match message {
            SyncMessage::Ping { .. } => {
                let pong = SyncMessage::pong(self.settings.device_id.clone());
                self.write(conn, &pong).await?;
                self.counters.lock().pings_answered += 1;
            }
            SyncMessage::AuthAck {
                success: false,
                message,
            } => {
                let reason = message.unwrap_or_else(|| "authentication rejected".into());
                warn!(%reason, "server rejected authentication");
                return Err(SyncError::connection_fatal(reason));
            }
            SyncMessage::Unknown => debug!("ignoring message of unknown type"),
            other => self.emit(ConnectionEvent::Message(other)),
        }
        Ok(())
    }

    async fn sleep_or_wake(
        &self,
        delay: Duration,
        shutdown: &mut watch::Receiver<bool>,
        reconnect: &mut watch::Receiver<u64>,
    ) -> Wake {
        tokio::select! {
            _ = shutdown.changed() => Wake::Shutdown,
            _ = reconnect.changed() => Wake::Reconnect,
            _ = tokio::time::sleep(delay) => Wake::Elapsed,
        }
    }

    async fn wait_for_reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        reconnect: &mut watch::Receiver<u64>,
    ) -> Wake {
        tokio::select! {
            _ = shutdown.changed() => Wake::Shutdown,
            _ = reconnect.changed() => Wake::Reconnect,
        }
    }
}

/// Runs `fut` while answering every outbound frame with `NotConnected`.
async fn rejecting_outbound<F: Future>(
    outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    fut: F,
) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return output,
            Some(frame) = outbound.recv() => {
                let _ = frame.ack.send(Err(SyncError::NotConnected));
            }
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_attempts = shared.settings.reconnect.max_attempts;
    let mut reconnect = shared.reconnect.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        info!(url = %shared.settings.url, "connecting");
        let attempt = rejecting_outbound(&mut outbound, async {
            tokio::select! {
                _ = shutdown.changed() => None,
                result = shared.connect() => Some(result),
            }
        })
        .await;

        let end = match attempt {
            None => break,
            Some(Ok(mut conn)) => {
                {
                    let mut counters = shared.counters.lock();
                    counters.consecutive_failures = 0;
                    counters.connected_since = Some(Instant::now());
                }
                // Requests made while connecting are satisfied by this session.
                reconnect.borrow_and_update();
                shared.set_state(ConnectionState::Connected);
                info!(url = %shared.settings.url, "connected");

                let end = shared
                    .session(conn.as_mut(), &mut outbound, &mut shutdown, &mut reconnect)
                    .await;
                if let Err(err) = conn.close().await {
                    debug!(error = %err, "error while closing connection");
                }
                shared.counters.lock().connected_since = None;
                end
            }
            Some(Err(err)) => SessionEnd::Failed(err),
        };

        while let Ok(frame) = outbound.try_recv() {
            let _ = frame.ack.send(Err(SyncError::NotConnected));
        }

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Reconnect => {
                shared.counters.lock().consecutive_failures = 0;
                shared.set_state(ConnectionState::Disconnected);
                continue;
            }
            SessionEnd::Closed => {
                info!("server closed the connection");
                shared.set_state(ConnectionState::Disconnected);
            }
            SessionEnd::Failed(err) if !err.is_retryable() => {
                error!(error = %err, "connection rejected, waiting for a manual reconnect");
                shared.set_state(ConnectionState::Error);
                shared.set_state(ConnectionState::Disconnected);
                shared.emit(ConnectionEvent::Rejected {
                    reason: err.to_string(),
                });
                let wake = shared.wait_for_reconnect(&mut shutdown, &mut reconnect);
                match rejecting_outbound(&mut outbound, wake).await {
                    Wake::Shutdown => break,
                    _ => {
                        shared.counters.lock().consecutive_failures = 0;
                        continue;
                    }
                }
            }
            SessionEnd::Failed(err) => {
                warn!(error = %err, "connection failed");
                shared.set_state(ConnectionState::Error);
            }
        }

        let failures = {
            let mut counters = shared.counters.lock();
            counters.consecutive_failures += 1;
            counters.consecutive_failures
        };

        if failures >= max_attempts {
            shared.set_state(ConnectionState::Disconnected);
            warn!(attempts = failures, "giving up on reconnecting");
            shared.emit(ConnectionEvent::ReconnectExhausted { attempts: failures });
            let wake = shared.wait_for_reconnect(&mut shutdown, &mut reconnect);
            match rejecting_outbound(&mut outbound, wake).await {
                Wake::Shutdown => break,
                _ => {
                    shared.counters.lock().consecutive_failures = 0;
                    continue;
                }
            }
        }

        shared.set_state(ConnectionState::Reconnecting);
        shared.counters.lock().reconnect_attempts += 1;
        let delay = shared.settings.reconnect.delay_for_attempt(failures);
        info!(
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let wake = shared.sleep_or_wake(delay, &mut shutdown, &mut reconnect);
        match rejecting_outbound(&mut outbound, wake).await {
            Wake::Shutdown => break,
            Wake::Reconnect => {
                shared.counters.lock().consecutive_failures = 0;
            }
            Wake::Elapsed => {}
        }
    }

    while let Ok(frame) = outbound.try_recv() {
        let _ = frame.ack.send(Err(SyncError::NotConnected));
    }
    shared.set_state(ConnectionState::Disconnected);
    debug!("connection task stopped");
}
