//! Transport layer abstraction for the sync connection.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use gymsync_protocol::{Capabilities, Compressor, SyncMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything needed to open an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Server endpoint.
    pub url: String,
    /// Bearer token, sent as `Authorization: Bearer <token>`.
    pub token: String,
    /// Authenticated user.
    pub user_id: String,
    /// This device.
    pub device_id: String,
    /// Capabilities announced with the handshake.
    pub capabilities: Capabilities,
}

/// An open, message-oriented connection carrying text frames.
#[async_trait]
pub trait Connection: Send {
    /// Sends one text frame.
    async fn send_text(&mut self, text: String) -> SyncResult<()>;

    /// Receives the next text frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly. Must
    /// be cancel safe: dropping the future loses no frame.
    async fn next_text(&mut self) -> SyncResult<Option<String>>;

    /// Closes the connection.
    async fn close(&mut self) -> SyncResult<()>;
}

/// Opens connections to the sync server.
///
/// This trait abstracts the network layer so the engine can run over a real
/// WebSocket or an in-memory mock in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self, request: &ConnectRequest) -> SyncResult<Box<dyn Connection>>;
}

enum ServerFrame {
    Text(String),
    Fail(String),
}

/// A mock connector for testing.
///
/// Every successful connect produces a [`MockServer`] handle that plays the
/// server side of the connection. Connect attempts can be scripted to fail.
pub struct MockConnector {
    connect_failures: AtomicU32,
    send_failures: Arc<AtomicU32>,
    attempts: AtomicU32,
    requests: Mutex<Vec<ConnectRequest>>,
    server_tx: mpsc::UnboundedSender<MockServer>,
    server_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServer>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Creates a connector whose connects always succeed.
    pub fn new() -> Self {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Self {
            connect_failures: AtomicU32::new(0),
            send_failures: Arc::new(AtomicU32::new(0)),
            attempts: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            server_tx,
            server_rx: tokio::sync::Mutex::new(server_rx),
        }
    }

    /// Creates a connector whose first `failures` connects fail.
    pub fn failing(failures: u32) -> Self {
        let connector = Self::new();
        connector.set_connect_failures(failures);
        connector
    }

    /// Makes the next `failures` connect attempts fail.
    pub fn set_connect_failures(&self, failures: u32) {
        self.connect_failures.store(failures, Ordering::SeqCst);
    }

    /// Makes the next `failures` frame sends fail, on any connection.
    pub fn fail_next_sends(&self, failures: u32) {
        self.send_failures.store(failures, Ordering::SeqCst);
    }

    /// Number of connect attempts so far, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().clone()
    }

    /// Waits for the server side of the next successful connection.
    pub async fn accept(&self) -> Option<MockServer> {
        self.server_rx.lock().await.recv().await
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> SyncResult<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if take_one(&self.connect_failures) {
            return Err(SyncError::connection_retryable("connection refused"));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let server = MockServer {
            request: request.clone(),
            from_client: client_rx,
            to_client: server_tx,
            compressor: Compressor::default(),
        };
        // A test that never accepts just sees its frames go nowhere.
        let _ = self.server_tx.send(server);

        Ok(Box::new(MockConnection {
            to_server: client_tx,
            from_server: server_rx,
            send_failures: Arc::clone(&self.send_failures),
        }))
    }
}

struct MockConnection {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<ServerFrame>,
    send_failures: Arc<AtomicU32>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_text(&mut self, text: String) -> SyncResult<()> {
        if take_one(&self.send_failures) {
            return Err(SyncError::connection_retryable("broken pipe"));
        }
        self.to_server
            .send(text)
            .map_err(|_| SyncError::connection_retryable("server went away"))
    }

    async fn next_text(&mut self) -> SyncResult<Option<String>> {
        match self.from_server.recv().await {
            Some(ServerFrame::Text(text)) => Ok(Some(text)),
            Some(ServerFrame::Fail(reason)) => Err(SyncError::connection_retryable(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.from_server.close();
        Ok(())
    }
}

/// Server side of a mock connection.
pub struct MockServer {
    request: ConnectRequest,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<ServerFrame>,
    compressor: Compressor,
}

impl MockServer {
    /// The request the client connected with.
    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Receives the next raw frame sent by the client.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Receives and decodes the next message sent by the client.
    pub async fn recv_message(&mut self) -> Option<SyncMessage> {
        let frame = self.recv_frame().await?;
        self.compressor.decode_frame(&frame).ok()
    }

    /// Receives messages until one matches `pred`.
    pub async fn recv_until<F>(&mut self, mut pred: F) -> Option<SyncMessage>
    where
        F: FnMut(&SyncMessage) -> bool,
    {
        loop {
            let message = self.recv_message().await?;
            if pred(&message) {
                return Some(message);
            }
        }
    }

    /// Sends a raw frame to the client.
    pub fn send_frame(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(ServerFrame::Text(frame.into())).is_ok()
    }

    /// Encodes and sends a message to the client.
    pub fn send_message(&self, message: &SyncMessage) -> bool {
        match self.compressor.encode_frame(message) {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    /// Makes the client's next receive fail with a transport error.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_client.send(ServerFrame::Fail(reason.into())).is_ok()
    }

    /// Closes the connection from the server side.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            url: "ws://localhost/ws".into(),
            token: "t".into(),
            user_id: "u1".into(),
            device_id: "d1".into(),
            capabilities: Capabilities::all_tables(true),
        }
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let connector = MockConnector::failing(2);
        assert!(connector.connect(&request()).await.is_err());
        assert!(connector.connect(&request()).await.is_err());
        assert!(connector.connect(&request()).await.is_ok());
        assert_eq!(connector.connect_attempts(), 3);
        assert_eq!(connector.requests().len(), 3);
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let connector = MockConnector::new();
        let mut conn = connector.connect(&request()).await.unwrap();
        let mut server = connector.accept().await.unwrap();
        assert_eq!(server.request().device_id, "d1");

        conn.send_text("hola".into()).await.unwrap();
        assert_eq!(server.recv_frame().await.as_deref(), Some("hola"));

        server.send_frame("adios");
        assert_eq!(conn.next_text().await.unwrap().as_deref(), Some("adios"));

        server.fail("reset");
        assert!(conn.next_text().await.is_err());

        server.close();
        assert_eq!(conn.next_text().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_failures_are_scripted() {
        let connector = MockConnector::new();
        let mut conn = connector.connect(&request()).await.unwrap();
        let _server = connector.accept().await.unwrap();

        connector.fail_next_sends(1);
        let err = conn.send_text("a".into()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(conn.send_text("b".into()).await.is_ok());
    }
}
