//! # gymsync engine
//!
//! Real-time sync engine for the gym-management client.
//!
//! This crate provides:
//! - A connection manager that owns the WebSocket lifecycle (connect,
//!   authenticate, answer pings, reconnect with linear backoff)
//! - A FIFO outbound queue with at-least-once delivery and a retry cap
//! - A conflict resolver with per-table strategies and a bounded history
//! - The [`SyncEngine`], which wires them together and exposes the public
//!   API: `send_operation`, status and statistics, selective sync and
//!   observer callbacks
//!
//! ## Architecture
//!
//! ```text
//! send_operation ──► OperationQueue ──► sender loop ──┐
//!                                                      ▼
//!                                              ConnectionManager ◄──► server
//!                                                      │
//! data callbacks ◄── dispatcher ◄── receiver loop ◄────┘
//!                                        │
//!                                 ConflictResolver
//! ```
//!
//! ## Key Invariants
//!
//! - The connection state has a single writer and is the only source of
//!   truth for whether frames can be sent
//! - Operations on the same table are sent in enqueue order
//! - A frame whose checksum does not verify is never applied
//! - Operations produced by this device are never re-applied
//! - Callbacks never run on the sender or receiver loops

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod callbacks;
mod config;
mod connection;
mod engine;
mod error;
mod providers;
mod queue;
mod resolver;
mod transport;
mod websocket;

pub use callbacks::{
    ConflictCallback, DataCallback, DataChange, StatusCallback, StatusEvent, ALL_TABLES,
};
pub use config::{ReconnectConfig, SyncConfig, DEFAULT_WEBSOCKET_URL};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionState, ConnectionStats,
};
pub use engine::{SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use providers::{ConfigProvider, MemoryConfigProvider, StaticTokenProvider, TokenProvider};
pub use queue::{OperationQueue, QueuedOperation};
pub use resolver::{
    default_policies, ConflictResolver, ConflictStats, Resolution, Winner, DEFAULT_HISTORY_LIMIT,
    VOLATILE_FIELDS,
};
pub use transport::{ConnectRequest, Connection, Connector, MockConnector, MockServer};
pub use websocket::{WebSocketConnector, CAPABILITIES_HEADER, DEVICE_ID_HEADER};
