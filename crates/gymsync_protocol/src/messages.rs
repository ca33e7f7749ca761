//! Protocol messages carried inside envelopes.

use crate::conflict::ConflictData;
use crate::operation::{Record, SyncOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Features this client announces to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the client accepts compressed envelopes.
    pub compression: bool,
    /// Whether inbound replication is restricted to `tables`.
    pub selective_sync: bool,
    /// Tables subscribed to when selective sync is on.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl Capabilities {
    /// Capabilities with every table subscribed.
    pub fn all_tables(compression: bool) -> Self {
        Self {
            compression,
            selective_sync: false,
            tables: Vec::new(),
        }
    }

    /// Capabilities restricted to `tables`.
    pub fn selective(compression: bool, tables: Vec<String>) -> Self {
        Self {
            compression,
            selective_sync: true,
            tables,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A decoded protocol message, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Client handshake sent right after the socket opens.
    Auth {
        /// Authenticated user.
        user_id: String,
        /// This device.
        device_id: String,
        /// Announced features.
        capabilities: Capabilities,
    },
    /// Server acknowledgement of the handshake.
    AuthAck {
        /// Whether the server accepted the handshake.
        #[serde(default = "default_true")]
        success: bool,
        /// Optional server note.
        #[serde(default)]
        message: Option<String>,
    },
    /// A replicated operation (both directions).
    #[serde(rename = "sync_operation")]
    Operation {
        /// The operation.
        operation: SyncOperation,
    },
    /// A conflict detected by the server.
    Conflict {
        /// The conflict.
        conflict: ConflictData,
    },
    /// Arbitrary server status, logged only.
    Status {
        /// Status fields.
        #[serde(flatten)]
        payload: Record,
    },
    /// Server liveness check.
    Ping {
        /// Server clock, in whatever form the server sends.
        #[serde(default)]
        timestamp: Option<Value>,
        /// Client the ping is addressed to.
        #[serde(default)]
        client_id: Option<String>,
    },
    /// Reply to a ping.
    Pong {
        /// Client clock.
        timestamp: DateTime<Utc>,
        /// This device.
        client_id: String,
    },
    /// Any message type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl SyncMessage {
    /// Builds the handshake message.
    pub fn auth(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        capabilities: Capabilities,
    ) -> Self {
        SyncMessage::Auth {
            user_id: user_id.into(),
            device_id: device_id.into(),
            capabilities,
        }
    }

    /// Builds a pong stamped with the current time.
    pub fn pong(client_id: impl Into<String>) -> Self {
        SyncMessage::Pong {
            timestamp: Utc::now(),
            client_id: client_id.into(),
        }
    }

    /// Wraps an operation.
    pub fn operation(operation: SyncOperation) -> Self {
        SyncMessage::Operation { operation }
    }

    /// Returns the wire `type` discriminator.
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Auth { .. } => "auth",
            SyncMessage::AuthAck { .. } => "auth_ack",
            SyncMessage::Operation { .. } => "sync_operation",
            SyncMessage::Conflict { .. } => "conflict",
            SyncMessage::Status { .. } => "status",
            SyncMessage::Ping { .. } => "ping",
            SyncMessage::Pong { .. } => "pong",
            SyncMessage::Unknown => "unknown",
        }
    }
}
