//! Error types for the sync engine.

use gymsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport-level failure; drives the reconnect state machine.
    #[error("connection error: {message}")]
    Connection {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Checksum mismatch on an inbound envelope.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// Checksum carried by the envelope.
        expected: String,
        /// Checksum of the received bytes.
        actual: String,
    },

    /// Malformed JSON or an envelope that could not be opened.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal fault while applying a resolution strategy.
    #[error("conflict resolution failed: {0}")]
    ConflictResolution(String),

    /// An outbound operation failed more times than allowed.
    #[error("delivery of operation {operation_id} failed after {attempts} attempts")]
    DeliveryExhausted {
        /// Operation id.
        operation_id: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Not connected to the server.
    #[error("not connected to server")]
    NotConnected,

    /// Outbound message rate limit reached.
    #[error("outbound rate limit of {limit} messages per minute reached")]
    RateLimited {
        /// Messages allowed per minute.
        limit: u32,
    },

    /// The outbound queue is at capacity.
    #[error("operation queue is full ({capacity} operations)")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The caller passed an operation that cannot be replicated.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The engine has been stopped.
    #[error("sync engine stopped")]
    Stopped,

    /// Timed out waiting on the transport.
    #[error("operation timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a retryable connection error.
    pub fn connection_retryable(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable connection error.
    pub fn connection_fatal(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connection { retryable, .. } => *retryable,
            SyncError::NotConnected | SyncError::RateLimited { .. } | SyncError::Timeout => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Integrity { expected, actual } => {
                SyncError::Integrity { expected, actual }
            }
            ProtocolError::MissingRecordId { .. }
            | ProtocolError::NotAnObject(_)
            | ProtocolError::UnknownOperation(_)
            | ProtocolError::UnknownStrategy(_) => SyncError::InvalidOperation(err.to_string()),
            other => SyncError::Serialization(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Url(e) => SyncError::Config(e.to_string()),
            WsError::Http(response) => SyncError::connection_retryable(format!(
                "handshake rejected with status {}",
                response.status()
            )),
            other => SyncError::connection_retryable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::connection_retryable("reset by peer").is_retryable());
        assert!(!SyncError::connection_fatal("bad url").is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::RateLimited { limit: 60 }.is_retryable());
        assert!(!SyncError::Stopped.is_retryable());
        assert!(!SyncError::Integrity {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn protocol_errors_map_to_taxonomy() {
        let err: SyncError = ProtocolError::Integrity {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(matches!(err, SyncError::Integrity { .. }));

        let err: SyncError = ProtocolError::MissingRecordId {
            table: "pagos".into(),
        }
        .into();
        assert!(matches!(err, SyncError::InvalidOperation(_)));

        let err: SyncError = ProtocolError::Compression("truncated".into()).into();
        assert!(matches!(err, SyncError::Serialization(_)));
    }

    #[test]
    fn error_display() {
        let err = SyncError::DeliveryExhausted {
            operation_id: "pagos_17".into(),
            attempts: 3,
        };
        assert!(err.to_string().contains("pagos_17"));
        assert!(err.to_string().contains('3'));
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to server");
    }
}
