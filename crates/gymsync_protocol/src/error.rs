//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building, encoding or decoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload could not be serialized or parsed as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checksum of the decoded bytes does not match the envelope.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// Checksum carried by the envelope.
        expected: String,
        /// Checksum recomputed over the received bytes.
        actual: String,
    },

    /// Compressed bytes could not be produced or inflated.
    #[error("compression error: {0}")]
    Compression(String),

    /// Transport encoding (base64) of the envelope data is invalid.
    #[error("invalid envelope encoding: {0}")]
    Encoding(String),

    /// A record payload is missing its business id.
    #[error("record in table {table} has no `id` field")]
    MissingRecordId {
        /// Table the record belongs to.
        table: String,
    },

    /// A record payload is not a JSON object.
    #[error("record payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Unknown operation kind.
    #[error("unknown operation type: {0}")]
    UnknownOperation(String),

    /// Unknown resolution strategy name.
    #[error("unknown resolution strategy: {0}")]
    UnknownStrategy(String),
}

impl ProtocolError {
    /// Returns true if the error indicates tampering or corruption in transit.
    pub fn is_integrity(&self) -> bool {
        matches!(self, ProtocolError::Integrity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_classification() {
        let err = ProtocolError::Integrity {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.is_integrity());
        assert!(err.to_string().contains("aa"));
        assert!(!ProtocolError::Compression("truncated".into()).is_integrity());
    }

    #[test]
    fn missing_id_names_table() {
        let err = ProtocolError::MissingRecordId {
            table: "pagos".into(),
        };
        assert_eq!(err.to_string(), "record in table pagos has no `id` field");
    }
}
