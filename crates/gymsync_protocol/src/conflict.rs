//! Conflict records and resolution strategies.

use crate::error::ProtocolError;
use crate::operation::{OperationType, Record, SyncOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How two versions of a record diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Same operation kind, different content.
    DataConflict,
    /// Different operation kinds (e.g. local UPDATE vs remote DELETE).
    OperationConflict,
}

/// Policy used to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// The remote payload always wins.
    ServerWins,
    /// The local payload always wins.
    ClientWins,
    /// The side with the later `updated_at`/`timestamp` wins.
    Timestamp,
    /// Field-by-field reconciliation.
    Merge,
    /// Needs human review; settles like `ServerWins` in the meantime.
    #[default]
    Manual,
}

impl ResolutionStrategy {
    /// All strategies, in declaration order.
    pub const ALL: [ResolutionStrategy; 5] = [
        ResolutionStrategy::ServerWins,
        ResolutionStrategy::ClientWins,
        ResolutionStrategy::Timestamp,
        ResolutionStrategy::Merge,
        ResolutionStrategy::Manual,
    ];

    /// Returns the wire name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ServerWins => "SERVER_WINS",
            ResolutionStrategy::ClientWins => "CLIENT_WINS",
            ResolutionStrategy::Timestamp => "TIMESTAMP",
            ResolutionStrategy::Merge => "MERGE",
            ResolutionStrategy::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == wanted)
            .ok_or_else(|| ProtocolError::UnknownStrategy(s.to_string()))
    }
}

fn default_operation() -> OperationType {
    OperationType::Update
}

/// A detected divergence between a local and a remote operation on the
/// same `(table, record id)`.
///
/// Conflict records are transient: they are consumed right away to produce
/// a resolved payload and then kept only in a bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictData {
    /// Table of the record.
    pub table: String,
    /// Business record id.
    #[serde(default)]
    pub record_id: String,
    /// Local operation kind.
    #[serde(default = "default_operation")]
    pub local_operation: OperationType,
    /// Remote operation kind.
    #[serde(default = "default_operation")]
    pub remote_operation: OperationType,
    /// Local payload.
    pub local_data: Record,
    /// Remote payload.
    pub remote_data: Record,
    /// When the local operation was produced.
    #[serde(default)]
    pub local_timestamp: Option<DateTime<Utc>>,
    /// When the remote operation was produced.
    #[serde(default)]
    pub remote_timestamp: Option<DateTime<Utc>>,
    /// Kind of divergence.
    pub conflict_type: ConflictType,
    /// When the divergence was detected.
    #[serde(default = "Utc::now")]
    pub detected_at: DateTime<Utc>,
    /// Strategy actually applied.
    #[serde(default)]
    pub resolution: Option<ResolutionStrategy>,
    /// When the conflict was resolved.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictData {
    /// Builds a conflict record from the two diverging operations.
    pub fn between(local: &SyncOperation, remote: &SyncOperation, conflict_type: ConflictType) -> Self {
        Self {
            table: remote.table().to_string(),
            record_id: remote.record_id().unwrap_or_default(),
            local_operation: local.operation(),
            remote_operation: remote.operation(),
            local_data: local.data().clone(),
            remote_data: remote.data().clone(),
            local_timestamp: Some(local.timestamp()),
            remote_timestamp: Some(remote.timestamp()),
            conflict_type,
            detected_at: Utc::now(),
            resolution: None,
            resolved_at: None,
        }
    }

    /// Records the strategy that settled this conflict.
    pub fn mark_resolved(&mut self, strategy: ResolutionStrategy, at: DateTime<Utc>) {
        self.resolution = Some(strategy);
        self.resolved_at = Some(at);
    }

    /// Returns true once a resolution has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{into_record, Origin};
    use serde_json::json;

    fn op(kind: OperationType, data: serde_json::Value) -> SyncOperation {
        SyncOperation::new(
            "usuarios_1",
            "usuarios",
            kind,
            into_record(data).unwrap(),
            Utc::now(),
            Origin::default(),
        )
        .unwrap()
    }

    #[test]
    fn strategy_names() {
        assert_eq!(ResolutionStrategy::ServerWins.to_string(), "SERVER_WINS");
        assert_eq!(
            "client_wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::ClientWins
        );
        assert_eq!(
            "server-wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::ServerWins
        );
        assert!("random".parse::<ResolutionStrategy>().is_err());
        assert_eq!(ResolutionStrategy::default(), ResolutionStrategy::Manual);
    }

    #[test]
    fn conflict_type_wire_names() {
        assert_eq!(
            serde_json::to_value(ConflictType::OperationConflict).unwrap(),
            json!("OPERATION_CONFLICT")
        );
        assert_eq!(
            serde_json::to_value(ResolutionStrategy::Timestamp).unwrap(),
            json!("TIMESTAMP")
        );
    }

    #[test]
    fn between_copies_both_sides() {
        let local = op(OperationType::Update, json!({"id": 3, "nombre": "Ana"}));
        let remote = op(OperationType::Delete, json!({"id": 3}));

        let mut conflict = ConflictData::between(&local, &remote, ConflictType::OperationConflict);
        assert_eq!(conflict.record_id, "3");
        assert_eq!(conflict.local_operation, OperationType::Update);
        assert_eq!(conflict.remote_operation, OperationType::Delete);
        assert_eq!(&conflict.local_data, local.data());
        assert!(!conflict.is_resolved());

        let now = Utc::now();
        conflict.mark_resolved(ResolutionStrategy::ServerWins, now);
        assert!(conflict.is_resolved());
        assert_eq!(conflict.resolved_at, Some(now));
    }

    #[test]
    fn server_conflict_payload_uses_defaults() {
        let conflict: ConflictData = serde_json::from_value(json!({
            "table": "pagos",
            "local_data": {"id": 1, "monto": 10},
            "remote_data": {"id": 1, "monto": 20},
            "conflict_type": "DATA_CONFLICT"
        }))
        .unwrap();
        assert_eq!(conflict.local_operation, OperationType::Update);
        assert_eq!(conflict.resolution, None);
        assert!(conflict.record_id.is_empty());
    }
}
