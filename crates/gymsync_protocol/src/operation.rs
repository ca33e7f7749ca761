//! Sync operations.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

/// A business record: field name to JSON value.
///
/// `serde_json::Map` keeps keys sorted, so serializing a record is
/// deterministic. The workspace must not enable serde_json's
/// `preserve_order` feature.
pub type Record = serde_json::Map<String, Value>;

/// Kind of mutation carried by a [`SyncOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// A new record.
    Create,
    /// A change to an existing record.
    Update,
    /// Removal of a record.
    Delete,
}

impl OperationType {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            _ => Err(ProtocolError::UnknownOperation(s.to_string())),
        }
    }
}

/// Extracts the business record id from a payload.
///
/// String and integer ids normalise to the same key, so `{"id": 7}` and
/// `{"id": "7"}` refer to the same record.
pub fn record_id(data: &Record) -> Option<String> {
    match data.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Computes the content hash of a record (hex SHA-256 of its JSON form).
pub fn checksum(data: &Record) -> String {
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Converts an arbitrary JSON value into a record.
pub fn into_record(value: Value) -> ProtocolResult<Record> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(ProtocolError::NotAnObject("null")),
        Value::Bool(_) => Err(ProtocolError::NotAnObject("bool")),
        Value::Number(_) => Err(ProtocolError::NotAnObject("number")),
        Value::String(_) => Err(ProtocolError::NotAnObject("string")),
        Value::Array(_) => Err(ProtocolError::NotAnObject("array")),
    }
}

/// Who produced an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    /// User that made the change.
    pub user_id: String,
    /// Device the change was made on.
    pub device_id: String,
}

impl Origin {
    /// Creates a new origin.
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

fn default_version() -> u32 {
    1
}

/// A single mutation to replicate.
///
/// Operations are immutable once constructed. Conflict resolution produces
/// a new payload and never touches the operations it compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    id: String,
    table: String,
    operation: OperationType,
    data: Record,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    origin_user_id: String,
    #[serde(default)]
    origin_device_id: String,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    checksum: String,
}

impl SyncOperation {
    /// Creates a new operation, computing its checksum.
    ///
    /// Fails if `data` carries no business record id.
    pub fn new(
        id: impl Into<String>,
        table: impl Into<String>,
        operation: OperationType,
        data: Record,
        timestamp: DateTime<Utc>,
        origin: Origin,
    ) -> ProtocolResult<Self> {
        let table = table.into();
        if record_id(&data).is_none() {
            return Err(ProtocolError::MissingRecordId { table });
        }
        let checksum = checksum(&data);
        Ok(Self {
            id: id.into(),
            table,
            operation,
            data,
            timestamp,
            origin_user_id: origin.user_id,
            origin_device_id: origin.device_id,
            version: default_version(),
            checksum,
        })
    }

    /// Returns a copy of this operation with a different version number.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Operation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logical table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Operation kind.
    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Record payload.
    pub fn data(&self) -> &Record {
        &self.data
    }

    /// When the operation was produced.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// User that produced the operation.
    pub fn origin_user_id(&self) -> &str {
        &self.origin_user_id
    }

    /// Device that produced the operation.
    pub fn origin_device_id(&self) -> &str {
        &self.origin_device_id
    }

    /// Version number (defaults to 1).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Content hash of `data`.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Business record id embedded in `data`.
    pub fn record_id(&self) -> Option<String> {
        record_id(&self.data)
    }

    /// Returns true if the carried checksum matches the payload.
    ///
    /// Operations received without a checksum are accepted.
    pub fn verify_checksum(&self) -> bool {
        self.checksum.is_empty() || self.checksum == checksum(&self.data)
    }

    /// Returns true if this operation was produced on `device_id`.
    pub fn is_from_device(&self, device_id: &str) -> bool {
        !self.origin_device_id.is_empty() && self.origin_device_id == device_id
    }

    /// Returns true if both operations target the same table and record.
    pub fn same_record(&self, other: &SyncOperation) -> bool {
        self.table == other.table
            && matches!((self.record_id(), other.record_id()), (Some(a), Some(b)) if a == b)
    }
}

/// Hands out unique operation ids of the form `<table>_<millis>`.
///
/// Stamps are strictly increasing per generator: two operations created in
/// the same millisecond get consecutive stamps instead of colliding.
#[derive(Debug, Default)]
pub struct OperationIdGenerator {
    last_millis: AtomicI64,
}

impl OperationIdGenerator {
    /// Creates a new generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id for `table`, stamped no earlier than `now`.
    pub fn next_id(&self, table: &str, now: DateTime<Utc>) -> String {
        let now_ms = now.timestamp_millis();
        let mut prev = self.last_millis.load(Ordering::Relaxed);
        loop {
            let candidate = now_ms.max(prev.saturating_add(1));
            match self.last_millis.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{table}_{candidate}"),
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        into_record(value).unwrap()
    }

    #[test]
    fn operation_type_parsing() {
        assert_eq!("update".parse::<OperationType>().unwrap(), OperationType::Update);
        assert_eq!("DELETE".parse::<OperationType>().unwrap(), OperationType::Delete);
        assert!("UPSERT".parse::<OperationType>().is_err());
        assert_eq!(OperationType::Create.to_string(), "CREATE");
    }

    #[test]
    fn record_id_normalises_numbers_and_strings() {
        assert_eq!(record_id(&record(json!({"id": 7}))), Some("7".into()));
        assert_eq!(record_id(&record(json!({"id": "7"}))), Some("7".into()));
        assert_eq!(record_id(&record(json!({"id": ""}))), None);
        assert_eq!(record_id(&record(json!({"monto": 50}))), None);
    }

    #[test]
    fn checksum_ignores_insertion_order() {
        let mut a = Record::new();
        a.insert("id".into(), json!(1));
        a.insert("nombre".into(), json!("Ana"));
        let mut b = Record::new();
        b.insert("nombre".into(), json!("Ana"));
        b.insert("id".into(), json!(1));
        assert_eq!(checksum(&a), checksum(&b));
        assert_ne!(checksum(&a), checksum(&record(json!({"id": 2}))));
    }

    #[test]
    fn new_requires_record_id() {
        let err = SyncOperation::new(
            "pagos_1",
            "pagos",
            OperationType::Update,
            record(json!({"monto": 50})),
            Utc::now(),
            Origin::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingRecordId { .. }));
    }

    #[test]
    fn operation_wire_shape() {
        let op = SyncOperation::new(
            "pagos_1",
            "pagos",
            OperationType::Update,
            record(json!({"id": 7, "monto": 50})),
            Utc::now(),
            Origin::new("u1", "d1"),
        )
        .unwrap();

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["operation"], "UPDATE");
        assert_eq!(value["version"], 1);
        assert_eq!(value["origin_device_id"], "d1");

        let decoded: SyncOperation = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, op);
        assert!(decoded.verify_checksum());
        assert!(decoded.is_from_device("d1"));
        assert!(!decoded.is_from_device("d2"));
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let decoded: SyncOperation = serde_json::from_value(json!({
            "id": "clases_5",
            "table": "clases",
            "operation": "CREATE",
            "data": {"id": 5},
            "timestamp": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(decoded.version(), 1);
        assert!(decoded.checksum().is_empty());
        assert!(decoded.verify_checksum());
        assert_eq!(decoded.record_id(), Some("5".into()));
    }

    #[test]
    fn id_generator_never_repeats_within_a_millisecond() {
        let ids = OperationIdGenerator::new();
        let now = Utc::now();
        let first = ids.next_id("pagos", now);
        let second = ids.next_id("pagos", now);
        let third = ids.next_id("usuarios", now);
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert!(first.starts_with("pagos_"));
        assert!(third.starts_with("usuarios_"));
    }

    #[test]
    fn same_record_compares_table_and_id() {
        let now = Utc::now();
        let a = SyncOperation::new(
            "a",
            "pagos",
            OperationType::Update,
            record(json!({"id": 7})),
            now,
            Origin::default(),
        )
        .unwrap();
        let b = SyncOperation::new(
            "b",
            "pagos",
            OperationType::Delete,
            record(json!({"id": "7"})),
            now,
            Origin::default(),
        )
        .unwrap();
        let c = SyncOperation::new(
            "c",
            "clases",
            OperationType::Delete,
            record(json!({"id": 7})),
            now,
            Origin::default(),
        )
        .unwrap();
        assert!(a.same_record(&b));
        assert!(!a.same_record(&c));
    }
}
