//! Conflict detection and resolution.
//!
//! The resolver compares a locally pending operation with a remote one for
//! the same record and, when they diverge, settles the divergence with the
//! strategy configured for the table. It performs no I/O; the only state it
//! keeps is a bounded history of resolved conflicts and a few counters.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use gymsync_protocol::{
    ConflictData, ConflictType, OperationType, Record, ResolutionStrategy, SyncOperation,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

/// Fields ignored when comparing two payloads for a data conflict.
pub const VOLATILE_FIELDS: [&str; 4] = ["updated_at", "version", "checksum", "device_id"];

/// Default number of resolved conflicts kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Per-table strategies used when nothing else is configured.
pub fn default_policies() -> HashMap<String, ResolutionStrategy> {
    [
        ("pagos", ResolutionStrategy::ServerWins),
        ("clases", ResolutionStrategy::ServerWins),
        ("membresias", ResolutionStrategy::ServerWins),
        ("usuarios", ResolutionStrategy::Timestamp),
        ("empleados", ResolutionStrategy::Timestamp),
        ("asistencias", ResolutionStrategy::Merge),
        ("preferencias", ResolutionStrategy::ClientWins),
    ]
    .into_iter()
    .map(|(table, strategy)| (table.to_string(), strategy))
    .collect()
}

/// Which version a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// The remote payload, unchanged.
    Remote,
    /// The local payload, unchanged.
    Local,
    /// A combination of both payloads.
    Merged,
}

/// The payload to apply after a conflict has been settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Resolved record.
    pub data: Record,
    /// Operation kind of the winning side.
    pub operation: OperationType,
    /// Strategy actually applied.
    pub strategy: ResolutionStrategy,
    /// Version the resolved record comes from.
    pub winner: Winner,
}

/// Conflict statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictStats {
    /// Conflicts resolved since start.
    pub total_conflicts: u64,
    /// Same-kind conflicts with different content.
    pub data_conflicts: u64,
    /// Conflicts between different operation kinds.
    pub operation_conflicts: u64,
    /// Resolutions per applied strategy.
    pub by_strategy: BTreeMap<String, u64>,
    /// History entries awaiting human review.
    pub manual_backlog: usize,
    /// Entries currently held in history.
    pub history_len: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    data: u64,
    operation: u64,
    by_strategy: BTreeMap<String, u64>,
}

/// Detects and resolves conflicts between replicas.
#[derive(Debug)]
pub struct ConflictResolver {
    policies: HashMap<String, ResolutionStrategy>,
    default_strategy: ResolutionStrategy,
    history: RwLock<VecDeque<ConflictData>>,
    history_limit: usize,
    counters: Mutex<Counters>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(default_policies(), DEFAULT_HISTORY_LIMIT)
    }
}

impl ConflictResolver {
    /// Creates a resolver with the given table policies.
    pub fn new(policies: HashMap<String, ResolutionStrategy>, history_limit: usize) -> Self {
        Self {
            policies,
            default_strategy: ResolutionStrategy::Manual,
            history: RwLock::new(VecDeque::new()),
            history_limit,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Creates a resolver from the default policies plus `overrides`.
    pub fn with_overrides(
        overrides: &HashMap<String, ResolutionStrategy>,
        history_limit: usize,
    ) -> Self {
        let mut policies = default_policies();
        policies.extend(overrides.iter().map(|(t, s)| (t.clone(), *s)));
        Self::new(policies, history_limit)
    }

    /// Returns the strategy used for `table`.
    pub fn strategy_for(&self, table: &str) -> ResolutionStrategy {
        self.policies
            .get(table)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Checks whether two operations on the same record diverge.
    ///
    /// Operations on different tables or records never conflict. Operations
    /// of different kinds always do. Operations of the same kind conflict
    /// when their payloads differ outside [`VOLATILE_FIELDS`].
    pub fn detect(&self, local: &SyncOperation, remote: &SyncOperation) -> Option<ConflictData> {
        if !local.same_record(remote) {
            return None;
        }

        if local.operation() != remote.operation() {
            return Some(ConflictData::between(
                local,
                remote,
                ConflictType::OperationConflict,
            ));
        }

        if !local.checksum().is_empty() && local.checksum() == remote.checksum() {
            return None;
        }
        if strip_volatile(local.data()) == strip_volatile(remote.data()) {
            return None;
        }
        Some(ConflictData::between(
            local,
            remote,
            ConflictType::DataConflict,
        ))
    }

    /// Resolves a conflict with the strategy configured for its table.
    pub fn resolve(&self, conflict: &mut ConflictData) -> Resolution {
        let strategy = self.strategy_for(&conflict.table);
        self.resolve_with(conflict, strategy)
    }

    /// Resolves a conflict with an explicit strategy.
    ///
    /// Always yields a usable payload: if the strategy fails internally the
    /// remote payload wins. The applied strategy and resolution time are
    /// recorded on `conflict` before returning.
    pub fn resolve_with(
        &self,
        conflict: &mut ConflictData,
        strategy: ResolutionStrategy,
    ) -> Resolution {
        let resolution = match apply_strategy(strategy, conflict) {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(
                    table = %conflict.table,
                    record_id = %conflict.record_id,
                    %strategy,
                    error = %err,
                    "conflict strategy failed, keeping remote payload"
                );
                server_wins(conflict)
            }
        };

        conflict.mark_resolved(resolution.strategy, Utc::now());
        debug!(
            table = %conflict.table,
            record_id = %conflict.record_id,
            strategy = %resolution.strategy,
            "conflict resolved"
        );
        self.record(conflict);
        resolution
    }

    fn record(&self, conflict: &ConflictData) {
        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            match conflict.conflict_type {
                ConflictType::DataConflict => counters.data += 1,
                ConflictType::OperationConflict => counters.operation += 1,
            }
            if let Some(strategy) = conflict.resolution {
                *counters
                    .by_strategy
                    .entry(strategy.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.write();
        history.push_back(conflict.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Returns a snapshot of the conflict history, oldest first.
    pub fn history(&self) -> Vec<ConflictData> {
        self.history.read().iter().cloned().collect()
    }

    /// Returns history entries resolved under [`ResolutionStrategy::Manual`].
    pub fn manual_backlog(&self) -> Vec<ConflictData> {
        self.history
            .read()
            .iter()
            .filter(|c| c.resolution == Some(ResolutionStrategy::Manual))
            .cloned()
            .collect()
    }

    /// Returns conflict statistics.
    pub fn stats(&self) -> ConflictStats {
        let (history_len, manual_backlog) = {
            let history = self.history.read();
            let manual = history
                .iter()
                .filter(|c| c.resolution == Some(ResolutionStrategy::Manual))
                .count();
            (history.len(), manual)
        };
        let counters = self.counters.lock();
        ConflictStats {
            total_conflicts: counters.total,
            data_conflicts: counters.data,
            operation_conflicts: counters.operation,
            by_strategy: counters.by_strategy.clone(),
            manual_backlog,
            history_len,
        }
    }
}

fn strip_volatile(data: &Record) -> Record {
    data.iter()
        .filter(|(key, _)| !VOLATILE_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn server_wins(conflict: &ConflictData) -> Resolution {
    Resolution {
        data: conflict.remote_data.clone(),
        operation: conflict.remote_operation,
        strategy: ResolutionStrategy::ServerWins,
        winner: Winner::Remote,
    }
}

fn client_wins(conflict: &ConflictData) -> Resolution {
    Resolution {
        data: conflict.local_data.clone(),
        operation: conflict.local_operation,
        strategy: ResolutionStrategy::ClientWins,
        winner: Winner::Local,
    }
}

fn apply_strategy(
    strategy: ResolutionStrategy,
    conflict: &ConflictData,
) -> SyncResult<Resolution> {
    match strategy {
        ResolutionStrategy::ServerWins => Ok(server_wins(conflict)),
        ResolutionStrategy::ClientWins => Ok(client_wins(conflict)),
        ResolutionStrategy::Timestamp => {
            let local = effective_timestamp(&conflict.local_data, conflict.local_timestamp);
            let remote = effective_timestamp(&conflict.remote_data, conflict.remote_timestamp);
            match (local, remote) {
                (Some(local), Some(remote)) if local > remote => Ok(Resolution {
                    strategy: ResolutionStrategy::Timestamp,
                    ..client_wins(conflict)
                }),
                (Some(_), Some(_)) => Ok(Resolution {
                    strategy: ResolutionStrategy::Timestamp,
                    ..server_wins(conflict)
                }),
                _ => {
                    debug!(
                        table = %conflict.table,
                        "timestamp missing or unparseable, falling back to server wins"
                    );
                    Ok(server_wins(conflict))
                }
            }
        }
        ResolutionStrategy::Merge => match conflict.conflict_type {
            // Field merging is only defined between two versions of the same kind.
            ConflictType::OperationConflict => Ok(server_wins(conflict)),
            ConflictType::DataConflict => Ok(Resolution {
                data: merge_records(&conflict.local_data, &conflict.remote_data)?,
                operation: conflict.remote_operation,
                strategy: ResolutionStrategy::Merge,
                winner: Winner::Merged,
            }),
        },
        ResolutionStrategy::Manual => Ok(Resolution {
            strategy: ResolutionStrategy::Manual,
            ..server_wins(conflict)
        }),
    }
}

/// Returns the instant a payload was last modified.
///
/// `updated_at` in the payload takes precedence, then a `timestamp` field,
/// then the operation timestamp. A field that is present but unparseable
/// yields `None`.
fn effective_timestamp(data: &Record, fallback: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match data.get("updated_at").or_else(|| data.get("timestamp")) {
        Some(value) => parse_timestamp(value),
        None => fallback,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Field-by-field merge: keys missing on one side come from the other,
/// numbers take the maximum, strings take the longer value and anything
/// else takes the remote value.
fn merge_records(local: &Record, remote: &Record) -> SyncResult<Record> {
    let mut merged = local.clone();
    for (key, remote_value) in remote {
        let value = match local.get(key) {
            None => remote_value.clone(),
            Some(local_value) => merge_values(key, local_value, remote_value)?,
        };
        merged.insert(key.clone(), value);
    }
    Ok(merged)
}

fn merge_values(key: &str, local: &Value, remote: &Value) -> SyncResult<Value> {
    match (local, remote) {
        (Value::Number(l), Value::Number(r)) => max_number(l, r).map(Value::Number).ok_or_else(|| {
            SyncError::ConflictResolution(format!("cannot compare numeric field {key:?}"))
        }),
        (Value::String(l), Value::String(r)) => {
            if l.chars().count() > r.chars().count() {
                Ok(local.clone())
            } else {
                Ok(remote.clone())
            }
        }
        _ => Ok(remote.clone()),
    }
}

fn max_number(local: &Number, remote: &Number) -> Option<Number> {
    if let (Some(l), Some(r)) = (local.as_i64(), remote.as_i64()) {
        return Some(Number::from(l.max(r)));
    }
    if let (Some(l), Some(r)) = (local.as_u64(), remote.as_u64()) {
        return Some(Number::from(l.max(r)));
    }
    let (l, r) = (local.as_f64()?, remote.as_f64()?);
    if l > r {
        Some(local.clone())
    } else {
        Some(remote.clone())
    }
}
