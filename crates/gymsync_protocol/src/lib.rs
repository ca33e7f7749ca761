//! # gymsync protocol
//!
//! Wire types and the envelope codec shared by the gymsync client.
//!
//! This crate provides:
//! - `SyncOperation`, the immutable unit of replication
//! - Conflict records and the resolution strategy set
//! - The JSON message set (`auth`, `sync_operation`, `conflict`, `status`,
//!   `ping`/`pong`)
//! - The `Compressor`, which wraps every payload in an integrity-checked
//!   envelope and compresses it only when that pays off

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compression;
mod conflict;
mod error;
mod messages;
mod operation;

pub use compression::{
    digest, CompressionSettings, CompressionStats, Compressor, Envelope,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_DECODED_SIZE,
    DEFAULT_MIN_RATIO,
};
pub use conflict::{ConflictData, ConflictType, ResolutionStrategy};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{Capabilities, SyncMessage};
pub use operation::{
    checksum, into_record, record_id, OperationIdGenerator, OperationType, Origin, Record,
    SyncOperation,
};
