//! Envelope codec: conditional compression with integrity checksums.
//!
//! Every frame on the wire is an [`Envelope`]. Small payloads travel as
//! plain JSON text; payloads above the size threshold are zstd-compressed
//! and base64-encoded, but only when that actually saves space.
//!
//! The checksum is always computed over the serialized (uncompressed)
//! payload bytes, so the receiver can verify what it is about to parse
//! regardless of how it travelled.

use crate::error::{ProtocolError, ProtocolResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

/// Payloads at or below this many bytes are never compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Compressed output must be smaller than this fraction of the original.
pub const DEFAULT_MIN_RATIO: f64 = 0.9;

/// Default zstd level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Largest payload a compressed envelope may inflate to.
pub const DEFAULT_MAX_DECODED_SIZE: usize = 16 * 1024 * 1024;

/// The wire wrapper around every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Whether `data` holds compressed bytes.
    pub compressed: bool,
    /// JSON text, or base64 of the zstd frame when compressed.
    pub data: String,
    /// Hex SHA-256 of the serialized payload.
    pub checksum: String,
    /// Serialized size before compression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<usize>,
    /// Size of the zstd frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<usize>,
}

impl Envelope {
    /// Serializes the envelope into a text frame.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a text frame into an envelope.
    pub fn from_json(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Compression knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionSettings {
    /// When false, payloads are never compressed (decoding still works).
    pub enabled: bool,
    /// Minimum serialized size before compression is attempted.
    pub threshold: usize,
    /// Required compressed/original ratio for compression to be kept.
    pub min_ratio: f64,
    /// zstd level.
    pub level: i32,
    /// Upper bound on the inflated size of a compressed envelope.
    pub max_decoded_size: usize,
}

impl CompressionSettings {
    /// Settings that never compress.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the size threshold.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the required ratio.
    pub fn with_min_ratio(mut self, min_ratio: f64) -> Self {
        self.min_ratio = min_ratio;
        self
    }

    /// Sets the zstd level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Sets the inflated size limit.
    pub fn with_max_decoded_size(mut self, max_decoded_size: usize) -> Self {
        self.max_decoded_size = max_decoded_size;
        self
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
            min_ratio: DEFAULT_MIN_RATIO,
            level: DEFAULT_COMPRESSION_LEVEL,
            max_decoded_size: DEFAULT_MAX_DECODED_SIZE,
        }
    }
}

/// Snapshot of the compressor's running counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    /// Envelopes sent compressed.
    pub compressed_messages: u64,
    /// Envelopes sent as plain JSON.
    pub uncompressed_messages: u64,
    /// Bytes before compression, over compressed envelopes.
    pub original_bytes: u64,
    /// Bytes after compression, over compressed envelopes.
    pub compressed_bytes: u64,
    /// Cumulative `compressed_bytes / original_bytes` (0 when nothing was compressed).
    pub compression_ratio: f64,
}

impl CompressionStats {
    /// Bytes saved by compression so far.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compressed_bytes)
    }
}

/// Hex SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Stateless envelope codec with running statistics.
#[derive(Debug, Default)]
pub struct Compressor {
    settings: CompressionSettings,
    compressed_messages: AtomicU64,
    uncompressed_messages: AtomicU64,
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl Compressor {
    /// Creates a compressor with the given settings.
    pub fn new(settings: CompressionSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Returns the active settings.
    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    /// Wraps `payload` in an envelope.
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> ProtocolResult<Envelope> {
        let text = serde_json::to_string(payload)?;
        let raw = text.as_bytes();
        let checksum = digest(raw);

        if self.settings.enabled && raw.len() > self.settings.threshold {
            let packed = zstd::stream::encode_all(raw, self.settings.level)
                .map_err(|e| ProtocolError::Compression(e.to_string()))?;

            if (packed.len() as f64) < raw.len() as f64 * self.settings.min_ratio {
                self.compressed_messages.fetch_add(1, Ordering::Relaxed);
                self.original_bytes
                    .fetch_add(raw.len() as u64, Ordering::Relaxed);
                self.compressed_bytes
                    .fetch_add(packed.len() as u64, Ordering::Relaxed);

                return Ok(Envelope {
                    compressed: true,
                    data: BASE64.encode(&packed),
                    checksum,
                    original_size: Some(raw.len()),
                    compressed_size: Some(packed.len()),
                });
            }
        }

        self.uncompressed_messages.fetch_add(1, Ordering::Relaxed);
        Ok(Envelope {
            compressed: false,
            data: text,
            checksum,
            original_size: None,
            compressed_size: None,
        })
    }

    /// Returns the verified payload bytes of an envelope.
    ///
    /// Fails with [`ProtocolError::Integrity`] when the checksum does not
    /// match; the bytes are never handed out in that case. Compressed data
    /// that inflates past its declared `original_size`, or past the
    /// configured maximum, is a [`ProtocolError::Compression`].
    pub fn open(&self, envelope: &Envelope) -> ProtocolResult<Vec<u8>> {
        let bytes = if envelope.compressed {
            let packed = BASE64
                .decode(envelope.data.as_bytes())
                .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
            let limit = match envelope.original_size {
                Some(size) => size.min(self.settings.max_decoded_size),
                None => self.settings.max_decoded_size,
            };
            inflate(&packed, limit)?
        } else {
            envelope.data.as_bytes().to_vec()
        };

        let actual = digest(&bytes);
        if actual != envelope.checksum {
            return Err(ProtocolError::Integrity {
                expected: envelope.checksum.clone(),
                actual,
            });
        }
        Ok(bytes)
    }

    /// Verifies and deserializes the payload of an envelope.
    pub fn decode<T: DeserializeOwned>(&self, envelope: &Envelope) -> ProtocolResult<T> {
        let bytes = self.open(envelope)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Encodes `payload` straight into a text frame.
    pub fn encode_frame<T: Serialize + ?Sized>(&self, payload: &T) -> ProtocolResult<String> {
        self.encode(payload)?.to_json()
    }

    /// Parses, verifies and deserializes a text frame.
    pub fn decode_frame<T: DeserializeOwned>(&self, frame: &str) -> ProtocolResult<T> {
        self.decode(&Envelope::from_json(frame)?)
    }

    /// Returns a snapshot of the running counters.
    pub fn stats(&self) -> CompressionStats {
        let original_bytes = self.original_bytes.load(Ordering::Relaxed);
        let compressed_bytes = self.compressed_bytes.load(Ordering::Relaxed);
        let compression_ratio = if original_bytes == 0 {
            0.0
        } else {
            compressed_bytes as f64 / original_bytes as f64
        };
        CompressionStats {
            compressed_messages: self.compressed_messages.load(Ordering::Relaxed),
            uncompressed_messages: self.uncompressed_messages.load(Ordering::Relaxed),
            original_bytes,
            compressed_bytes,
            compression_ratio,
        }
    }
}

/// Decompresses `packed`, reading at most one byte past `limit`.
fn inflate(packed: &[u8], limit: usize) -> ProtocolResult<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::new(packed)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    let mut bytes = Vec::new();
    decoder
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    if bytes.len() > limit {
        return Err(ProtocolError::Compression(format!(
            "payload inflates past {limit} bytes"
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn large_payload() -> Value {
        let rows: Vec<Value> = (0..200)
            .map(|i| json!({"id": i, "clase": "spinning", "sala": "A"}))
            .collect();
        json!({"type": "status", "rows": rows})
    }

    #[test]
    fn small_payload_travels_as_text() {
        let compressor = Compressor::default();
        let payload = json!({"type": "ping", "client_id": "d1"});

        let envelope = compressor.encode(&payload).unwrap();
        assert!(!envelope.compressed);
        assert_eq!(envelope.original_size, None);
        assert_eq!(envelope.data, serde_json::to_string(&payload).unwrap());

        let decoded: Value = compressor.decode(&envelope).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn large_repetitive_payload_is_compressed() {
        let compressor = Compressor::default();
        let payload = large_payload();

        let envelope = compressor.encode(&payload).unwrap();
        assert!(envelope.compressed);
        let original = envelope.original_size.unwrap();
        let compressed = envelope.compressed_size.unwrap();
        assert!(compressed < original);

        let decoded: Value = compressor.decode(&envelope).unwrap();
        assert_eq!(decoded, payload);

        let stats = compressor.stats();
        assert_eq!(stats.compressed_messages, 1);
        assert_eq!(stats.uncompressed_messages, 0);
        assert!(stats.compression_ratio > 0.0 && stats.compression_ratio < 0.9);
        assert!(stats.bytes_saved() > 0);
    }

    #[test]
    fn compression_skipped_when_not_beneficial() {
        // zstd framing makes tiny inputs larger than they started.
        let compressor = Compressor::new(CompressionSettings::default().with_threshold(0));
        let envelope = compressor.encode(&json!({"id": 1})).unwrap();
        assert!(!envelope.compressed);

        // A ratio nothing can beat.
        let compressor = Compressor::new(CompressionSettings::default().with_min_ratio(0.0));
        let envelope = compressor.encode(&large_payload()).unwrap();
        assert!(!envelope.compressed);
        assert_eq!(compressor.stats().uncompressed_messages, 1);
    }

    #[test]
    fn disabled_settings_never_compress() {
        let compressor = Compressor::new(CompressionSettings::disabled());
        let envelope = compressor.encode(&large_payload()).unwrap();
        assert!(!envelope.compressed);
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let compressor = Compressor::default();
        for payload in [json!({"id": 1}), large_payload()] {
            let mut envelope = compressor.encode(&payload).unwrap();
            envelope.checksum = digest(b"something else");
            let err = compressor.decode::<Value>(&envelope).unwrap_err();
            assert!(err.is_integrity(), "unexpected error: {err}");
        }
    }

    #[test]
    fn tampered_text_is_rejected() {
        let compressor = Compressor::default();
        let mut envelope = compressor.encode(&json!({"id": 1, "monto": 50})).unwrap();
        envelope.data = envelope.data.replace("50", "500");
        assert!(compressor.decode::<Value>(&envelope).unwrap_err().is_integrity());
    }

    #[test]
    fn garbage_base64_is_an_encoding_error() {
        let compressor = Compressor::default();
        let envelope = Envelope {
            compressed: true,
            data: "***".into(),
            checksum: String::new(),
            original_size: None,
            compressed_size: None,
        };
        assert!(matches!(
            compressor.open(&envelope),
            Err(ProtocolError::Encoding(_))
        ));
    }

    #[test]
    fn understated_original_size_stops_inflation() {
        let compressor = Compressor::default();
        let mut envelope = compressor.encode(&large_payload()).unwrap();
        let original = envelope.original_size.unwrap();
        envelope.original_size = Some(original / 2);

        let err = compressor.open(&envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::Compression(_)), "unexpected error: {err}");
    }

    #[test]
    fn inflation_is_capped_by_settings() {
        let envelope = Compressor::default().encode(&large_payload()).unwrap();
        let original = envelope.original_size.unwrap();

        let strict = Compressor::new(CompressionSettings::default().with_max_decoded_size(original - 1));
        assert!(matches!(
            strict.open(&envelope),
            Err(ProtocolError::Compression(_))
        ));

        let mut undeclared = envelope.clone();
        undeclared.original_size = None;
        assert!(matches!(
            strict.open(&undeclared),
            Err(ProtocolError::Compression(_))
        ));

        let exact = Compressor::new(CompressionSettings::default().with_max_decoded_size(original));
        let decoded: Value = exact.decode(&envelope).unwrap();
        assert_eq!(decoded, large_payload());
    }

    #[test]
    fn frame_round_trip() {
        let compressor = Compressor::default();
        let frame = compressor.encode_frame(&large_payload()).unwrap();
        let envelope: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope["compressed"], true);
        assert!(envelope["original_size"].is_u64());

        let decoded: Value = compressor.decode_frame(&frame).unwrap();
        assert_eq!(decoded, large_payload());
    }

    fn record_strategy() -> impl Strategy<Value = Value> {
        prop::collection::btree_map(
            "[a-z_]{1,12}",
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                "[ -~]{0,64}".prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
            ],
            0..40,
        )
        .prop_map(|map| Value::Object(map.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(payload in record_strategy(), threshold in 0usize..2048) {
            let compressor = Compressor::new(CompressionSettings::default().with_threshold(threshold));
            let envelope = compressor.encode(&payload).unwrap();
            let decoded: Value = compressor.decode(&envelope).unwrap();
            prop_assert_eq!(decoded, payload);
        }

        #[test]
        fn below_threshold_is_never_compressed(payload in record_strategy()) {
            let compressor = Compressor::default();
            let size = serde_json::to_vec(&payload).unwrap().len();
            let envelope = compressor.encode(&payload).unwrap();
            if size <= DEFAULT_COMPRESSION_THRESHOLD {
                prop_assert!(!envelope.compressed);
            }
        }
    }
}
