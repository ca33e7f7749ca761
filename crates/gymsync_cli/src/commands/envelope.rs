//! Encode and decode command implementations.

use gymsync_protocol::{CompressionSettings, Compressor, Envelope};
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

fn read_input(input: Option<&Path>) -> Result<String, Box<dyn std::error::Error>> {
    match input {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn settings(threshold: Option<usize>, no_compress: bool) -> CompressionSettings {
    if no_compress {
        return CompressionSettings::disabled();
    }
    match threshold {
        Some(threshold) => CompressionSettings::default().with_threshold(threshold),
        None => CompressionSettings::default(),
    }
}

/// Wraps a JSON payload into a wire frame.
pub fn encode_text(
    text: &str,
    threshold: Option<usize>,
    no_compress: bool,
) -> Result<Envelope, Box<dyn std::error::Error>> {
    let payload: Value = serde_json::from_str(text)?;
    let compressor = Compressor::new(settings(threshold, no_compress));
    Ok(compressor.encode(&payload)?)
}

/// Verifies a wire frame and returns its payload.
pub fn decode_text(frame: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let envelope = Envelope::from_json(frame.trim())?;
    debug!(
        compressed = envelope.compressed,
        checksum = %envelope.checksum,
        "decoding envelope"
    );
    Ok(Compressor::default().decode(&envelope)?)
}

/// Runs the encode command.
pub fn encode(
    input: Option<&Path>,
    threshold: Option<usize>,
    no_compress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let envelope = encode_text(&read_input(input)?, threshold, no_compress)?;
    info!(
        compressed = envelope.compressed,
        original_size = ?envelope.original_size,
        compressed_size = ?envelope.compressed_size,
        "payload encoded"
    );
    println!("{}", envelope.to_json()?);
    Ok(())
}

/// Runs the decode command.
pub fn decode(input: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let payload = decode_text(&read_input(input)?)?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_then_decode_large_payload() {
        let payload = json!({"type": "status", "notes": "x".repeat(4096)});
        let envelope = encode_text(&payload.to_string(), None, false).unwrap();
        assert!(envelope.compressed);

        let decoded = decode_text(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn no_compress_keeps_plain_json() {
        let payload = json!({"notes": "x".repeat(4096)});
        let envelope = encode_text(&payload.to_string(), Some(1), true).unwrap();
        assert!(!envelope.compressed);
        assert_eq!(envelope.data, payload.to_string());
    }

    #[test]
    fn decode_rejects_tampered_frame() {
        let mut envelope = encode_text(r#"{"id": 1}"#, None, false).unwrap();
        envelope.data = r#"{"id":2}"#.into();
        assert!(decode_text(&envelope.to_json().unwrap()).is_err());
    }

    #[test]
    fn encode_rejects_invalid_json() {
        assert!(encode_text("not json", None, false).is_err());
    }
}
