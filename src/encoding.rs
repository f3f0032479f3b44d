//! Stable hashing and transcript payload encoding
//!
//! Content hashes must be stable across processes and platforms, so
//! everything here is sha256 over canonical bytes. Transcript payloads are
//! gzip-compressed and base64-armored for the on-disk queue files.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{DeepMemError, Result};
use crate::types::ChatMessage;

/// Full sha256 hex digest of arbitrary bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable content hash of a string, truncated to 16 hex chars.
/// Used for hash-derived memory ids (`mem_<hex16>`) and queue key prefixes.
pub fn stable_hash_hex16(input: &str) -> String {
    sha256_hex(input.as_bytes())[..16].to_string()
}

/// Transcript fingerprint: sha256 of the canonical JSON of the messages.
/// Two byte-identical transcripts always produce the same hash.
pub fn transcript_hash(messages: &[ChatMessage]) -> Result<String> {
    let value = serde_json::to_value(messages)?;
    let canonical = canonical_json(&value);
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Serialize a JSON value with object keys sorted recursively.
/// Array order is preserved; only object key order is normalized.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Gzip + base64 encode a message list for queue persistence
pub fn encode_messages(messages: &[ChatMessage]) -> Result<String> {
    let json = serde_json::to_vec(messages)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Decode a gzip + base64 message payload back into messages
pub fn decode_messages(encoded: &str) -> Result<Vec<ChatMessage>> {
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| DeepMemError::InvalidJson(format!("bad base64 payload: {}", e)))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Deterministic sampling bucket in [0, 1) from a stable hash.
/// Uses the first 8 hex chars of `sha256("{ns}::{sid}::{count}")`.
pub fn sample_bucket(namespace: &str, session_id: &str, message_count: usize) -> f64 {
    let seed = format!("{}::{}::{}", namespace, session_id, message_count);
    let digest = sha256_hex(seed.as_bytes());
    let head = u32::from_str_radix(&digest[..8], 16).unwrap_or(0);
    (head % 10_000) as f64 / 10_000.0
}
