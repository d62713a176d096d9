//! Tolerant body parsing.

use serde_json::Value;

use crate::errors::MalformedPayloadError;

/// Drop control bytes below 0x20 except horizontal tab.
///
/// Multi-byte UTF-8 sequences only use bytes >= 0x80 and are left intact.
pub fn strip_control_bytes(body: &[u8]) -> Vec<u8> {
    body.iter()
        .copied()
        .filter(|&b| b >= 0x20 || b == b'\t')
        .collect()
}

/// Parse a delivery body, tolerating raw control characters.
pub fn parse_tolerant(body: &[u8]) -> Result<Value, MalformedPayloadError> {
    let cleaned = strip_control_bytes(body);
    serde_json::from_slice(&cleaned).map_err(|e| MalformedPayloadError::InvalidJson {
        message: e.to_string(),
    })
}
