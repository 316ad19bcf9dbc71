//! Conversion between payload values and the text kept in `Payload_JSON`.
use serde_json::Value;

/// Compact JSON text for a payload.
#[must_use]
pub fn encode(payload: &Value) -> String {
    // Serializing a `Value` cannot fail: its map keys are always strings.
    serde_json::to_string(payload).unwrap_or_default()
}

/// Parses stored payload text. Accepts anything byte-like so the storage
/// layer can hand over `TEXT` or `BLOB` columns alike.
pub fn decode(raw: impl AsRef<[u8]>) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(raw.as_ref())
}
