//! # Body Re-encoding
//!
//! Actors tend to answer with msgpack bodies while HTTP callers expect JSON.
//! Conversion here is best effort: `None` means "leave the bytes alone".

use serde_json::Map;
use serde_json::Value;

pub const JSON: &str = "application/json";

/// True for `application/msgpack`, `application/x-msgpack` and friends.
pub fn is_msgpack(content_type: &str) -> bool {
    essence(content_type).ends_with("msgpack")
}

/// Converts a msgpack map into its JSON text.
pub fn msgpack_to_json(body: &[u8]) -> Option<Vec<u8>> {
    let value: Map<String, Value> = rmp_serde::from_slice(body).ok()?;
    serde_json::to_vec(&value).ok()
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
