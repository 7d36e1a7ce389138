//! Canonical serialization and content hashing
//!
//! Spec §6 fixes the hash input: UTF-8 strings, sorted object keys,
//! base-10 integers, literal booleans, and no `null` in hashed fields.
//! `canonicalize` normalizes a `serde_json::Value` into that form;
//! `hash_event_fields` hashes the full ordered field list with SHA-256.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::CanonicalizeError;

/// Recursively normalize a JSON value: object keys sorted, `null`
/// values omitted from objects. A `null` found inside an array is
/// rejected — arrays have no "omit this slot" representation that
/// preserves position, so this is treated as a malformed payload.
pub fn canonicalize(value: &Value) -> Result<Value, CanonicalizeError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Ok(value.clone()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if item.is_null() {
                    return Err(CanonicalizeError::NullInArray);
                }
                out.push(canonicalize(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut sorted: Map<String, Value> = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let v = &map[key];
                if v.is_null() {
                    continue;
                }
                sorted.insert(key.clone(), canonicalize(v)?);
            }
            Ok(Value::Object(sorted))
        }
    }
}

/// Render a canonicalized value as the exact string fed into the hash.
/// `serde_json::to_string` on a `Map` built by insertion order
/// reproduces the sorted order we just constructed.
pub fn canonical_string(value: &Value) -> Result<String, CanonicalizeError> {
    let canon = canonicalize(value)?;
    serde_json::to_string(&canon).map_err(CanonicalizeError::Serialize)
}

/// The ordered, `|`-joined hash input fields from spec §6:
/// `id | sequence | timestamp | event_type | aggregate_type |
///  aggregate_id | aggregate_version | payload_canonical |
///  actor_canonical | causation_canonical | previous_hash`.
#[allow(clippy::too_many_arguments)]
pub fn hash_input(
    id: &str,
    sequence: i64,
    timestamp_rfc3339: &str,
    event_type: &str,
    aggregate_type: &str,
    aggregate_id: &str,
    aggregate_version: i64,
    payload_canonical: &str,
    actor_canonical: &str,
    causation_canonical: &str,
    previous_hash: &str,
) -> String {
    format!(
        "{id}|{sequence}|{timestamp_rfc3339}|{event_type}|{aggregate_type}|{aggregate_id}|{aggregate_version}|{payload_canonical}|{actor_canonical}|{causation_canonical}|{previous_hash}"
    )
}

/// SHA-256 over the hash input, hex-encoded lower case.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// The genesis sentinel used as `previous_hash` for the first event in
/// a chain: 64 hex zeros, the same width as a real SHA-256 digest.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
