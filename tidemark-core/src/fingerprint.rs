//! Deterministic row and partition fingerprints.
//!
//! A row fingerprint is the SHA-256 of the canonical tokens of its business
//! columns, in contract order, joined by `|`. A partition fingerprint is the
//! SHA-256 of the *sorted* row fingerprints joined by `|`, so it does not
//! depend on row order.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::Row;

/// Canonical text of a single value.
///
/// Nulls become the empty token, nested values become compact JSON with
/// sorted keys, everything else is stringified.
pub fn canonical_token(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => canonical_json(value),
    }
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let key = Value::String(k.clone()).to_string();
                    format!("{key}:{}", canonical_json(&map[k]))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Fingerprint a row over the given columns, in the given order.
///
/// Absent columns hash like nulls.
pub fn row_fingerprint(row: &Row, columns: &[String]) -> String {
    let joined = columns
        .iter()
        .map(|c| row.get(c).map(canonical_token).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(joined.as_bytes())
}

/// Order-independent digest of a set of row fingerprints.
///
/// Returns `None` for an empty set: an empty partition has no hash.
pub fn partition_hash<'a, I>(fingerprints: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sorted: Vec<&str> = fingerprints.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable();
    Some(sha256_hex(sorted.join("|").as_bytes()))
}

/// Compute SHA-256 of arbitrary bytes as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
