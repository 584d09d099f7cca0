// hasher.rs - SHA-256 hashing helpers, lowercase hex encoded.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::TraceError;

/// Hash arbitrary bytes into a 64-character lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash the compact JSON encoding of `value`.
///
/// Object keys follow the serializer's order, so two values only hash the
/// same when they serialize identically. `serde_json::Value` objects and
/// `BTreeMap`s are key-sorted, which makes them stable inputs.
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Result<String, TraceError> {
    let json = serde_json::to_vec(value)?;
    Ok(hash_bytes(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_string_hash_matches_known_value() {
        assert_eq!(
            hash_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash_is_lowercase_hex() {
        let hash = hash_str("gatekeeper");
        assert_eq!(hash.len(), 64);
        assert!(hash
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn json_hash_ignores_construction_order() {
        let a = json!({"tool": "send_email", "to": "a@x.com"});
        let b = json!({"to": "a@x.com", "tool": "send_email"});
        assert_eq!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
        assert_ne!(
            hash_json(&a).unwrap(),
            hash_json(&json!({"tool": "send_sms"})).unwrap()
        );
    }
}
