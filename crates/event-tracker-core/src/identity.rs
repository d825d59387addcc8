//! Identity hashing: the composite key that names an event stream, and the
//! details fingerprint used to detect a change in payload shape.
//!
//! Grounded on `rostra-core`'s `impl_base32_str!`/digest-from-bytes pattern
//! (hash the encoded bytes, hex/base-encode the digest) — swapped for
//! `sha2` + lower-hex per the literal SHA-256 requirement here.

use data_encoding::HEXLOWER;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use snafu::{Location, Snafu};

#[derive(Debug, Snafu)]
pub enum IdentityError {
    #[snafu(display("category must not be empty"))]
    CategoryEmpty {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("id must not be empty"))]
    IdEmpty {
        #[snafu(implicit)]
        location: Location,
    },
}

pub type IdentityResult<T> = Result<T, IdentityError>;

pub fn validate_identity(category: &str, id: &str) -> IdentityResult<()> {
    if category.is_empty() {
        return CategoryEmptySnafu.fail();
    }
    if id.is_empty() {
        return IdEmptySnafu.fail();
    }
    Ok(())
}

/// A stable, collision-resistant name for the `(category, id)` pair.
///
/// Callers are expected to have already run [`validate_identity`]; this
/// function does not re-check emptiness.
pub fn composite_key(category: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b":");
    hasher.update(id.as_bytes());
    HEXLOWER.encode(&hasher.finalize())
}

/// Fingerprint of the `details` payload shape.
///
/// `None`, `Value::Null`, and empty objects/arrays all hash to the empty
/// string, matching "missing details" for the purposes of change detection.
///
/// `serde_json::Map` is backed by a `BTreeMap` in this workspace (the
/// `preserve_order` feature is never enabled), so object keys are already
/// emitted in lexicographic order on serialization — canonicalization falls
/// out of the default `Value` representation for free.
///
/// A payload containing an object key literally named `$cyclic` at any
/// depth is treated as unfingerprintable and also hashes to the empty
/// string. This is the Rust-side stand-in for a cyclic-object-graph input:
/// `serde_json::Value` cannot itself contain a cycle, so there is no way to
/// reproduce that condition structurally, but callers that need to exercise
/// the "cannot fingerprint, don't throw" path can use this sentinel.
pub fn details_hash(details: Option<&Value>) -> String {
    let Some(value) = details else {
        return String::new();
    };
    if is_empty_details(value) || contains_cyclic_sentinel(value) {
        return String::new();
    }
    let Ok(bytes) = serde_json::to_vec(value) else {
        return String::new();
    };
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    HEXLOWER.encode(&hasher.finalize())
}

fn is_empty_details(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(arr) => arr.is_empty(),
        _ => false,
    }
}

fn contains_cyclic_sentinel(value: &Value) -> bool {
    match value {
        Value::Object(map) => contains_sentinel_key(map) || map.values().any(contains_cyclic_sentinel),
        Value::Array(arr) => arr.iter().any(contains_cyclic_sentinel),
        _ => false,
    }
}

fn contains_sentinel_key(map: &Map<String, Value>) -> bool {
    map.contains_key("$cyclic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing::info;

    #[test]
    fn rejects_empty_category_or_id() {
        assert!(matches!(
            validate_identity("", "x"),
            Err(IdentityError::CategoryEmpty { .. })
        ));
        assert!(matches!(validate_identity("x", ""), Err(IdentityError::IdEmpty { .. })));
        assert!(validate_identity("x", "y").is_ok());
    }

    #[test]
    fn composite_key_is_deterministic_and_order_sensitive() {
        let a = composite_key("login", "user-1");
        let b = composite_key("login", "user-1");
        let c = composite_key("user-1", "login");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test_log::test]
    fn composite_key_hex_encoding_is_lowercase() {
        let key = composite_key("login", "user-1");
        info!(%key, "composite key");
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn details_hash_empty_variants_all_match() {
        assert_eq!(details_hash(None), "");
        assert_eq!(details_hash(Some(&Value::Null)), "");
        assert_eq!(details_hash(Some(&json!({}))), "");
        assert_eq!(details_hash(Some(&json!([]))), "");
    }

    #[test]
    fn details_hash_is_insensitive_to_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(details_hash(Some(&a)), details_hash(Some(&b)));
    }

    #[test]
    fn details_hash_changes_with_value() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(details_hash(Some(&a)), details_hash(Some(&b)));
    }

    #[test]
    fn cyclic_sentinel_hashes_empty_at_any_depth() {
        let nested = json!({"a": {"b": {"$cyclic": true}}});
        assert_eq!(details_hash(Some(&nested)), "");
    }
}

#[cfg(test)]
mod proptest_details_hash {
    use proptest::prelude::*;
    use serde_json::Map;
    use tracing::debug;

    use super::*;

    fn scalar_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::Number(n.into())),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    fn object_strategy() -> impl Strategy<Value = (Vec<(String, Value)>, Value)> {
        prop::collection::vec(("[a-z]{1,6}", scalar_strategy()), 1..8).prop_map(|entries| {
            let mut dedup = Map::new();
            for (k, v) in entries.iter() {
                dedup.insert(k.clone(), v.clone());
            }
            (entries, Value::Object(dedup))
        })
    }

    proptest! {
        /// Shuffling an object's key insertion order must never change its
        /// fingerprint, since `details_hash` is defined over the value the
        /// keys produce, not the order a caller happened to build them in.
        #[test]
        fn details_hash_ignores_insertion_order((entries, canonical) in object_strategy()) {
            let mut shuffled_entries = entries;
            shuffled_entries.reverse();
            let mut shuffled = Map::new();
            for (k, v) in shuffled_entries {
                shuffled.insert(k, v);
            }
            let key_count = canonical.as_object().map_or(0, Map::len);
            debug!(key_count, "comparing shuffled object fingerprints");
            prop_assert_eq!(details_hash(Some(&canonical)), details_hash(Some(&Value::Object(shuffled))));
        }
    }
}
