//! Bounded-string validators for everything that crosses an RPC boundary.
//!
//! Every validator rejects before any value reaches the registry, the
//! dependency graph, or the router: raw, unvalidated strings never travel
//! past this module.

use std::collections::BTreeMap;

use semver::Version;

use crate::error::RuntimeError;

const MAX_METADATA_ENTRIES: usize = 100;
const MAX_KEY_BYTES: usize = 256;
const MAX_VALUE_BYTES: usize = 4096;
const MAX_LABEL_BYTES: usize = 128;
const MAX_PATH_BYTES: usize = 256;

fn is_label_start(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn is_label_rest(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn validate_label_alphabet(s: &str, field: &str) -> Result<(), RuntimeError> {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if is_label_start(c) => {}
        _ => {
            return Err(RuntimeError::InvalidArgument(format!(
                "{field} must start with an ASCII letter"
            )))
        }
    }
    if !chars.all(is_label_rest) {
        return Err(RuntimeError::InvalidArgument(format!(
            "{field} must match ^[a-zA-Z][a-zA-Z0-9_.-]*$"
        )));
    }
    Ok(())
}

/// Validate a request metadata map: at most 100 entries, keys matching
/// `^[a-zA-Z][a-zA-Z0-9_.-]*$` and ≤256 bytes, values ≤4096 bytes, no null
/// bytes in either.
pub fn validate_metadata(map: &BTreeMap<String, String>) -> Result<(), RuntimeError> {
    if map.len() > MAX_METADATA_ENTRIES {
        return Err(RuntimeError::InvalidArgument(format!(
            "metadata has {} entries, limit is {MAX_METADATA_ENTRIES}",
            map.len()
        )));
    }
    for (key, value) in map {
        if key.len() > MAX_KEY_BYTES {
            return Err(RuntimeError::InvalidArgument(format!(
                "metadata key '{key}' exceeds {MAX_KEY_BYTES} bytes"
            )));
        }
        validate_label_alphabet(key, "metadata key")?;
        if value.len() > MAX_VALUE_BYTES {
            return Err(RuntimeError::InvalidArgument(format!(
                "metadata value for '{key}' exceeds {MAX_VALUE_BYTES} bytes"
            )));
        }
        if key.contains('\0') || value.contains('\0') {
            return Err(RuntimeError::InvalidArgument(
                "metadata must not contain null bytes".into(),
            ));
        }
    }
    Ok(())
}

/// Validate a `service_type`: non-empty, ≤128 bytes, label alphabet, and must
/// not contain `/`, `\`, or `..` (these would let a service type smuggle a
/// path segment into a route).
pub fn validate_service_type(s: &str) -> Result<(), RuntimeError> {
    if s.is_empty() {
        return Err(RuntimeError::InvalidArgument("service_type must not be empty".into()));
    }
    if s.len() > MAX_LABEL_BYTES {
        return Err(RuntimeError::InvalidArgument(format!(
            "service_type exceeds {MAX_LABEL_BYTES} bytes"
        )));
    }
    if s.contains('/') || s.contains('\\') || s.contains("..") {
        return Err(RuntimeError::InvalidArgument(
            "service_type must not contain '/', '\\', or '..'".into(),
        ));
    }
    validate_label_alphabet(s, "service_type")
}

/// Validate a `self_id`: same alphabet as service types, ≤128 bytes.
pub fn validate_self_id(s: &str) -> Result<(), RuntimeError> {
    if s.len() > MAX_LABEL_BYTES {
        return Err(RuntimeError::InvalidArgument(format!(
            "self_id exceeds {MAX_LABEL_BYTES} bytes"
        )));
    }
    validate_label_alphabet(s, "self_id")
}

/// Parse and validate a semver version string (`N.N.N` with optional
/// `-<prerelease>`), returning the parsed [`Version`] so callers can compare
/// with proper semver ordering.
pub fn validate_version(s: &str) -> Result<Version, RuntimeError> {
    Version::parse(s).map_err(|e| RuntimeError::InvalidArgument(format!("invalid version '{s}': {e}")))
}

/// Validate an out-of-process endpoint path: starts with `/`, ≤256 bytes, no
/// null bytes.
pub fn validate_endpoint_path(s: &str) -> Result<(), RuntimeError> {
    if !s.starts_with('/') {
        return Err(RuntimeError::InvalidArgument(
            "endpoint path must start with '/'".into(),
        ));
    }
    if s.len() > MAX_PATH_BYTES {
        return Err(RuntimeError::InvalidArgument(format!(
            "endpoint path exceeds {MAX_PATH_BYTES} bytes"
        )));
    }
    if s.contains('\0') {
        return Err(RuntimeError::InvalidArgument(
            "endpoint path must not contain null bytes".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_rejects_too_many_entries() {
        let map: BTreeMap<String, String> = (0..101).map(|i| (format!("k{i}"), "v".into())).collect();
        assert!(validate_metadata(&map).is_err());
    }

    #[test]
    fn metadata_rejects_bad_key_alphabet() {
        let mut map = BTreeMap::new();
        map.insert("1bad".to_string(), "v".to_string());
        assert!(validate_metadata(&map).is_err());
    }

    #[test]
    fn metadata_rejects_null_bytes() {
        let mut map = BTreeMap::new();
        map.insert("key".to_string(), "v\0alue".to_string());
        assert!(validate_metadata(&map).is_err());
    }

    #[test]
    fn metadata_accepts_well_formed_map() {
        let mut map = BTreeMap::new();
        map.insert("region".to_string(), "us-east-1".to_string());
        map.insert("build.tag".to_string(), "abc_123".to_string());
        assert!(validate_metadata(&map).is_ok());
    }

    #[test]
    fn service_type_rejects_path_traversal() {
        assert!(validate_service_type("cache/../etc").is_err());
        assert!(validate_service_type("cache/sub").is_err());
        assert!(validate_service_type("").is_err());
    }

    #[test]
    fn service_type_accepts_plain_label() {
        assert!(validate_service_type("cache-v2").is_ok());
    }

    #[test]
    fn self_id_enforces_alphabet_and_length() {
        assert!(validate_self_id("my-plugin").is_ok());
        assert!(validate_self_id("_bad").is_err());
        assert!(validate_self_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn version_parses_semver_and_rejects_garbage() {
        let v = validate_version("1.2.3-beta.1").unwrap();
        assert_eq!(v.major, 1);
        assert!(validate_version("not-a-version").is_err());
        assert!(validate_version("1.2").is_err());
    }

    #[test]
    fn version_ordering_is_proper_semver() {
        let a = validate_version("1.9.0").unwrap();
        let b = validate_version("1.10.0").unwrap();
        assert!(a < b);
    }

    #[test]
    fn endpoint_path_requires_leading_slash() {
        assert!(validate_endpoint_path("/rpc/cache").is_ok());
        assert!(validate_endpoint_path("rpc/cache").is_err());
        assert!(validate_endpoint_path(&format!("/{}", "a".repeat(300))).is_err());
    }
}
