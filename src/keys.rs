//! Length-prefixed key encoding for the LMDB index tables.
//!
//! All keys are encoded as: [len1][bytes1][len2][bytes2]...
//! - No delimiters, no escaping, any bytes allowed (colons in principals are fine)
//! - A key built from the first N parts is a byte prefix of every longer key
//!   sharing those parts, so prefix scans select exactly one index bucket.
//!
//! A part longer than 255 bytes cannot be length-prefixed with one byte;
//! building a key from one is a validation error.

use chrono::{DateTime, Utc};

use crate::capability::Period;
use crate::constants::MAX_PART_LEN;
use crate::error::{CapError, Result};
use crate::principal::Principal;
use crate::resource::{Resource, ResourceKind};

/// Build a length-prefixed key from parts
#[inline]
pub fn build_key<S: AsRef<str>>(parts: &[S]) -> Result<Vec<u8>> {
    let total_len: usize = parts.iter().map(|p| 1 + p.as_ref().len()).sum();
    let mut key = Vec::with_capacity(total_len);
    for part in parts {
        let part = part.as_ref().as_bytes();
        let len = u8::try_from(part.len())
            .map_err(|_| CapError::Validation(format!("key part of {} bytes exceeds {}", part.len(), MAX_PART_LEN)))?;
        key.push(len);
        key.extend_from_slice(part);
    }
    Ok(key)
}

/// Reject a caller-supplied lookup part that no stored key can contain
pub fn check_part(what: &str, part: &str) -> Result<()> {
    if part.is_empty() || part.len() > MAX_PART_LEN {
        return Err(CapError::Validation(format!("{} must be 1..={} bytes", what, MAX_PART_LEN)));
    }
    Ok(())
}

/// Build a prefix for scanning (same as build_key, just clearer intent)
#[inline]
pub fn build_prefix<S: AsRef<str>>(parts: &[S]) -> Result<Vec<u8>> {
    build_key(parts)
}

/// Parse a length-prefixed key into parts
pub fn parse_key(bytes: &[u8]) -> Vec<&str> {
    let mut parts = Vec::with_capacity(4);
    let mut i = 0;
    while i < bytes.len() {
        let len = bytes[i] as usize;
        if i + 1 + len > bytes.len() {
            break;
        }
        match std::str::from_utf8(&bytes[i + 1..i + 1 + len]) {
            Ok(part) => parts.push(part),
            Err(_) => break,
        }
        i += 1 + len;
    }
    parts
}

/// Last part of a key (the record id in every index table)
#[inline]
pub fn last_part(bytes: &[u8]) -> Option<&str> {
    parse_key(bytes).pop()
}

// ============================================================================
// Index keys
// ============================================================================

/// caps_by_principal: [principal][capability id]
pub fn principal_key(principal: &Principal, cap_id: &str) -> Result<Vec<u8>> {
    build_key(&[principal.to_string().as_str(), cap_id])
}

pub fn principal_prefix(principal: &Principal) -> Result<Vec<u8>> {
    build_prefix(&[principal.to_string()])
}

/// caps_by_resource: [kind][namespace][id or *][capability id]
pub fn resource_key(resource: &Resource, cap_id: &str) -> Result<Vec<u8>> {
    let [kind, ns, id] = resource.index_parts();
    build_key(&[kind, ns, id, cap_id])
}

/// Prefix over one namespace, or one instance id when given.
pub fn resource_prefix(kind: ResourceKind, namespace: &str, id: Option<&str>) -> Result<Vec<u8>> {
    match id {
        Some(id) => build_prefix(&[kind.as_str(), namespace, id]),
        None => build_prefix(&[kind.as_str(), namespace]),
    }
}

/// Generic two-part key: [a][b]
pub fn pair_key(a: &str, b: &str) -> Result<Vec<u8>> {
    build_key(&[a, b])
}

pub fn single_prefix(a: &str) -> Result<Vec<u8>> {
    build_prefix(&[a])
}

/// Usage window: [capability id][principal][usage type][period][window start millis]
pub fn usage_key(
    cap_id: &str,
    principal: &Principal,
    usage_type: &str,
    period: Period,
    start: DateTime<Utc>,
) -> Result<Vec<u8>> {
    build_key(&[
        cap_id.to_string(),
        principal.to_string(),
        usage_type.to_string(),
        period.as_str().to_string(),
        start.timestamp_millis().to_string(),
    ])
}

/// Prefix over every window of one (capability, principal)
pub fn usage_prefix(cap_id: &str, principal: &Principal) -> Result<Vec<u8>> {
    build_prefix(&[cap_id.to_string(), principal.to_string()])
}

/// Reservation: usage window key followed by the reservation id
pub fn reservation_key(window: &[u8], reservation_id: &str) -> Result<Vec<u8>> {
    let mut key = window.to_vec();
    key.extend_from_slice(&build_key(&[reservation_id])?);
    Ok(key)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse() {
        let key = build_key(&["user:alice", "c0ffee", "data:projects"]).unwrap();
        let parts = parse_key(&key);
        assert_eq!(parts, vec!["user:alice", "c0ffee", "data:projects"]);
    }

    #[test]
    fn test_last_part() {
        let key = build_key(&["aaa", "bbb", "ccc"]).unwrap();
        assert_eq!(last_part(&key), Some("ccc"));
        assert_eq!(last_part(&[]), None);
    }

    #[test]
    fn test_overlong_part_rejected() {
        let max = "x".repeat(MAX_PART_LEN);
        assert_eq!(build_key(&[max.as_str()]).unwrap().len(), MAX_PART_LEN + 1);

        let long = "x".repeat(MAX_PART_LEN + 1);
        assert!(matches!(build_key(&["ok", long.as_str()]), Err(CapError::Validation(_))));
        assert!(pair_key("group", &long).is_err());
        assert!(reservation_key(b"\x01w", &long).is_err());
    }

    #[test]
    fn test_prefix_does_not_bleed_across_parts() {
        // "user:al" must not prefix-match "user:alice"
        let alice = principal_key(&"user:alice".parse().unwrap(), "1").unwrap();
        let al = principal_prefix(&"user:al".parse().unwrap()).unwrap();
        assert!(!alice.starts_with(&al));
        assert!(alice.starts_with(&principal_prefix(&"user:alice".parse().unwrap()).unwrap()));
    }

    #[test]
    fn test_resource_prefixes() {
        let wild: Resource = "data:projects".parse().unwrap();
        let one: Resource = "data:projects:7".parse().unwrap();
        let ns = resource_prefix(ResourceKind::Data, "projects", None).unwrap();
        assert!(resource_key(&wild, "a").unwrap().starts_with(&ns));
        assert!(resource_key(&one, "b").unwrap().starts_with(&ns));
        let inst = resource_prefix(ResourceKind::Data, "projects", Some("7")).unwrap();
        assert!(resource_key(&one, "b").unwrap().starts_with(&inst));
        assert!(!resource_key(&wild, "a").unwrap().starts_with(&inst));
    }

    #[test]
    fn test_reservation_extends_window() {
        let p: Principal = "user:a".parse().unwrap();
        let window = usage_key("cap", &p, "voice-minutes", Period::Daily, Utc::now()).unwrap();
        let res = reservation_key(&window, "r1").unwrap();
        assert!(res.starts_with(&window));
        assert_eq!(last_part(&res), Some("r1"));
    }
}
