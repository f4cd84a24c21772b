//! Record id generation

use sha2::{Digest, Sha256};

use crate::error::{CapError, Result};
use crate::principal::Principal;

/// Generate a random 128-bit id (hex encoded)
pub fn generate_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|e| CapError::StoreUnavailable(format!("entropy source failed: {}", e)))?;
    Ok(hex::encode(bytes))
}

/// Deterministic id of a principal's membership capability for a group.
/// At most one such row can exist because the id is its primary key.
pub fn group_membership_id(principal: &Principal, group: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"group-membership\0");
    hasher.update(principal.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(group.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Hex encode
mod hex {
    pub fn encode(data: impl AsRef<[u8]>) -> String {
        const HEX: &[u8] = b"0123456789abcdef";
        let data = data.as_ref();
        let mut s = String::with_capacity(data.len() * 2);
        for &b in data {
            s.push(HEX[(b >> 4) as usize] as char);
            s.push(HEX[(b & 0xf) as usize] as char);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct() {
        let a = generate_id().unwrap();
        let b = generate_id().unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn membership_id_is_stable() {
        let p: Principal = "user:alice".parse().unwrap();
        let q: Principal = "user:bob".parse().unwrap();
        assert_eq!(group_membership_id(&p, "beta"), group_membership_id(&p, "beta"));
        assert_ne!(group_membership_id(&p, "beta"), group_membership_id(&q, "beta"));
        assert_ne!(group_membership_id(&p, "beta"), group_membership_id(&p, "gamma"));
    }
}
