//! `AuthKey`: the 256-byte key agreed on by the DH handshake.

use crate::sha1;

/// An authorization key (256 bytes) plus pre-computed identifiers.
///
/// The identifiers are always derived from the key bytes. Rotation replaces
/// the whole value.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
    dc_id: Option<i32>,
}

impl AuthKey {
    /// Construct from raw 256-byte DH output.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id, dc_id: None }
    }

    /// Same key, tagged with the data center it was created on.
    pub fn with_dc(mut self, dc_id: i32) -> Self {
        self.dc_id = Some(dc_id);
        self
    }

    /// Return the raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] { self.data }

    /// The 8-byte key identifier as it appears on the wire.
    pub fn key_id_bytes(&self) -> [u8; 8] { self.key_id }

    /// `SHA1(key)[12..20]` read little-endian.
    pub fn key_id(&self) -> u64 { u64::from_le_bytes(self.key_id) }

    /// `SHA1(key)[0..8]`, used as `retry_id` on `dh_gen_retry`.
    pub fn aux_hash(&self) -> i64 { i64::from_le_bytes(self.aux_hash) }

    pub fn dc_id(&self) -> Option<i32> { self.dc_id }

    /// Compute `new_nonce_hash{number}` for `dh_gen_ok/retry/fail` checks.
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = sha1!(new_nonce, [number], &self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={}, dc={:?})", self.key_id(), self.dc_id)
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool { self.key_id == other.key_id }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_derived_from_bytes() {
        let key = AuthKey::from_bytes([0x5a; 256]);
        let sha = sha1!(&[0x5a; 256]);
        assert_eq!(key.key_id_bytes(), sha[12..20]);
        assert_eq!(key.aux_hash().to_le_bytes(), sha[..8]);
        assert_eq!(AuthKey::from_bytes([0x5a; 256]).key_id(), key.key_id());
        assert_ne!(AuthKey::from_bytes([0x5b; 256]).key_id(), key.key_id());
    }

    #[test]
    fn nonce_hash_tags_differ() {
        let key = AuthKey::from_bytes([1; 256]);
        let nn = [2u8; 32];
        assert_ne!(key.calc_new_nonce_hash(&nn, 1), key.calc_new_nonce_hash(&nn, 2));
    }
}
