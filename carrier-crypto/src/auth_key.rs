//! 256-byte MTProto authorization key with pre-computed identifiers.

use crate::sha1;

/// An authorization key (permanent or temporary) plus derived material.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Construct from the raw 256-byte key.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// The raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The 8-byte key identifier: the last 8 bytes of SHA-1(key).
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }

    /// First 8 bytes of SHA-1(key), used in handshake nonce hashes.
    pub fn aux_hash(&self) -> [u8; 8] {
        self.aux_hash
    }

    /// The 32-byte window of key material mixed into the outgoing message
    /// key: `key[88..120]` for the client side.
    pub fn for_client_hash(&self) -> &[u8] {
        &self.data[88..88 + 32]
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={})", i64::from_le_bytes(self.key_id))
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_sha1_tail() {
        let key = AuthKey::from_bytes([0x55; 256]);
        let sha = sha1!(&[0x55u8; 256]);
        assert_eq!(key.key_id(), sha[12..20]);
        assert_eq!(key.aux_hash(), sha[..8]);
    }
}
