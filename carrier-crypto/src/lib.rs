//! Cryptographic primitives for the MTProto transport layer.
//!
//! Provides:
//! - AES-256-IGE encryption/decryption
//! - SHA-1 / SHA-256 hash macros
//! - `AuthKey` — 256-byte authorization key with derived ids
//! - MTProto 2.0 frame encryption / decryption (temp-key KDF)
//! - MTProto v1 KDF, used for the PFS key-binding payload

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod deque_buffer;
mod sha;

pub use auth_key::AuthKey;
pub use deque_buffer::DequeBuffer;

// ─── MTProto 2.0 frame encrypt / decrypt ─────────────────────────────────────

/// Errors from [`decrypt_frame`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

enum Side {
    Client,
    Server,
}

impl Side {
    fn x(&self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

/// Padding for an encrypted frame: total length a multiple of 16, at least
/// 12 bytes of padding.
fn padding_len(len: usize) -> usize {
    let mut pad = (16 - len % 16) % 16;
    if pad < 12 {
        pad += 16;
    }
    pad
}

/// Encrypt `buffer` (in place, with prepended header) using the temporary
/// auth key, MTProto 2.0 scheme.
///
/// After this call `buffer` contains `key_id || msg_key || ciphertext`, with
/// `msg_key` the middle 16 bytes of `SHA-256(key[88..120] || plaintext || padding)`.
pub fn encrypt_frame(buffer: &mut DequeBuffer, auth_key: &AuthKey) {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    do_encrypt_frame(buffer, auth_key, &rnd);
}

pub(crate) fn do_encrypt_frame(buffer: &mut DequeBuffer, auth_key: &AuthKey, rnd: &[u8; 32]) {
    let pad = padding_len(buffer.len());
    buffer.extend(rnd.iter().take(pad).copied());

    let msg_key_large = sha256!(auth_key.for_client_hash(), buffer.as_ref());
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, Side::Client);
    aes::ige_encrypt(buffer.as_mut(), &key, &iv);

    buffer.extend_front(&msg_key);
    buffer.extend_front(&auth_key.key_id);
}

/// Decrypt an MTProto 2.0 ciphertext.
///
/// `buffer` must start with `key_id || msg_key || ciphertext`. On success
/// returns a slice of `buffer` containing the plaintext (including padding).
pub fn decrypt_frame<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, Side::Server);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = Side::Server.x();
    let our_key = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != our_key[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

// ─── MTProto v1 KDF (PFS bind payload) ───────────────────────────────────────

/// Derive `(aes_key, aes_iv)` from a message key and the *permanent* auth
/// key with the original (v1) KDF.
///
/// The temp-to-permanent key binding payload is the only place this scheme
/// is still used.
pub fn old_kdf(msg_key: &[u8; 16], auth_key: &AuthKey) -> ([u8; 32], [u8; 32]) {
    let key = &auth_key.data;
    let sha_a = sha1!(msg_key, &key[..32]);
    let sha_b = sha1!(&key[32..48], msg_key, &key[48..64]);
    let sha_c = sha1!(&key[64..96], msg_key);
    let sha_d = sha1!(msg_key, &key[96..128]);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..20].copy_from_slice(&sha_b[8..20]);
    aes_key[20..].copy_from_slice(&sha_c[4..16]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..12].copy_from_slice(&sha_a[8..20]);
    aes_iv[12..20].copy_from_slice(&sha_b[..8]);
    aes_iv[20..24].copy_from_slice(&sha_c[16..20]);
    aes_iv[24..].copy_from_slice(&sha_d[..8]);

    (aes_key, aes_iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AuthKey {
        let mut data = [0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        AuthKey::from_bytes(data)
    }

    #[test]
    fn padding_is_at_least_12_and_block_aligns() {
        for len in 0..64 {
            let pad = padding_len(len);
            assert!(pad >= 12, "padding {pad} too short for len {len}");
            assert!(pad < 28);
            assert_eq!((len + pad) % 16, 0, "len {len} + pad {pad} not aligned");
        }
    }

    #[test]
    fn encrypted_frame_layout() {
        let key = test_key();
        let mut buf = DequeBuffer::with_capacity(16, 32);
        buf.extend([1u8, 2, 3, 4]);
        encrypt_frame(&mut buf, &key);
        let wire = buf.as_ref();
        assert_eq!(&wire[..8], &key.key_id());
        // key_id(8) + msg_key(16) + at least one cipher block
        assert!(wire.len() >= 8 + 16 + 16);
        assert_eq!((wire.len() - 24) % 16, 0);
    }

    #[test]
    fn frame_round_trips_across_padding_boundary() {
        let key = test_key();
        for body_len in [0usize, 1, 15, 16, 17] {
            let body: Vec<u8> = (0..body_len as u8).collect();
            let mut buf = DequeBuffer::with_capacity(body_len + 32, 32);
            buf.extend(body.iter().copied());
            let rnd = [0x5Au8; 32];
            do_encrypt_frame(&mut buf, &key, &rnd);

            let mut wire = buf.as_ref().to_vec();
            assert_eq!(&wire[..8], &key.key_id());
            let mut msg_key = [0u8; 16];
            msg_key.copy_from_slice(&wire[8..24]);
            let (k, iv) = calc_key(&key, &msg_key, Side::Client);
            aes::ige_decrypt(&mut wire[24..], &k, &iv);
            assert_eq!(&wire[24..24 + body_len], &body[..], "body_len {body_len}");
        }
    }

    #[test]
    fn old_kdf_is_deterministic() {
        let key = test_key();
        let msg_key = [9u8; 16];
        let (k1, iv1) = old_kdf(&msg_key, &key);
        let (k2, iv2) = old_kdf(&msg_key, &key);
        assert_eq!(k1, k2);
        assert_eq!(iv1, iv2);
        assert_ne!(k1, iv1);
    }
}
