//! Plaintext and encrypted frame assembly.

use carrier_crypto::{AuthKey, DecryptError, DequeBuffer, aes, old_kdf, sha1};

/// Room reserved at the front of the outgoing buffer for the frame header
/// (salt + session id + msg id + seq no + len, plus key id + msg key).
const HEADER_ROOM: usize = 56;

/// A message recovered from an encrypted frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    pub salt: i64,
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// Errors from frame parsing and decryption.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    Decrypt(DecryptError),
    Truncated,
    /// The decrypted `session_id` is not ours.
    SessionIdMismatch { got: i64 },
    /// The inner length field exceeds the decrypted payload.
    BadLength,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decrypt(e) => write!(f, "{e}"),
            Self::Truncated => write!(f, "frame truncated"),
            Self::SessionIdMismatch { got } => write!(f, "unknown session id {got:x}"),
            Self::BadLength => write!(f, "inner length exceeds payload"),
        }
    }
}
impl std::error::Error for FrameError {}

impl From<DecryptError> for FrameError {
    fn from(e: DecryptError) -> Self {
        Self::Decrypt(e)
    }
}

// ─── Plaintext frames ────────────────────────────────────────────────────────

/// Assemble an unencrypted frame: `zero_key_id || msg_id || len || body`,
/// followed by random padding so the length leaks less.
pub fn build_plain_frame(msg_id: i64, body: &[u8]) -> Vec<u8> {
    let mut rnd = [0u8; 1];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    let pad = (16usize.wrapping_sub(body.len()) % 16) + 16 * usize::from(rnd[0] % 16);
    let mut out = Vec::with_capacity(20 + body.len() + pad);
    out.extend([0u8; 8]);
    out.extend(msg_id.to_le_bytes());
    out.extend((body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    let mut padding = vec![0u8; pad];
    getrandom::getrandom(&mut padding).expect("getrandom failed");
    out.extend(padding);
    out
}

/// Parse an unencrypted frame back into `(msg_id, body)`.
pub fn parse_plain_frame(frame: &[u8]) -> Result<(i64, &[u8]), FrameError> {
    if frame.len() < 20 {
        return Err(FrameError::Truncated);
    }
    if frame[..8] != [0u8; 8] {
        return Err(FrameError::Decrypt(DecryptError::AuthKeyMismatch));
    }
    let msg_id = i64::from_le_bytes(frame[8..16].try_into().unwrap());
    let len = u32::from_le_bytes(frame[16..20].try_into().unwrap()) as usize;
    if 20 + len > frame.len() {
        return Err(FrameError::BadLength);
    }
    Ok((msg_id, &frame[20..20 + len]))
}

// ─── Encrypted frames ────────────────────────────────────────────────────────

/// Assemble and encrypt an MTProto 2.0 frame under the temporary key.
pub fn build_encrypted_frame(
    temp_key: &AuthKey,
    salt: i64,
    session_id: i64,
    msg_id: i64,
    seq_no: i32,
    body: &[u8],
) -> Vec<u8> {
    let mut buffer = DequeBuffer::with_capacity(32 + body.len(), HEADER_ROOM);
    buffer.extend(body.iter().copied());
    buffer.extend_front(&(body.len() as u32).to_le_bytes());
    buffer.extend_front(&seq_no.to_le_bytes());
    buffer.extend_front(&msg_id.to_le_bytes());
    buffer.extend_front(&session_id.to_le_bytes());
    buffer.extend_front(&salt.to_le_bytes());
    carrier_crypto::encrypt_frame(&mut buffer, temp_key);
    buffer.into_vec()
}

/// Decrypt an incoming frame and peel the inner header.
pub fn open_encrypted_frame(
    temp_key: &AuthKey,
    session_id: i64,
    frame: &mut [u8],
) -> Result<DecryptedMessage, FrameError> {
    let plain = carrier_crypto::decrypt_frame(frame, temp_key)?;
    if plain.len() < 32 {
        return Err(FrameError::Truncated);
    }
    let salt = i64::from_le_bytes(plain[..8].try_into().unwrap());
    let got_session = i64::from_le_bytes(plain[8..16].try_into().unwrap());
    if got_session != session_id {
        return Err(FrameError::SessionIdMismatch { got: got_session });
    }
    let msg_id = i64::from_le_bytes(plain[16..24].try_into().unwrap());
    let seq_no = i32::from_le_bytes(plain[24..28].try_into().unwrap());
    let len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
    if 32 + len > plain.len() {
        return Err(FrameError::BadLength);
    }
    Ok(DecryptedMessage {
        salt,
        msg_id,
        seq_no,
        body: plain[32..32 + len].to_vec(),
    })
}

// ─── PFS bind payload ────────────────────────────────────────────────────────

/// Encrypt the `bind_temp_auth_key` inner payload under the *permanent* key
/// with the v1 scheme.
///
/// The inner message is `random(16) || msg_id || seq_no(0) || len || payload`,
/// padded to a block boundary; its SHA-1 tail is the message key.
pub fn encrypt_bind_payload(perm_key: &AuthKey, msg_id: i64, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(32 + payload.len() + 16);
    let mut prefix = [0u8; 16];
    getrandom::getrandom(&mut prefix).expect("getrandom failed");
    inner.extend(prefix);
    inner.extend(msg_id.to_le_bytes());
    inner.extend(0i32.to_le_bytes());
    inner.extend((payload.len() as u32).to_le_bytes());
    inner.extend_from_slice(payload);

    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&sha1!(&inner)[4..20]);

    let pad = (16 - inner.len() % 16) % 16;
    let mut padding = vec![0u8; pad];
    getrandom::getrandom(&mut padding).expect("getrandom failed");
    inner.extend(padding);

    let (key, iv) = old_kdf(&msg_key, perm_key);
    aes::ige_encrypt(&mut inner, &key, &iv);

    let mut out = Vec::with_capacity(24 + inner.len());
    out.extend(perm_key.key_id());
    out.extend(msg_key);
    out.extend(inner);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AuthKey {
        let mut data = [0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i.wrapping_mul(7) as u8;
        }
        AuthKey::from_bytes(data)
    }

    #[test]
    fn plain_frame_round_trip() {
        let body = [0xAB; 37];
        let frame = build_plain_frame(0x1234_5678_0000_0004, &body);
        let (msg_id, parsed) = parse_plain_frame(&frame).unwrap();
        assert_eq!(msg_id, 0x1234_5678_0000_0004);
        assert_eq!(parsed, &body[..]);
    }

    #[test]
    fn plain_frame_rejects_nonzero_key_id() {
        let mut frame = build_plain_frame(4, &[1, 2, 3, 4]);
        frame[0] = 1;
        assert!(matches!(
            parse_plain_frame(&frame),
            Err(FrameError::Decrypt(DecryptError::AuthKeyMismatch))
        ));
    }

    #[test]
    fn encrypted_frame_header_layout() {
        let key = test_key();
        let wire = build_encrypted_frame(&key, 7, 9, 1 << 32, 1, &[0u8; 20]);
        assert_eq!(&wire[..8], &key.key_id());
        assert_eq!((wire.len() - 24) % 16, 0);
    }

    #[test]
    fn bind_payload_is_block_aligned_and_keyed() {
        let key = test_key();
        let wire = encrypt_bind_payload(&key, 1 << 32, &[0x42; 40]);
        assert_eq!(&wire[..8], &key.key_id());
        assert_eq!((wire.len() - 24) % 16, 0);
        // 16-byte prefix + 8 + 4 + 4 header + 40 payload, padded
        assert!(wire.len() >= 24 + 72);
    }
}
