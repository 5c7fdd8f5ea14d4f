//! AES-256 in IGE (Infinite Garble Extension) mode.
//!
//! IGE chains both the previous plaintext and the previous ciphertext block
//! into each encryption, so a single corrupted block garbles everything that
//! follows. MTProto frames are always padded to a whole number of blocks
//! before reaching this module.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

const BLOCK: usize = 16;

/// Encrypt `data` in place. `data.len()` must be a multiple of 16.
///
/// The 32-byte IV is split as `iv1 || iv2`: `iv1` seeds the ciphertext
/// chain, `iv2` the plaintext chain.
pub fn ige_encrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(data.len() % BLOCK, 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for block in data.chunks_exact_mut(BLOCK) {
        let plain: [u8; BLOCK] = (&*block).try_into().unwrap();
        for (b, p) in block.iter_mut().zip(prev_cipher.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev_plain.iter()) {
            *b ^= p;
        }
        prev_cipher.copy_from_slice(block);
        prev_plain = plain;
    }
}

/// Decrypt `data` in place. `data.len()` must be a multiple of 16.
pub fn ige_decrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(data.len() % BLOCK, 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for block in data.chunks_exact_mut(BLOCK) {
        let cipher_text: [u8; BLOCK] = (&*block).try_into().unwrap();
        for (b, p) in block.iter_mut().zip(prev_plain.iter()) {
            *b ^= p;
        }
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev_cipher.iter()) {
            *b ^= p;
        }
        prev_cipher = cipher_text;
        prev_plain.copy_from_slice(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ige_round_trip() {
        let key = [7u8; 32];
        let iv = [3u8; 32];
        let original: Vec<u8> = (0..64u8).collect();

        let mut data = original.clone();
        ige_encrypt(&mut data, &key, &iv);
        assert_ne!(data, original);
        ige_decrypt(&mut data, &key, &iv);
        assert_eq!(data, original);
    }

    #[test]
    fn ige_chains_blocks() {
        let key = [1u8; 32];
        let iv = [0u8; 32];
        // Two identical plaintext blocks must not produce identical
        // ciphertext blocks.
        let mut data = vec![0xABu8; 32];
        ige_encrypt(&mut data, &key, &iv);
        assert_ne!(&data[..16], &data[16..]);
    }
}
