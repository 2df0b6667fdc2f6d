//! AES-256 in Infinite Garble Extension (IGE) mode.
//!
//! The 32-byte IV is two blocks: the first stands in for the previous
//! ciphertext block, the second for the previous plaintext block.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};

use crate::CryptoError;

fn check(buffer: &[u8]) -> Result<(), CryptoError> {
    if buffer.len() % 16 != 0 {
        return Err(CryptoError::Misaligned { len: buffer.len() });
    }
    Ok(())
}

fn xor_into(dst: &mut [u8; 16], a: &[u8], b: &[u8]) {
    for i in 0..16 {
        dst[i] = a[i] ^ b[i];
    }
}

/// Encrypt `buffer` in place. Its length must be a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) -> Result<(), CryptoError> {
    check(buffer)?;
    let cipher = Aes256::new(key.into());

    let mut prev_cipher = [0u8; 16];
    let mut prev_plain = [0u8; 16];
    prev_cipher.copy_from_slice(&iv[..16]);
    prev_plain.copy_from_slice(&iv[16..]);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut plain = [0u8; 16];
        plain.copy_from_slice(chunk);

        let mut x = [0u8; 16];
        xor_into(&mut x, &plain, &prev_cipher);
        let mut block = Block::from(x);
        cipher.encrypt_block(&mut block);

        let mut out = [0u8; 16];
        xor_into(&mut out, &block, &prev_plain);
        chunk.copy_from_slice(&out);

        prev_cipher = out;
        prev_plain = plain;
    }
    Ok(())
}

/// Decrypt `buffer` in place. Its length must be a multiple of 16.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) -> Result<(), CryptoError> {
    check(buffer)?;
    let cipher = Aes256::new(key.into());

    let mut prev_cipher = [0u8; 16];
    let mut prev_plain = [0u8; 16];
    prev_cipher.copy_from_slice(&iv[..16]);
    prev_plain.copy_from_slice(&iv[16..]);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut ciphertext = [0u8; 16];
        ciphertext.copy_from_slice(chunk);

        let mut x = [0u8; 16];
        xor_into(&mut x, &ciphertext, &prev_plain);
        let mut block = Block::from(x);
        cipher.decrypt_block(&mut block);

        let mut out = [0u8; 16];
        xor_into(&mut out, &block, &prev_cipher);
        chunk.copy_from_slice(&out);

        prev_cipher = ciphertext;
        prev_plain = out;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn misaligned_input_is_rejected() {
        let mut buf = [0u8; 17];
        assert_eq!(
            ige_encrypt(&mut buf, &[0; 32], &[0; 32]),
            Err(CryptoError::Misaligned { len: 17 })
        );
    }

    #[test]
    fn chaining_depends_on_previous_block() {
        let key = [7u8; 32];
        let iv = [9u8; 32];
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 1;
        ige_encrypt(&mut a, &key, &iv).unwrap();
        ige_encrypt(&mut b, &key, &iv).unwrap();
        // a change in block 0 garbles block 1 as well
        assert_ne!(a[16..], b[16..]);
    }

    proptest! {
        #[test]
        fn round_trip(blocks in 0usize..8, key: [u8; 32], iv: [u8; 32], seed: u8) {
            let plain: Vec<u8> = (0..blocks * 16).map(|i| (i as u8).wrapping_mul(seed)).collect();
            let mut buf = plain.clone();
            ige_encrypt(&mut buf, &key, &iv).unwrap();
            ige_decrypt(&mut buf, &key, &iv).unwrap();
            prop_assert_eq!(buf, plain);
        }
    }
}
