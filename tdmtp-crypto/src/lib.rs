//! Cryptographic primitives for MTProto v1.
//!
//! Provides:
//! - AES-256-IGE encryption/decryption
//! - SHA-1 / SHA-256 / MD5 hash macros
//! - Fermat + Pollard-rho PQ factorization
//! - RSA keys (decimal or PEM), fingerprints and the 255-byte padded encryption
//! - Miller–Rabin and DH prime / range validation
//! - `AuthKey`: 256-byte session key
//! - MTProto v1 message encryption / decryption
//! - DH nonce→key derivation

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod factorize;
pub mod prime;
pub mod rsa;
mod sha;

use std::fmt;

pub use auth_key::AuthKey;
pub use factorize::factorize;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors from the primitives in this crate.
#[derive(Clone, Debug, PartialEq)]
pub enum CryptoError {
    /// AES input is not a whole number of 16-byte blocks.
    Misaligned { len: usize },
    /// A frame or buffer has an impossible length.
    InvalidLength { len: usize },
    /// The `auth_key_id` in the frame does not match our key.
    AuthKeyMismatch,
    /// `p_q_inner_data` does not fit the 255-byte RSA block.
    RsaPayloadTooLarge { len: usize },
    /// The PEM text could not be parsed into `(n, e)`.
    BadPem(&'static str),
    /// `pq` is prime, too small, or resisted every method.
    Factorization { pq: u64 },
    /// The OS random source failed.
    Random,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { len } => write!(f, "AES-IGE input of {len} bytes is not block-aligned"),
            Self::InvalidLength { len } => write!(f, "invalid buffer length {len}"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::RsaPayloadTooLarge { len } => write!(f, "RSA payload of {len} bytes is too large"),
            Self::BadPem(why) => write!(f, "bad RSA public key: {why}"),
            Self::Factorization { pq } => write!(f, "cannot factorize pq={pq}"),
            Self::Random => write!(f, "getrandom failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Fill `buf` from the OS random source.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::Random)
}

// ─── MTProto v1 encrypt / decrypt ────────────────────────────────────────────

/// Which half of the auth key a direction uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Client → server.
    Client,
    /// Server → client.
    Server,
}

impl Side {
    fn x(self) -> usize { match self { Side::Client => 0, Side::Server => 8 } }
}

/// Derive the AES key and IV for one message from the auth key and `msg_key`.
pub fn prepare_aes(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let key = &auth_key.data;
    let a = sha1!(msg_key, &key[x..x + 32]);
    let b = sha1!(&key[32 + x..48 + x], msg_key, &key[48 + x..64 + x]);
    let c = sha1!(&key[64 + x..96 + x], msg_key);
    let d = sha1!(msg_key, &key[96 + x..128 + x]);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&a[..8]);
    aes_key[8..20].copy_from_slice(&b[8..20]);
    aes_key[20..].copy_from_slice(&c[4..16]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..12].copy_from_slice(&a[8..20]);
    aes_iv[12..20].copy_from_slice(&b[..8]);
    aes_iv[20..24].copy_from_slice(&c[16..20]);
    aes_iv[24..].copy_from_slice(&d[..8]);

    (aes_key, aes_iv)
}

/// `msg_key`: bytes 4..20 of the SHA-1 of the unpadded plaintext.
pub fn msg_key_for(plaintext: &[u8]) -> [u8; 16] {
    let sha = sha1!(plaintext);
    let mut out = [0u8; 16];
    out.copy_from_slice(&sha[4..20]);
    out
}

fn encrypt_for(plaintext: &[u8], auth_key: &AuthKey, random: &[u8; 16], side: Side) -> Result<Vec<u8>, CryptoError> {
    let msg_key = msg_key_for(plaintext);
    let (key, iv) = prepare_aes(auth_key, &msg_key, side);

    let pad = (16 - plaintext.len() % 16) % 16;
    let mut out = Vec::with_capacity(24 + plaintext.len() + pad);
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&msg_key);
    out.extend_from_slice(plaintext);
    out.extend_from_slice(&random[..pad]);
    aes::ige_encrypt(&mut out[24..], &key, &iv)?;
    Ok(out)
}

/// Encrypt an unpadded plaintext for the wire.
///
/// Returns `auth_key_id ‖ msg_key ‖ AES-IGE(plaintext ‖ padding)`; the
/// padding comes from `random` and fills up to the next 16-byte boundary.
pub fn encrypt_message(plaintext: &[u8], auth_key: &AuthKey, random: &[u8; 16]) -> Result<Vec<u8>, CryptoError> {
    encrypt_for(plaintext, auth_key, random, Side::Client)
}

/// Encrypt as the server would. Only mock servers and tests need this.
pub fn encrypt_message_as_server(plaintext: &[u8], auth_key: &AuthKey, random: &[u8; 16]) -> Result<Vec<u8>, CryptoError> {
    encrypt_for(plaintext, auth_key, random, Side::Server)
}

/// Decrypt a frame produced by the other side.
///
/// Checks the key id and block alignment and returns the `msg_key` from the
/// header with the still-padded plaintext. Verifying `msg_key` needs the
/// message length inside the plaintext, so it is left to the caller.
pub fn decrypt_message(frame: &[u8], auth_key: &AuthKey, side: Side) -> Result<([u8; 16], Vec<u8>), CryptoError> {
    if frame.len() < 24 || (frame.len() - 24) % 16 != 0 {
        return Err(CryptoError::InvalidLength { len: frame.len() });
    }
    if auth_key.key_id != frame[..8] {
        return Err(CryptoError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&frame[8..24]);

    let (key, iv) = prepare_aes(auth_key, &msg_key, side);
    let mut plain = frame[24..].to_vec();
    aes::ige_decrypt(&mut plain, &key, &iv)?;
    Ok((msg_key, plain))
}

/// Derive `(key, iv)` from nonces for decrypting `ServerDhParams.encrypted_answer`.
pub fn generate_key_data_from_nonce(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}
