//! RSA public keys and the padding used by the v1 key exchange.

use base64::Engine as _;
use num_bigint::BigUint;
use tdmtp_tl_types::Serializable;

use crate::{sha1, CryptoError};

/// Largest payload that fits next to its SHA-1 in the 255-byte block.
pub const MAX_PAYLOAD: usize = 255 - 20;

/// An RSA public key (n, e).
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    /// Parse a PKCS#1 `-----BEGIN RSA PUBLIC KEY-----` block.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let body: String = pem
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("-----"))
            .collect();
        let der = base64::engine::general_purpose::STANDARD
            .decode(body.as_bytes())
            .map_err(|_| CryptoError::BadPem("invalid base64"))?;

        let mut der = Der(&der);
        let mut seq = Der(der.element(0x30)?);
        let n = seq.element(0x02)?;
        let e = seq.element(0x02)?;
        Ok(Self { n: BigUint::from_bytes_be(n), e: BigUint::from_bytes_be(e) })
    }

    /// The 64-bit fingerprint servers advertise in `resPQ`:
    /// the low eight bytes of `SHA1(bytes(n) ‖ bytes(e))`, little-endian.
    pub fn fingerprint(&self) -> i64 {
        let mut buf = Vec::with_capacity(270);
        self.n.to_bytes_be().serialize(&mut buf);
        self.e.to_bytes_be().serialize(&mut buf);
        let sha = sha1!(&buf);
        let mut low = [0u8; 8];
        low.copy_from_slice(&sha[12..20]);
        i64::from_le_bytes(low)
    }

    /// Raw RSA on a big-endian block. The result is left-padded to 256 bytes.
    pub fn encrypt_raw(&self, block: &[u8]) -> Vec<u8> {
        let encrypted = BigUint::from_bytes_be(block).modpow(&self.e, &self.n);
        let bytes = encrypted.to_bytes_be();
        let mut out = vec![0u8; 256usize.saturating_sub(bytes.len())];
        out.extend_from_slice(&bytes);
        out
    }
}

/// RSA-encrypt `data` the way `p_q_inner_data` is sent:
/// the 255-byte block `SHA1(data) ‖ data ‖ random` is raised to `e`.
///
/// `random` supplies the tail padding; only its first `235 - data.len()`
/// bytes are used.
pub fn encrypt_padded(data: &[u8], key: &Key, random: &[u8; 255]) -> Result<Vec<u8>, CryptoError> {
    if data.len() > MAX_PAYLOAD {
        return Err(CryptoError::RsaPayloadTooLarge { len: data.len() });
    }
    let mut block = Vec::with_capacity(255);
    block.extend_from_slice(&sha1!(data));
    block.extend_from_slice(data);
    block.extend_from_slice(&random[..MAX_PAYLOAD - data.len()]);
    Ok(key.encrypt_raw(&block))
}

/// Just enough DER to walk `SEQUENCE { INTEGER, INTEGER }`.
struct Der<'a>(&'a [u8]);

impl<'a> Der<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        if self.0.len() < len {
            return Err(CryptoError::BadPem("truncated DER"));
        }
        let (head, rest) = self.0.split_at(len);
        self.0 = rest;
        Ok(head)
    }

    fn element(&mut self, tag: u8) -> Result<&'a [u8], CryptoError> {
        let header = self.take(2)?;
        if header[0] != tag {
            return Err(CryptoError::BadPem("unexpected DER tag"));
        }
        let len = match header[1] {
            short if short < 0x80 => short as usize,
            long => {
                let count = (long & 0x7f) as usize;
                if count == 0 || count > 4 {
                    return Err(CryptoError::BadPem("bad DER length"));
                }
                self.take(count)?.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
            }
        };
        self.take(len)
    }
}
