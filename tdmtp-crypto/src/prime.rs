//! Big-number helpers for the DH exchange and validation of server primes.

use num_bigint::BigUint;
use num_traits::{CheckedSub, One, ToPrimitive, Zero};

/// The 2048-bit safe prime servers hand out in practice. Seeing it again
/// skips the expensive primality checks for the generators it supports.
pub const KNOWN_PRIME: [u8; 256] = [
    0xC7, 0x1C, 0xAE, 0xB9, 0xC6, 0xB1, 0xC9, 0x04, 0x8E, 0x6C, 0x52, 0x2F, 0x70, 0xF1, 0x3F, 0x73,
    0x98, 0x0D, 0x40, 0x23, 0x8E, 0x3E, 0x21, 0xC1, 0x49, 0x34, 0xD0, 0x37, 0x56, 0x3D, 0x93, 0x0F,
    0x48, 0x19, 0x8A, 0x0A, 0xA7, 0xC1, 0x40, 0x58, 0x22, 0x94, 0x93, 0xD2, 0x25, 0x30, 0xF4, 0xDB,
    0xFA, 0x33, 0x6F, 0x6E, 0x0A, 0xC9, 0x25, 0x13, 0x95, 0x43, 0xAE, 0xD4, 0x4C, 0xCE, 0x7C, 0x37,
    0x20, 0xFD, 0x51, 0xF6, 0x94, 0x58, 0x70, 0x5A, 0xC6, 0x8C, 0xD4, 0xFE, 0x6B, 0x6B, 0x13, 0xAB,
    0xDC, 0x97, 0x46, 0x51, 0x29, 0x69, 0x32, 0x84, 0x54, 0xF1, 0x8F, 0xAF, 0x8C, 0x59, 0x5F, 0x64,
    0x24, 0x77, 0xFE, 0x96, 0xBB, 0x2A, 0x94, 0x1D, 0x5B, 0xCD, 0x1D, 0x4A, 0xC8, 0xCC, 0x49, 0x88,
    0x07, 0x08, 0xFA, 0x9B, 0x37, 0x8E, 0x3C, 0x4F, 0x3A, 0x90, 0x60, 0xBE, 0xE6, 0x7C, 0xF9, 0xA4,
    0xA4, 0xA6, 0x95, 0x81, 0x10, 0x51, 0x90, 0x7E, 0x16, 0x27, 0x53, 0xB5, 0x6B, 0x0F, 0x6B, 0x41,
    0x0D, 0xBA, 0x74, 0xD8, 0xA8, 0x4B, 0x2A, 0x14, 0xB3, 0x14, 0x4E, 0x0E, 0xF1, 0x28, 0x47, 0x54,
    0xFD, 0x17, 0xED, 0x95, 0x0D, 0x59, 0x65, 0xB4, 0xB9, 0xDD, 0x46, 0x58, 0x2D, 0xB1, 0x17, 0x8D,
    0x16, 0x9C, 0x6B, 0xC4, 0x65, 0xB0, 0xD6, 0xFF, 0x9C, 0xA3, 0x92, 0x8F, 0xEF, 0x5B, 0x9A, 0xE4,
    0xE4, 0x18, 0xFC, 0x15, 0xE8, 0x3E, 0xBE, 0xA0, 0xF8, 0x7F, 0xA9, 0xFF, 0x5E, 0xED, 0x70, 0x05,
    0x0D, 0xED, 0x28, 0x49, 0xF4, 0x7B, 0xF9, 0x59, 0xD9, 0x56, 0x85, 0x0C, 0xE9, 0x29, 0x85, 0x1F,
    0x0D, 0x81, 0x15, 0xF6, 0x35, 0xB1, 0x05, 0xEE, 0x2E, 0x4E, 0x15, 0xD0, 0x4B, 0x24, 0x54, 0xBF,
    0x6F, 0x4F, 0xAD, 0xF0, 0x34, 0xB1, 0x04, 0x03, 0x11, 0x9C, 0xD8, 0xE3, 0xB9, 0x2F, 0xCC, 0x5B,
];

/// Miller–Rabin rounds used for server-supplied primes.
pub const PRIME_CHECK_ITERATIONS: usize = 30;

const SMALL_PRIMES: [u32; 30] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113,
];

/// `base^exp mod modulus` on big-endian byte strings.
///
/// The result is left-padded with zeros to the byte length of `modulus`.
pub fn mod_exp(base: &[u8], exp: &[u8], modulus: &[u8]) -> Vec<u8> {
    let m = BigUint::from_bytes_be(modulus);
    if m.is_zero() {
        return Vec::new();
    }
    let r = BigUint::from_bytes_be(base).modpow(&BigUint::from_bytes_be(exp), &m);
    let bytes = r.to_bytes_be();
    let width = modulus.len().max(bytes.len());
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

/// Miller–Rabin test after trial division by small primes.
///
/// Bases are the first `iterations` primes (at most thirty), so the answer
/// is reproducible.
pub fn is_probable_prime(n: &BigUint, iterations: usize) -> bool {
    let two = BigUint::from(2u32);
    if n < &two {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if n == &p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    let n_minus_1 = n - 1u32;
    let s = n_minus_1.trailing_zeros().unwrap_or(0);
    let d = &n_minus_1 >> s;

    'witness: for a in SMALL_PRIMES.iter().take(iterations) {
        let mut x = BigUint::from(*a).modpow(&d, n);
        if x.is_one() || x == n_minus_1 {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn residue(p: &BigUint, m: u32) -> u32 {
    (p % m).to_u32().unwrap_or(u32::MAX)
}

/// Generator check: `g` must generate the cyclic subgroup of order `(p-1)/2`.
fn generator_ok(p: &BigUint, g: i32) -> bool {
    match g {
        2 => residue(p, 8) == 7,
        3 => residue(p, 3) == 2,
        4 => true,
        5 => matches!(residue(p, 5), 1 | 4),
        6 => matches!(residue(p, 24), 19 | 23),
        7 => matches!(residue(p, 7), 3 | 5 | 6),
        _ => false,
    }
}

/// Validates a DH prime and generator sent by the server.
///
/// `p` must be exactly 2048 bits, prime, `(p-1)/2` prime, and `g` must meet
/// its residue condition.
pub fn is_good_prime(p_bytes: &[u8], g: i32) -> bool {
    if p_bytes == KNOWN_PRIME.as_slice() && matches!(g, 3 | 4 | 5 | 7) {
        return true;
    }
    let p = BigUint::from_bytes_be(p_bytes);
    if p.bits() != 2048 || !generator_ok(&p, g) {
        return false;
    }
    if !is_probable_prime(&p, PRIME_CHECK_ITERATIONS) {
        return false;
    }
    let half = (&p - 1u32) >> 1u32;
    is_probable_prime(&half, PRIME_CHECK_ITERATIONS)
}

/// Range check for `g_a` and `g_b`: `1 < value < p - 1`, and kept at least
/// `2^(2048-64)` away from both ends.
pub fn check_dh_range(value: &BigUint, p: &BigUint) -> bool {
    if value <= &BigUint::one() || &(value + 1u32) >= p {
        return false;
    }
    let margin = BigUint::one() << (2048 - 64);
    match p.checked_sub(&margin) {
        Some(upper) => value >= &margin && value <= &upper,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_prime_accepted_for_supported_generators() {
        assert!(is_good_prime(&KNOWN_PRIME, 3));
        assert!(is_good_prime(&KNOWN_PRIME, 7));
    }

    #[test]
    fn composite_rejected() {
        let composite: BigUint = (BigUint::one() << 2047u32) + 1u32;
        assert!(!is_good_prime(&composite.to_bytes_be(), 4));
        assert!(!is_probable_prime(&composite, PRIME_CHECK_ITERATIONS));
    }

    #[test]
    fn short_prime_rejected() {
        assert!(!is_good_prime(&[0x17], 2));
        assert!(!is_good_prime(&KNOWN_PRIME[1..], 3));
    }

    #[test]
    fn unsupported_generator_rejected() {
        assert!(!is_good_prime(&KNOWN_PRIME, 8));
        assert!(!is_good_prime(&KNOWN_PRIME, 1));
    }

    #[test]
    fn miller_rabin_small_values() {
        let mersenne: BigUint = (BigUint::one() << 127u32) - 1u32;
        assert!(is_probable_prime(&mersenne, PRIME_CHECK_ITERATIONS));
        assert!(is_probable_prime(&BigUint::from(113u32), 5));
        assert!(!is_probable_prime(&BigUint::from(3233u32), 5));
        // Carmichael number
        assert!(!is_probable_prime(&BigUint::from(561u32), 5));
        assert!(!is_probable_prime(&BigUint::one(), 5));
    }

    #[test]
    fn mod_exp_pads_to_modulus() {
        assert_eq!(mod_exp(&[4], &[13], &[0x01, 0xf1]), vec![0x01, 0xbd]); // 4^13 mod 497 = 445
        assert_eq!(mod_exp(&[2], &[1], &[0x00, 0x07]), vec![0x00, 0x02]);
    }

    #[test]
    fn dh_range_edges() {
        let p = BigUint::from_bytes_be(&KNOWN_PRIME);
        assert!(!check_dh_range(&BigUint::one(), &p));
        assert!(!check_dh_range(&(&p - 1u32), &p));
        assert!(!check_dh_range(&BigUint::from(2u32), &p));
        assert!(check_dh_range(&(&p >> 1u32), &p));
    }
}
