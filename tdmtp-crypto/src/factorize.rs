//! Factorization of the `pq` semiprime sent in `resPQ`.
//!
//! Fermat's method runs first for a bounded number of steps (it wins when
//! the factors are close together), then Pollard-rho in Brent's variant.

use num_bigint::BigUint;

use crate::prime::is_probable_prime;
use crate::CryptoError;

const FERMAT_STEPS: u64 = 1 << 16;

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 { let t = b; b = a % b; a = t; }
    a
}

fn modpow(mut n: u128, mut e: u128, m: u128) -> u128 {
    if m == 1 { return 0; }
    let mut result = 1;
    n %= m;
    while e > 0 {
        if e & 1 == 1 { result = result * n % m; }
        e >>= 1;
        n = n * n % m;
    }
    result
}

fn abs_sub(a: u128, b: u128) -> u128 { a.max(b) - a.min(b) }

fn isqrt_ceil(n: u128) -> u128 {
    let mut r = (n as f64).sqrt() as u128;
    while r * r > n { r -= 1; }
    while r * r < n { r += 1; }
    r
}

fn fermat(pq: u128) -> Option<(u64, u64)> {
    let mut a = isqrt_ceil(pq);
    for _ in 0..FERMAT_STEPS {
        let b2 = a * a - pq;
        let b = isqrt_ceil(b2);
        if b * b == b2 {
            let (p, q) = (a - b, a + b);
            return (p > 1).then_some((p as u64, q as u64));
        }
        a += 1;
    }
    None
}

fn factorize_with(pq: u128, c: u128) -> (u64, u64) {
    if pq % 2 == 0 { return (2, (pq / 2) as u64); }

    let mut y = 3 * (pq / 7);
    let m = 7 * (pq / 13);
    let mut g = 1u128;
    let mut r = 1u128;
    let mut q = 1u128;
    let mut x = 0u128;
    let mut ys = 0u128;

    while g == 1 {
        x = y;
        for _ in 0..r { y = (modpow(y, 2, pq) + c) % pq; }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..m.min(r - k) {
                y = (modpow(y, 2, pq) + c) % pq;
                q = q * abs_sub(x, y) % pq;
            }
            g = gcd(q, pq);
            k += m;
        }
        r *= 2;
    }

    if g == pq {
        loop {
            ys = (modpow(ys, 2, pq) + c) % pq;
            g = gcd(abs_sub(x, ys), pq);
            if g > 1 { break; }
        }
    }

    let p = g as u64;
    let q = (pq / g) as u64;
    (p.min(q), p.max(q))
}

/// Factorize `pq` into two factors `(p, q)` where `p ≤ q`.
///
/// Primes, values below 4 and inputs no method cracks are reported as
/// [`CryptoError::Factorization`].
pub fn factorize(pq: u64) -> Result<(u64, u64), CryptoError> {
    if pq < 4 || is_probable_prime(&BigUint::from(pq), 20) {
        return Err(CryptoError::Factorization { pq });
    }
    let n = pq as u128;
    if let Some(found) = fermat(n) {
        return Ok(found);
    }
    for attempt in [43u128, 47, 53, 59, 61] {
        let c = attempt * (n / 103);
        let (p, q) = factorize_with(n, c);
        if p != 1 { return Ok((p, q)); }
    }
    Err(CryptoError::Factorization { pq })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test] fn t1() { assert_eq!(factorize(1470626929934143021), Ok((1206429347, 1218991343))); }
    #[test] fn t2() { assert_eq!(factorize(2363612107535801713), Ok((1518968219, 1556064227))); }
    #[test] fn small() { assert_eq!(factorize(3233), Ok((53, 61))); }
    #[test] fn even() { assert_eq!(factorize(2 * 1000003), Ok((2, 1000003))); }

    #[test]
    fn primes_are_rejected() {
        assert_eq!(factorize(1000003), Err(CryptoError::Factorization { pq: 1000003 }));
        assert_eq!(factorize(2), Err(CryptoError::Factorization { pq: 2 }));
    }

    proptest! {
        #[test]
        fn sorted_factors(i in 0usize..10, j in 0usize..10) {
            const PRIMES: [u64; 10] = [
                1000003, 1000033, 1000037, 1000039, 1206429347,
                1218991343, 1518968219, 1556064227, 2147483647, 2147483629,
            ];
            let (p, q) = (PRIMES[i], PRIMES[j]);
            prop_assert_eq!(factorize(p * q), Ok((p.min(q), p.max(q))));
        }
    }
}
