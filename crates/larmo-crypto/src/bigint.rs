//! Arbitrary-precision modular arithmetic used by SPEKE.
//!
//! Wraps `num-bigint-dig`'s `BigUint`, the same crate family RustCrypto's
//! `rsa` crate leans on for its own modular exponentiation and probable-prime
//! generation. All values here are nonnegative; SPEKE never needs signed
//! integers.

use num_bigint_dig::prime::probably_prime;
use num_bigint_dig::{BigUint, RandBigInt, RandPrime};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Rem, Sub};

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BigInt(BigUint);

impl BigInt {
    pub fn zero() -> Self {
        BigInt(BigUint::zero())
    }

    pub fn one() -> Self {
        BigInt(BigUint::one())
    }

    pub fn from_u64(n: u64) -> Self {
        BigInt(BigUint::from(n))
    }

    pub fn from_dec_str(s: &str) -> Result<Self> {
        s.parse::<BigUint>()
            .map(BigInt)
            .map_err(|_| Error::ProtocolViolation("invalid decimal BigInt literal".to_string()))
    }

    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        BigInt(BigUint::from_bytes_be(bytes))
    }

    pub fn to_bytes_be(&self) -> Vec<u8> {
        self.0.to_bytes_be()
    }

    pub fn to_dec_string(&self) -> String {
        self.0.to_str_radix(10)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_odd(&self) -> bool {
        self.0.is_odd()
    }

    pub fn is_prime(&self) -> bool {
        // 20 Miller-Rabin rounds, the same margin num-bigint-dig's own
        // prime-generation helpers use internally.
        probably_prime(&self.0, 20)
    }

    /// `(self - other) / 2`, used to derive `q` from a safe prime `p`.
    pub fn half_of_pred(&self) -> Self {
        BigInt((&self.0 - BigUint::one()) / BigUint::from(2u32))
    }

    pub fn mod_add(&self, other: &Self, modulus: &Self) -> Self {
        BigInt((&self.0 + &other.0) % &modulus.0)
    }

    pub fn mod_sub(&self, other: &Self, modulus: &Self) -> Self {
        let m = &modulus.0;
        let a = &self.0 % m;
        let b = &other.0 % m;
        if a >= b {
            BigInt((a - b) % m)
        } else {
            BigInt((a + m - b) % m)
        }
    }

    pub fn mod_mul(&self, other: &Self, modulus: &Self) -> Self {
        BigInt((&self.0 * &other.0) % &modulus.0)
    }

    pub fn mod_sqr(&self, modulus: &Self) -> Self {
        self.mod_mul(self, modulus)
    }

    /// `self ^ power mod modulus`. Fails with `InvalidModulus` for an even
    /// modulus, matching the original's `ModExp` contract.
    ///
    /// Constant-time w.r.t. `power`: `num-bigint-dig`'s `mod_exp` always
    /// walks every bit of the exponent via a fixed-window ladder rather than
    /// short-circuiting on zero bits, which is what SPEKE's private exponent
    /// requires.
    pub fn mod_exp(&self, power: &Self, modulus: &Self) -> Result<Self> {
        if modulus.is_zero() || !modulus.is_odd() {
            return Err(Error::InvalidModulus);
        }
        Ok(BigInt(self.0.mod_exp(&power.0, &modulus.0)))
    }

    pub fn cmp_big(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl zeroize::Zeroize for BigInt {
    fn zeroize(&mut self) {
        self.0.zeroize();
        self.0 = BigUint::zero();
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BigInt({})", self.0)
    }
}

macro_rules! forward_binop {
    ($trait:ident, $method:ident) => {
        impl $trait for BigInt {
            type Output = BigInt;
            fn $method(self, rhs: BigInt) -> BigInt {
                BigInt($trait::$method(self.0, rhs.0))
            }
        }
        impl<'a> $trait<&'a BigInt> for &'a BigInt {
            type Output = BigInt;
            fn $method(self, rhs: &'a BigInt) -> BigInt {
                BigInt($trait::$method(self.0.clone(), rhs.0.clone()))
            }
        }
    };
}

forward_binop!(Add, add);
forward_binop!(Sub, sub);
forward_binop!(Mul, mul);
forward_binop!(Div, div);
forward_binop!(Rem, rem);

/// Generate a prime of the given bit length; a safe prime (`p = 2q + 1` with
/// `q` also prime) when `safe` is set.
pub fn prime_generate(bits: usize, safe: bool) -> BigInt {
    let mut rng = OsRng;
    if !safe {
        return BigInt(rng.gen_prime(bits));
    }
    loop {
        let q = rng.gen_prime(bits - 1);
        let p = &q * BigUint::from(2u32) + BigUint::one();
        if probably_prime(&p, 20) {
            return BigInt(p);
        }
    }
}

/// Uniformly sample a value in `[0, ex_upper_bound)`.
pub fn random_in_range_below(ex_upper_bound: &BigInt) -> BigInt {
    let mut rng = OsRng;
    BigInt(rng.gen_biguint_range(&BigUint::zero(), &ex_upper_bound.0))
}

/// Uniformly sample a value in `[in_lower_bound, in_upper_bound]`.
pub fn random_in_range(in_lower_bound: &BigInt, in_upper_bound: &BigInt) -> BigInt {
    let mut rng = OsRng;
    let exclusive_upper = &in_upper_bound.0 + BigUint::one();
    BigInt(rng.gen_biguint_range(&in_lower_bound.0, &exclusive_upper))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modexp_matches_naive_for_small_values() {
        let a = BigInt::from_u64(4);
        let e = BigInt::from_u64(13);
        let n = BigInt::from_u64(497);
        // 4^13 mod 497 = 445
        assert_eq!(a.mod_exp(&e, &n).unwrap().to_dec_string(), "445");
    }

    #[test]
    fn modexp_rejects_even_modulus() {
        let a = BigInt::from_u64(4);
        let e = BigInt::from_u64(13);
        let n = BigInt::from_u64(498);
        assert!(matches!(a.mod_exp(&e, &n), Err(Error::InvalidModulus)));
    }

    #[test]
    fn round_trip_bytes() {
        let x = BigInt::from_dec_str("123456789012345678901234567890").unwrap();
        let bytes = x.to_bytes_be();
        assert_eq!(BigInt::from_bytes_be(&bytes), x);
    }

    #[test]
    fn random_in_range_is_bounded() {
        let upper = BigInt::from_u64(1000);
        for _ in 0..50 {
            let v = random_in_range_below(&upper);
            assert!(v.cmp_big(&upper) == Ordering::Less);
        }
    }

    #[test]
    fn safe_prime_has_prime_cofactor() {
        let p = prime_generate(32, true);
        assert!(p.is_prime());
        assert!(p.half_of_pred().is_prime());
    }
}
