//! SHA3-512 digest, HMAC-SHA3-512, and HKDF-SHA3-512, the only hash
//! primitives SPEKE and its session layer use.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha3::{Digest, Sha3_512};

use crate::error::{Error, Result};

pub const HKDF_INFO: &[u8] = b"Larmo_SPEKE_HKDF";
pub const KCD_PREFIX: &[u8] = b"KC_1_U";
pub const DERIVED_KEY_LEN: usize = 24;

type HmacSha3_512 = Hmac<Sha3_512>;

/// `H(x) = SHA3-512(x)`.
pub fn hash(x: &[u8]) -> Vec<u8> {
    Sha3_512::digest(x).to_vec()
}

/// `HMAC_K(m)` — HMAC-SHA3-512 keyed by `key`.
pub fn hmac(key: &[u8], m: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha3_512::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(m);
    mac.finalize().into_bytes().to_vec()
}

/// Verify `tag == HMAC_K(m)` in constant time.
pub fn hmac_verify(key: &[u8], m: &[u8], tag: &[u8]) -> Result<()> {
    let mut mac = HmacSha3_512::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(m);
    mac.verify_slice(tag).map_err(|_| Error::MessageTamper)
}

/// `HKDF(ikm, salt, info, L)` — HKDF-Extract-and-Expand with SHA3-512.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha3_512>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::ProtocolViolation("HKDF output length too large".to_string()))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_64_bytes() {
        assert_eq!(hash(b"hello").len(), 64);
    }

    #[test]
    fn hmac_round_trips() {
        let key = b"a key";
        let tag = hmac(key, b"message");
        assert!(hmac_verify(key, b"message", &tag).is_ok());
        assert!(hmac_verify(key, b"tampered", &tag).is_err());
    }

    #[test]
    fn hkdf_produces_requested_length() {
        let okm = hkdf(b"ikm", b"salt", HKDF_INFO, DERIVED_KEY_LEN).unwrap();
        assert_eq!(okm.len(), DERIVED_KEY_LEN);
    }
}
