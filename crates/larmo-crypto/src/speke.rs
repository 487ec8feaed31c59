//! Simple Password Exponential Key Exchange: a zero-knowledge,
//! password-authenticated Diffie-Hellman variant over a safe prime,
//! producing a symmetric key via HKDF plus mutual key confirmation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::bigint::{random_in_range, BigInt};
use crate::error::{Error, Result};
use crate::hash::{hash, hkdf, hmac, DERIVED_KEY_LEN, HKDF_INFO, KCD_PREFIX};

/// The 2048-bit safe prime `p` (with `(p-1)/2` also prime) this deployment
/// of the protocol shares between all parties, the Rust equivalent of the
/// original's compile-time `LRM_SPEKE_SAFE_PRIME` constant.
const SAFE_PRIME_DEC: &str = "28357981469131057016598131046061429943873497450760016848977050283909314913804881250739621855942458195195925700082203436036776086421829772525127146277261729313100250899230478633798563361124574756506897314459352578130171492304048773224476736359825240347063689316281085619710615086957895669246389755219516281588556667530542980946683595424542674955539373254051251356826724914945333709318281885142315719592450201649658657097242919833212557419466495257820477309663428253574127574400330765040283697780284390747198950782808211395218696361088069568026288513348879964643300415177493581429930905785135350179364960218607436763727";

static SAFE_PRIME_CELL: OnceLock<BigInt> = OnceLock::new();

/// The shared safe-prime SPEKE parameter (`p`). Parsed once, lazily.
pub fn default_safe_prime() -> BigInt {
    SAFE_PRIME_CELL
        .get_or_init(|| {
            BigInt::from_dec_str(SAFE_PRIME_DEC).expect("SAFE_PRIME_DEC is a valid decimal literal")
        })
        .clone()
}

/// The process-wide, per-remote-id monotonic counter the original keeps as
/// static module state. Injected as a shared collaborator instead, so tests
/// can scope it per server instance rather than leaking across the process.
#[derive(Default, Clone)]
pub struct IdCounter(Arc<Mutex<HashMap<String, u64>>>);

impl IdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, remote_id: &str) -> u64 {
        let mut counts = self.0.lock().expect("id counter mutex poisoned");
        let count = counts.entry(remote_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

/// A running SPEKE session, from construction through key confirmation.
pub struct Speke {
    id: String,
    p: BigInt,
    privkey: BigInt,
    pubkey: BigInt,
    remote_pubkey: Option<BigInt>,
    id_numbered: Option<String>,
    remote_id_numbered: Option<String>,
    keying_material: Option<Vec<u8>>,
    encryption_key: Option<Vec<u8>>,
    key_confirmation_data: Option<Vec<u8>>,
}

impl Speke {
    /// `id`, a secret `password` shared with the remote party, and a safe
    /// prime `p` (also shared). Fails with `InvalidPrime` if `p` is even.
    pub fn new(id: impl Into<String>, password: &str, p: BigInt) -> Result<Self> {
        if !p.is_odd() {
            return Err(Error::InvalidPrime);
        }
        let q = p.half_of_pred();
        let g = {
            let h = hash(password.as_bytes());
            BigInt::from_bytes_be(&h).mod_exp(&BigInt::from_u64(2), &p)?
        };
        let q_minus_one = &q - &BigInt::one();
        let privkey = random_in_range(&BigInt::one(), &q_minus_one);
        let pubkey = g.mod_exp(&privkey, &p)?;

        Ok(Speke {
            id: id.into(),
            p,
            privkey,
            pubkey,
            remote_pubkey: None,
            id_numbered: None,
            remote_id_numbered: None,
            keying_material: None,
            encryption_key: None,
            key_confirmation_data: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether `provide_remote_public_key_id_pair` has already run.
    pub fn remote_info_set(&self) -> bool {
        self.remote_pubkey.is_some()
    }

    /// The local public key `X = g^x mod p`, to be sent as `InitData`.
    pub fn public_key(&self) -> Result<Vec<u8>> {
        if self.pubkey.is_zero() {
            return Err(Error::ProtocolViolation("SPEKE public key is uninitialized".to_string()));
        }
        Ok(self.pubkey.to_bytes_be())
    }

    /// Ingest the remote party's `InitData { id', Y.bytes }`, deriving the
    /// keying material, and advancing `counter` for `remote_id`.
    pub fn provide_remote_public_key_id_pair(
        &mut self,
        remote_pubkey: &[u8],
        remote_id: &str,
        counter: &IdCounter,
    ) -> Result<()> {
        if self.remote_pubkey.is_some() {
            return Err(Error::ProtocolViolation(
                "the remote's information was already provided".to_string(),
            ));
        }
        if remote_id == self.id {
            return Err(Error::PeerIdentifierInvalid);
        }

        let y = BigInt::from_bytes_be(remote_pubkey);
        let p_minus_two = &self.p - &BigInt::from_u64(2);
        if y.cmp_big(&p_minus_two) == std::cmp::Ordering::Greater
            || y.cmp_big(&BigInt::from_u64(2)) == std::cmp::Ordering::Less
        {
            return Err(Error::PeerPublicKeyInvalid);
        }

        let n = counter.increment(remote_id);
        let id_numbered = format!("{}-{}", self.id, n);
        let remote_id_numbered = format!("{}-{}", remote_id, n);

        let k_raw = y.mod_exp(&self.privkey, &self.p)?;

        let (first_id, second_id) = min_max_str(&id_numbered, &remote_id_numbered);
        let (first_pk, second_pk) = min_max_bigint(&self.pubkey, &y);

        let mut t_input = Vec::new();
        t_input.extend_from_slice(first_id.as_bytes());
        t_input.extend_from_slice(second_id.as_bytes());
        t_input.extend_from_slice(&first_pk.to_bytes_be());
        t_input.extend_from_slice(&second_pk.to_bytes_be());
        t_input.extend_from_slice(&k_raw.to_bytes_be());
        let t = hash(&t_input);

        self.id_numbered = Some(id_numbered);
        self.remote_id_numbered = Some(remote_id_numbered);
        self.remote_pubkey = Some(y);
        self.keying_material = Some(t);
        Ok(())
    }

    /// `K = HKDF(t, salt = min(X,Y).bytes||max(X,Y).bytes, info, 24)`.
    pub fn encryption_key(&mut self) -> Result<&[u8]> {
        if self.encryption_key.is_none() {
            let remote_pubkey = self
                .remote_pubkey
                .clone()
                .ok_or_else(|| Error::ProtocolViolation("remote public key not set".to_string()))?;
            let t = self
                .keying_material
                .clone()
                .ok_or_else(|| Error::ProtocolViolation("keying material not derived yet".to_string()))?;
            let (first_pk, second_pk) = min_max_bigint(&self.pubkey, &remote_pubkey);
            let mut salt = first_pk.to_bytes_be();
            salt.extend_from_slice(&second_pk.to_bytes_be());
            let key = hkdf(&t, &salt, HKDF_INFO, DERIVED_KEY_LEN)?;
            self.encryption_key = Some(key);
        }
        Ok(self.encryption_key.as_deref().unwrap())
    }

    /// `kcd_local = HMAC_K("KC_1_U" || id_num || rem_id_num || X.bytes || Y.bytes)`.
    pub fn key_confirmation_data(&mut self) -> Result<&[u8]> {
        if self.key_confirmation_data.is_none() {
            let id_numbered = self
                .id_numbered
                .clone()
                .ok_or_else(|| Error::ProtocolViolation("remote info not set".to_string()))?;
            let remote_id_numbered = self
                .remote_id_numbered
                .clone()
                .ok_or_else(|| Error::ProtocolViolation("remote info not set".to_string()))?;
            let remote_pubkey = self.remote_pubkey.clone().unwrap();
            let pubkey = self.pubkey.clone();
            let kcd = self.gen_kcd(&id_numbered, &remote_id_numbered, &pubkey, &remote_pubkey)?;
            self.key_confirmation_data = Some(kcd);
        }
        Ok(self.key_confirmation_data.as_deref().unwrap())
    }

    /// Compare `remote_kcd` against `kcd_remote_expected` in constant time.
    pub fn confirm_key(&mut self, remote_kcd: &[u8]) -> Result<bool> {
        let id_numbered = self
            .id_numbered
            .clone()
            .ok_or_else(|| Error::ProtocolViolation("remote info not set".to_string()))?;
        let remote_id_numbered = self
            .remote_id_numbered
            .clone()
            .ok_or_else(|| Error::ProtocolViolation("remote info not set".to_string()))?;
        let remote_pubkey = self.remote_pubkey.clone().unwrap();
        let pubkey = self.pubkey.clone();
        let expected = self.gen_kcd(&remote_id_numbered, &id_numbered, &remote_pubkey, &pubkey)?;
        Ok(bool::from(expected.ct_eq(remote_kcd)))
    }

    pub fn hmac_sign(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let key = self.encryption_key()?.to_vec();
        Ok(hmac(&key, message))
    }

    pub fn confirm_hmac_signature(&mut self, signature: &[u8], message: &[u8]) -> Result<bool> {
        let expected = self.hmac_sign(message)?;
        Ok(bool::from(expected.ct_eq(signature)))
    }

    fn gen_kcd(
        &mut self,
        first_id: &str,
        second_id: &str,
        first_pubkey: &BigInt,
        second_pubkey: &BigInt,
    ) -> Result<Vec<u8>> {
        let key = self.encryption_key()?.to_vec();
        let mut m = Vec::new();
        m.extend_from_slice(KCD_PREFIX);
        m.extend_from_slice(first_id.as_bytes());
        m.extend_from_slice(second_id.as_bytes());
        m.extend_from_slice(&first_pubkey.to_bytes_be());
        m.extend_from_slice(&second_pubkey.to_bytes_be());
        Ok(hmac(&key, &m))
    }
}

impl Drop for Speke {
    fn drop(&mut self) {
        self.privkey.zeroize();
        if let Some(t) = self.keying_material.as_mut() {
            t.zeroize();
        }
        if let Some(k) = self.encryption_key.as_mut() {
            k.zeroize();
        }
    }
}

fn min_max_str<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn min_max_bigint(a: &BigInt, b: &BigInt) -> (BigInt, BigInt) {
    if a.cmp_big(b) != std::cmp::Ordering::Greater {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Toy safe prime used by the original implementation's own unit tests:
    // 2692367 = 2*1346183 + 1, both prime.
    fn toy_prime() -> BigInt {
        BigInt::from_u64(2_692_367)
    }

    #[test]
    fn matching_passwords_derive_the_same_key() {
        let counter = IdCounter::new();
        let p = toy_prime();
        let mut alice = Speke::new("alice", "hunter2", p.clone()).unwrap();
        let mut bob = Speke::new("bob", "hunter2", p).unwrap();

        let alice_pub = alice.public_key().unwrap();
        let bob_pub = bob.public_key().unwrap();

        alice
            .provide_remote_public_key_id_pair(&bob_pub, "bob", &counter)
            .unwrap();
        bob.provide_remote_public_key_id_pair(&alice_pub, "alice", &counter)
            .unwrap();

        assert_eq!(
            alice.encryption_key().unwrap(),
            bob.encryption_key().unwrap()
        );

        let alice_kcd = alice.key_confirmation_data().unwrap().to_vec();
        let bob_kcd = bob.key_confirmation_data().unwrap().to_vec();
        assert!(bob.confirm_key(&alice_kcd).unwrap());
        assert!(alice.confirm_key(&bob_kcd).unwrap());
    }

    #[test]
    fn mismatched_passwords_fail_key_confirmation() {
        let counter = IdCounter::new();
        let p = toy_prime();
        let mut alice = Speke::new("alice", "hunter2", p.clone()).unwrap();
        let mut eve = Speke::new("eve", "wrong-password", p).unwrap();

        let alice_pub = alice.public_key().unwrap();
        let eve_pub = eve.public_key().unwrap();

        alice
            .provide_remote_public_key_id_pair(&eve_pub, "eve", &counter)
            .unwrap();
        eve.provide_remote_public_key_id_pair(&alice_pub, "alice", &counter)
            .unwrap();

        let eve_kcd = eve.key_confirmation_data().unwrap().to_vec();
        assert!(!alice.confirm_key(&eve_kcd).unwrap());
    }

    #[test]
    fn impersonation_with_own_id_is_rejected() {
        let counter = IdCounter::new();
        let p = toy_prime();
        let mut alice = Speke::new("alice", "hunter2", p).unwrap();
        let fake_pub = vec![2u8];
        assert!(matches!(
            alice.provide_remote_public_key_id_pair(&fake_pub, "alice", &counter),
            Err(Error::PeerIdentifierInvalid)
        ));
    }

    #[test]
    fn out_of_range_public_key_is_rejected() {
        let counter = IdCounter::new();
        let p = toy_prime();
        let mut alice = Speke::new("alice", "hunter2", p).unwrap();
        assert!(matches!(
            alice.provide_remote_public_key_id_pair(&[1u8], "bob", &counter),
            Err(Error::PeerPublicKeyInvalid)
        ));
    }

    #[test]
    fn even_prime_is_rejected() {
        let p = BigInt::from_u64(100);
        assert!(matches!(
            Speke::new("alice", "hunter2", p),
            Err(Error::InvalidPrime)
        ));
    }

    #[test]
    fn default_safe_prime_is_odd_and_constructs_a_session() {
        let p = default_safe_prime();
        assert!(p.is_odd());
        assert!(Speke::new("alice", "hunter2", p).is_ok());
    }
}
