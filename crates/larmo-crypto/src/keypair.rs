//! Ed25519 / RSA key pairs, the two signature algorithms certificates in
//! this workspace can carry.

use std::fs;
use std::path::Path;

use der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey as Ed25519DecodePriv, EncodePrivateKey as Ed25519EncodePriv};
use ed25519_dalek::pkcs8::{DecodePublicKey as Ed25519DecodePub, EncodePublicKey as Ed25519EncodePub};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey as RsaDecodePriv, EncodePrivateKey as RsaEncodePriv};
use rsa::pkcs8::{DecodePublicKey as RsaDecodePub, EncodePublicKey as RsaEncodePub};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{Error, Result};

pub const RSA_KEY_BITS: usize = 2048;

/// Which algorithm a `KeyPair` was declared to hold. Mirrors the original's
/// `KeyPair::keypair_t` descriptor (a generate fn + digest + OpenSSL type
/// tag) with a small Rust enum dispatch table instead of a vtable-by-struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Ed25519,
    Rsa,
}

/// The digest a certificate signed by this key pair's algorithm uses.
/// Ed25519 signs the message directly (no prehash), hence `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestType {
    None,
    Sha256,
}

pub enum KeyPair {
    Ed25519(Box<SigningKey>),
    Rsa(Box<RsaPrivateKey>),
}

impl KeyPair {
    pub fn generate(key_type: KeyType) -> Result<Self> {
        match key_type {
            KeyType::Ed25519 => Ok(KeyPair::Ed25519(Box::new(SigningKey::generate(&mut OsRng)))),
            KeyType::Rsa => {
                let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
                    .map_err(|e| Error::Signing(format!("RSA key generation failed: {e}")))?;
                Ok(KeyPair::Rsa(Box::new(key)))
            }
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            KeyPair::Ed25519(_) => KeyType::Ed25519,
            KeyPair::Rsa(_) => KeyType::Rsa,
        }
    }

    pub fn digest_type(&self) -> DigestType {
        match self {
            KeyPair::Ed25519(_) => DigestType::None,
            KeyPair::Rsa(_) => DigestType::Sha256,
        }
    }

    /// PKCS#8 PEM, optionally PBES2-encrypted under `password` (matching
    /// the original's optional passphrase on private key export).
    pub fn to_pem_priv_key(&self, password: Option<&str>) -> Result<String> {
        match password {
            None => match self {
                KeyPair::Ed25519(k) => Ok(k
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| Error::Pkcs8(e.to_string()))?
                    .to_string()),
                KeyPair::Rsa(k) => Ok(k
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| Error::Pkcs8(e.to_string()))?
                    .to_string()),
            },
            Some(password) => match self {
                KeyPair::Ed25519(k) => Ok(k
                    .to_pkcs8_encrypted_pem(&mut OsRng, password, LineEnding::LF)
                    .map_err(|e| Error::Pkcs8(e.to_string()))?
                    .to_string()),
                KeyPair::Rsa(k) => Ok(k
                    .to_pkcs8_encrypted_pem(&mut OsRng, password, LineEnding::LF)
                    .map_err(|e| Error::Pkcs8(e.to_string()))?
                    .to_string()),
            },
        }
    }

    pub fn to_pem_pub_key(&self) -> Result<String> {
        match self {
            KeyPair::Ed25519(k) => k
                .verifying_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::Pkcs8(e.to_string())),
            KeyPair::Rsa(k) => RsaPublicKey::from(k.as_ref())
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::Pkcs8(e.to_string())),
        }
    }

    pub fn to_der_priv_key(&self) -> Result<Vec<u8>> {
        match self {
            KeyPair::Ed25519(k) => Ok(k
                .to_pkcs8_der()
                .map_err(|e| Error::Pkcs8(e.to_string()))?
                .as_bytes()
                .to_vec()),
            KeyPair::Rsa(k) => Ok(k
                .to_pkcs8_der()
                .map_err(|e| Error::Pkcs8(e.to_string()))?
                .as_bytes()
                .to_vec()),
        }
    }

    pub fn to_der_pub_key(&self) -> Result<Vec<u8>> {
        match self {
            KeyPair::Ed25519(k) => Ok(k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| Error::Pkcs8(e.to_string()))?
                .as_bytes()
                .to_vec()),
            KeyPair::Rsa(k) => Ok(RsaPublicKey::from(k.as_ref())
                .to_public_key_der()
                .map_err(|e| Error::Pkcs8(e.to_string()))?
                .as_bytes()
                .to_vec()),
        }
    }

    pub fn to_pem_file_priv_key(&self, path: impl AsRef<Path>, password: Option<&str>) -> Result<()> {
        fs::write(path, self.to_pem_priv_key(password)?)?;
        Ok(())
    }

    /// Load a private key PEM that was encrypted with [`Self::to_pem_priv_key`]'s
    /// `password` argument.
    pub fn from_pem_encrypted(key_type: KeyType, pem: &str, password: &str) -> Result<Self> {
        match key_type {
            KeyType::Ed25519 => {
                let key = SigningKey::from_pkcs8_encrypted_pem(pem, password).map_err(|_| Error::WrongKeyType)?;
                Ok(KeyPair::Ed25519(Box::new(key)))
            }
            KeyType::Rsa => {
                let key = RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password).map_err(|_| Error::WrongKeyType)?;
                Ok(KeyPair::Rsa(Box::new(key)))
            }
        }
    }

    pub fn to_pem_file_pub_key(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_pem_pub_key()?)?;
        Ok(())
    }

    pub fn from_pem(key_type: KeyType, pem: &str) -> Result<Self> {
        match key_type {
            KeyType::Ed25519 => {
                let key = SigningKey::from_pkcs8_pem(pem).map_err(|_| Error::WrongKeyType)?;
                Ok(KeyPair::Ed25519(Box::new(key)))
            }
            KeyType::Rsa => {
                let key = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| Error::WrongKeyType)?;
                Ok(KeyPair::Rsa(Box::new(key)))
            }
        }
    }

    pub fn from_pem_file(key_type: KeyType, path: impl AsRef<Path>) -> Result<Self> {
        let pem = fs::read_to_string(path)?;
        Self::from_pem(key_type, &pem)
    }

    pub fn from_der(key_type: KeyType, der: &[u8]) -> Result<Self> {
        match key_type {
            KeyType::Ed25519 => {
                let key = SigningKey::from_pkcs8_der(der).map_err(|_| Error::WrongKeyType)?;
                Ok(KeyPair::Ed25519(Box::new(key)))
            }
            KeyType::Rsa => {
                let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|_| Error::WrongKeyType)?;
                Ok(KeyPair::Rsa(Box::new(key)))
            }
        }
    }

    pub fn ed25519_verifying_key(&self) -> Result<VerifyingKey> {
        match self {
            KeyPair::Ed25519(k) => Ok(k.verifying_key()),
            KeyPair::Rsa(_) => Err(Error::WrongKeyType),
        }
    }

    pub fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        match self {
            KeyPair::Rsa(k) => Ok(RsaPublicKey::from(k.as_ref())),
            KeyPair::Ed25519(_) => Err(Error::WrongKeyType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ed25519_pem_round_trips() {
        let kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let pem = kp.to_pem_priv_key(None).unwrap();
        let loaded = KeyPair::from_pem(KeyType::Ed25519, &pem).unwrap();
        assert_eq!(loaded.digest_type(), DigestType::None);
    }

    #[test]
    fn rsa_pem_round_trips() {
        let kp = KeyPair::generate(KeyType::Rsa).unwrap();
        let pem = kp.to_pem_priv_key(None).unwrap();
        let loaded = KeyPair::from_pem(KeyType::Rsa, &pem).unwrap();
        assert_eq!(loaded.digest_type(), DigestType::Sha256);
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let pem = kp.to_pem_priv_key(None).unwrap();
        assert!(matches!(
            KeyPair::from_pem(KeyType::Rsa, &pem),
            Err(Error::WrongKeyType)
        ));
    }

    #[test]
    fn pem_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.pem");
        let kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        kp.to_pem_file_priv_key(&path, None).unwrap();
        let loaded = KeyPair::from_pem_file(KeyType::Ed25519, &path).unwrap();
        assert_eq!(loaded.key_type(), KeyType::Ed25519);
    }

    #[test]
    fn encrypted_pem_round_trips_with_password() {
        let kp = KeyPair::generate(KeyType::Rsa).unwrap();
        let pem = kp.to_pem_priv_key(Some("correct horse battery staple")).unwrap();
        assert!(KeyPair::from_pem(KeyType::Rsa, &pem).is_err());
        let loaded = KeyPair::from_pem_encrypted(KeyType::Rsa, &pem, "correct horse battery staple").unwrap();
        assert_eq!(loaded.key_type(), KeyType::Rsa);
    }
}
