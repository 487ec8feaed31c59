//! PKCS#10 certificate signing requests.

use std::fs;
use std::path::Path;

use der::pem::LineEnding;
use der::{Decode, Encode};
use sha2::Sha256;
use x509_cert::name::Name;
use x509_cert::request::{CertReq, CertReqInfo};

use crate::cert::{build_name, name_to_map, subject_public_key_info, NameMap};
use crate::error::{Error, Result};
use crate::keypair::KeyPair;

/// A CSR, signed and sealed at construction time — the original never
/// supported mutating one after the fact, so neither does this type.
pub struct CertificateRequest {
    inner: CertReq,
}

impl CertificateRequest {
    /// Build, sign, and seal a CSR for `kp`'s public key.
    pub fn new(kp: &KeyPair, name_entries: &NameMap) -> Result<Self> {
        let subject = build_name(name_entries)?;
        let spki = subject_public_key_info(kp)?;
        let info = CertReqInfo {
            version: x509_cert::request::Version::V1,
            subject,
            public_key: spki,
            attributes: Default::default(),
        };
        let tbs_der = info.to_der().map_err(|e| Error::Pkcs8(e.to_string()))?;
        let (signature, alg_id) = sign_csr_body(kp, &tbs_der)?;
        let req = CertReq {
            info,
            algorithm: alg_id,
            signature: der::asn1::BitString::from_bytes(&signature)
                .map_err(|e| Error::Pkcs8(e.to_string()))?,
        };
        Ok(CertificateRequest { inner: req })
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.inner.to_der().map_err(|e| Error::Pkcs8(e.to_string()))
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let inner =
            CertReq::from_der(der).map_err(|e| Error::MalformedRequest(e.to_string()))?;
        Ok(CertificateRequest { inner })
    }

    pub fn to_pem_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let pem = self
            .inner
            .to_pem(LineEnding::LF)
            .map_err(|e| Error::Pkcs8(e.to_string()))?;
        fs::write(path, pem)?;
        Ok(())
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let pem = fs::read_to_string(path)?;
        let inner = CertReq::from_pem(pem.as_bytes())
            .map_err(|e| Error::MalformedRequest(e.to_string()))?;
        Ok(CertificateRequest { inner })
    }

    pub fn subject(&self) -> &Name {
        &self.inner.info.subject
    }

    pub fn get_name(&self) -> NameMap {
        name_to_map(&self.inner.info.subject)
    }

    pub fn public_key(&self) -> &x509_cert::spki::SubjectPublicKeyInfoOwned {
        &self.inner.info.public_key
    }

    /// Verify the CSR is self-signed by the key it carries, i.e. that it
    /// hasn't been tampered with since the requester produced it. A CA must
    /// call this before issuing from a CSR it did not build itself.
    pub fn verify_self_signed(&self) -> Result<bool> {
        let tbs_der = self
            .inner
            .info
            .to_der()
            .map_err(|e| Error::Pkcs8(e.to_string()))?;
        let sig_bytes = self
            .inner
            .signature
            .as_bytes()
            .ok_or_else(|| Error::MalformedRequest("CSR signature is not byte-aligned".to_string()))?;
        let spki_der = self
            .inner
            .info
            .public_key
            .to_der()
            .map_err(|e| Error::Pkcs8(e.to_string()))?;
        verify_with_spki_der(&spki_der, &tbs_der, sig_bytes)
    }
}

fn sign_csr_body(
    kp: &KeyPair,
    tbs_der: &[u8],
) -> Result<(Vec<u8>, x509_cert::spki::AlgorithmIdentifierOwned)> {
    use ed25519_dalek::Signer as _;
    use rsa::signature::Signer as _;
    match kp {
        KeyPair::Ed25519(signing_key) => {
            let sig = signing_key.sign(tbs_der);
            let alg_id = x509_cert::spki::AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc8410::ID_ED_25519,
                parameters: None,
            };
            Ok((sig.to_bytes().to_vec(), alg_id))
        }
        KeyPair::Rsa(rsa_key) => {
            let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new((**rsa_key).clone());
            let sig = signing_key.sign(tbs_der);
            let alg_id = x509_cert::spki::AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
                parameters: Some(der::Any::from(der::asn1::Null)),
            };
            Ok((sig.to_vec(), alg_id))
        }
    }
}

fn verify_with_spki_der(spki_der: &[u8], message: &[u8], sig_bytes: &[u8]) -> Result<bool> {
    use ed25519_dalek::Verifier;
    let spki = x509_cert::spki::SubjectPublicKeyInfoOwned::from_der(spki_der)
        .map_err(Error::Der)?;
    if spki.algorithm.oid == const_oid::db::rfc8410::ID_ED_25519 {
        let raw = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| Error::MalformedRequest("Ed25519 SPKI is not byte-aligned".to_string()))?;
        let vk = ed25519_dalek::VerifyingKey::from_bytes(
            raw.try_into()
                .map_err(|_| Error::MalformedRequest("Ed25519 public key must be 32 bytes".to_string()))?,
        )
        .map_err(|e| Error::MalformedRequest(e.to_string()))?;
        let sig = ed25519_dalek::Signature::from_slice(sig_bytes)
            .map_err(|e| Error::MalformedRequest(e.to_string()))?;
        Ok(vk.verify(message, &sig).is_ok())
    } else {
        use rsa::pkcs1v15::{Signature, VerifyingKey};
        use rsa::signature::Verifier as _;
        use rsa::RsaPublicKey;
        let pk = RsaPublicKey::try_from(spki).map_err(|e| Error::Pkcs8(e.to_string()))?;
        let vk = VerifyingKey::<Sha256>::new(pk);
        let sig = Signature::try_from(sig_bytes)
            .map_err(|e| Error::MalformedRequest(e.to_string()))?;
        Ok(vk.verify(message, &sig).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::KeyType;

    #[test]
    fn csr_der_round_trips() {
        let kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let csr = CertificateRequest::new(&kp, &[("CN".to_string(), "client".to_string())]).unwrap();
        let der = csr.to_der().unwrap();
        let loaded = CertificateRequest::from_der(&der).unwrap();
        assert_eq!(loaded.get_name(), csr.get_name());
    }

    #[test]
    fn csr_is_self_signed() {
        let kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let csr = CertificateRequest::new(&kp, &[("CN".to_string(), "client".to_string())]).unwrap();
        assert!(csr.verify_self_signed().unwrap());
    }
}
