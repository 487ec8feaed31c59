//! X.509 v3 certificates: construction, self-signing, issuer-signing,
//! verification, and PEM (de)serialization.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use der::pem::LineEnding;
use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;
use x509_cert::Certificate as DerCertificate;

use crate::error::{Error, Result};
use crate::keypair::{KeyPair, KeyType};

/// A subject or issuer name, `CommonName` (the only attribute the original
/// ever populates) plus whatever other RDNs the caller supplies.
pub type NameMap = Vec<(String, String)>;

pub struct Certificate {
    inner: Option<DerCertificate>,
}

impl Certificate {
    /// Build an unsigned v3 certificate for `kp`'s public key, valid for
    /// `days` days starting now. Call [`UnsignedCertificate::sign_self`] or
    /// [`UnsignedCertificate::sign`] to finish it.
    pub fn new(kp: &KeyPair, name_entries: &NameMap, days: u32) -> Result<UnsignedCertificate> {
        Self::new_with_serial(kp, name_entries, days, 1)
    }

    /// As [`Certificate::new`], but for a caller (the CA) that tracks its
    /// own monotonic serial counter instead of always using `1`.
    pub fn new_with_serial(
        kp: &KeyPair,
        name_entries: &NameMap,
        days: u32,
        serial: u64,
    ) -> Result<UnsignedCertificate> {
        let subject = build_name(name_entries)?;
        let spki = subject_public_key_info(kp)?;
        let serial = SerialNumber::new(&serial.to_be_bytes()).map_err(|e| Error::Pkcs8(e.to_string()))?;
        let validity = validity_for_days(days)?;
        Ok(UnsignedCertificate {
            subject,
            spki,
            serial,
            validity,
        })
    }

    /// Build an unsigned certificate directly from a subject name and SPKI
    /// (e.g. a CSR's), rather than from a local key pair.
    pub fn new_from_spki(
        subject: Name,
        spki: SubjectPublicKeyInfoOwned,
        days: u32,
        serial: u64,
    ) -> Result<UnsignedCertificate> {
        let serial = SerialNumber::new(&serial.to_be_bytes()).map_err(|e| Error::Pkcs8(e.to_string()))?;
        let validity = validity_for_days(days)?;
        Ok(UnsignedCertificate {
            subject,
            spki,
            serial,
            validity,
        })
    }

    pub fn to_string_pem(&self) -> Result<String> {
        let cert = self.inner.as_ref().ok_or(Error::NotSigned)?;
        cert.to_pem(LineEnding::LF)
            .map_err(|e| Error::Pkcs8(e.to_string()))
    }

    pub fn serialize(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_string_pem()?)?;
        Ok(())
    }

    pub fn deserialize(path: impl AsRef<Path>) -> Result<Self> {
        let pem = fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let cert = DerCertificate::from_pem(pem.as_bytes())
            .map_err(|e| Error::MalformedRequest(e.to_string()))?;
        Ok(Certificate { inner: Some(cert) })
    }

    pub fn get_subject_name(&self) -> Result<NameMap> {
        let cert = self.inner.as_ref().ok_or(Error::NotSigned)?;
        Ok(name_to_map(&cert.tbs_certificate.subject))
    }

    pub fn get_issuer_name(&self) -> Result<NameMap> {
        let cert = self.inner.as_ref().ok_or(Error::NotSigned)?;
        Ok(name_to_map(&cert.tbs_certificate.issuer))
    }

    /// SHA-256 digest of the DER encoding, used by the cert exchange to let
    /// a client confirm it is talking to the expected CA.
    pub fn get_hash(&self) -> Result<[u8; 32]> {
        let cert = self.inner.as_ref().ok_or(Error::NotSigned)?;
        let der = cert
            .to_der()
            .map_err(|e| Error::Pkcs8(e.to_string()))?;
        Ok(Sha256::digest(der).into())
    }

    pub fn verify(&self, issuer_kp: &KeyPair) -> Result<bool> {
        let cert = self.inner.as_ref().ok_or(Error::NotSigned)?;
        let tbs_der = cert
            .tbs_certificate
            .to_der()
            .map_err(|e| Error::Pkcs8(e.to_string()))?;
        let sig_bytes = cert
            .signature
            .as_bytes()
            .ok_or_else(|| Error::MalformedRequest("certificate signature is not byte-aligned".to_string()))?;
        verify_signature(issuer_kp, &tbs_der, sig_bytes)
    }
}

/// A certificate that has been built but not yet signed.
pub struct UnsignedCertificate {
    subject: Name,
    spki: SubjectPublicKeyInfoOwned,
    serial: SerialNumber,
    validity: Validity,
}

impl UnsignedCertificate {
    /// Self-sign: subject == issuer, signed by the same key pair the
    /// certificate was built for.
    pub fn sign_self(self, kp: &KeyPair) -> Result<Certificate> {
        self.sign_with_profile(kp, Profile::Root)
    }

    /// Sign with `issuer_kp`, stamping `issuer_name` as the issuer.
    pub fn sign(self, issuer_kp: &KeyPair, issuer_name: Name) -> Result<Certificate> {
        let profile = Profile::Leaf {
            issuer: issuer_name,
            enable_key_agreement: false,
            enable_key_encipherment: false,
        };
        self.sign_with_profile(issuer_kp, profile)
    }

    fn sign_with_profile(self, kp: &KeyPair, profile: Profile) -> Result<Certificate> {
        let der = match kp {
            KeyPair::Ed25519(signing_key) => {
                let builder = CertificateBuilder::new(
                    profile,
                    self.serial,
                    self.validity,
                    self.subject,
                    self.spki,
                    signing_key.as_ref(),
                )
                .map_err(|e| Error::Pkcs8(e.to_string()))?;
                builder
                    .build::<ed25519_dalek::Signature>()
                    .map_err(|e| Error::Signing(e.to_string()))?
            }
            KeyPair::Rsa(rsa_key) => {
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new((**rsa_key).clone());
                let builder = CertificateBuilder::new(
                    profile,
                    self.serial,
                    self.validity,
                    self.subject,
                    self.spki,
                    &signing_key,
                )
                .map_err(|e| Error::Pkcs8(e.to_string()))?;
                builder
                    .build::<rsa::pkcs1v15::Signature>()
                    .map_err(|e| Error::Signing(e.to_string()))?
            }
        };
        Ok(Certificate { inner: Some(der) })
    }
}

pub(crate) fn build_name(entries: &NameMap) -> Result<Name> {
    if entries.is_empty() {
        return Err(Error::MalformedRequest("name must have at least one RDN".to_string()));
    }
    let rfc4514 = entries
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    Name::from_str(&rfc4514).map_err(|e| Error::MalformedRequest(e.to_string()))
}

pub(crate) fn name_to_map(name: &Name) -> NameMap {
    name.to_string()
        .split(',')
        .filter_map(|rdn| rdn.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub(crate) fn subject_public_key_info(kp: &KeyPair) -> Result<SubjectPublicKeyInfoOwned> {
    let der = kp.to_der_pub_key()?;
    SubjectPublicKeyInfoOwned::from_der(&der).map_err(|e| Error::Der(e))
}

pub(crate) fn validity_for_days(days: u32) -> Result<Validity> {
    let now = SystemTime::now();
    let not_after = now + Duration::from_secs(days as u64 * 86_400);
    Validity::from_now(not_after.duration_since(now).unwrap())
        .map_err(|e| Error::Pkcs8(e.to_string()))
}

fn verify_signature(kp: &KeyPair, message: &[u8], sig_bytes: &[u8]) -> Result<bool> {
    use ed25519_dalek::Verifier;
    match kp.key_type() {
        KeyType::Ed25519 => {
            let vk = kp.ed25519_verifying_key()?;
            let sig = ed25519_dalek::Signature::from_slice(sig_bytes)
                .map_err(|e| Error::MalformedRequest(e.to_string()))?;
            Ok(vk.verify(message, &sig).is_ok())
        }
        KeyType::Rsa => {
            use rsa::pkcs1v15::{Signature, VerifyingKey};
            use rsa::signature::Verifier as _;
            let pk = kp.rsa_public_key()?;
            let vk = VerifyingKey::<Sha256>::new(pk);
            let sig = Signature::try_from(sig_bytes)
                .map_err(|e| Error::MalformedRequest(e.to_string()))?;
            Ok(vk.verify(message, &sig).is_ok())
        }
    }
}
