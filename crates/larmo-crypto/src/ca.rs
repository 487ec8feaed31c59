//! Self-signed root certificate authority that certifies externally
//! supplied CSRs.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cert::{Certificate, NameMap};
use crate::csr::CertificateRequest;
use crate::error::{Error, Result};
use crate::keypair::KeyPair;

pub const DEFAULT_ROOT_VALIDITY_DAYS: u32 = 3650;
pub const DEFAULT_CLIENT_VALIDITY_DAYS: u32 = 365;

pub struct CertificateAuthority {
    cert: Certificate,
    key_pair: KeyPair,
    next_serial: AtomicU64,
}

impl CertificateAuthority {
    /// Build a fresh root CA: a self-signed certificate over `key_pair`,
    /// valid for `root_validity_days`.
    pub fn new(key_pair: KeyPair, name_entries: &NameMap, root_validity_days: u32) -> Result<Self> {
        let unsigned = Certificate::new(&key_pair, name_entries, root_validity_days)?;
        let cert = unsigned.sign_self(&key_pair)?;
        Ok(CertificateAuthority {
            cert,
            key_pair,
            next_serial: AtomicU64::new(1),
        })
    }

    /// Load a CA from an already-signed root certificate and its key pair,
    /// resuming the serial counter from `next_serial`.
    pub fn from_parts(cert: Certificate, key_pair: KeyPair, next_serial: u64) -> Self {
        CertificateAuthority {
            cert,
            key_pair,
            next_serial: AtomicU64::new(next_serial),
        }
    }

    pub fn root_certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn next_serial(&self) -> u64 {
        self.next_serial.load(Ordering::SeqCst)
    }

    /// Issue a certificate from `csr`, valid for `days` days.
    ///
    /// 1. Copy the CSR's subject and public key.
    /// 2. Set issuer to the CA's subject.
    /// 3. Stamp the next serial.
    /// 4. Validity `[now, now + days*86400s)`.
    /// 5. Sign with the CA's key and its digest policy.
    ///
    /// Extensions present in the CSR are ignored. Fails with
    /// `MalformedRequest` if the CSR is not self-signed, or lacks a subject
    /// or public key.
    pub fn certify(&self, csr: &CertificateRequest, days: u32) -> Result<Certificate> {
        if !csr.verify_self_signed()? {
            return Err(Error::MalformedRequest(
                "CSR signature does not match its own public key".to_string(),
            ));
        }
        let subject = csr.subject().clone();
        if csr.get_name().is_empty() {
            return Err(Error::MalformedRequest("CSR has no subject".to_string()));
        }
        let spki = csr.public_key().clone();
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let unsigned = Certificate::new_from_spki(subject, spki, days, serial)?;
        let issuer_name = crate::cert::build_name(&self.cert.get_subject_name()?)?;
        unsigned.sign(&self.key_pair, issuer_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::KeyType;

    fn ca() -> CertificateAuthority {
        let kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        CertificateAuthority::new(
            kp,
            &[("CN".to_string(), "larmo root CA".to_string())],
            DEFAULT_ROOT_VALIDITY_DAYS,
        )
        .unwrap()
    }

    #[test]
    fn certifies_a_valid_csr() {
        let authority = ca();
        let client_kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let csr =
            CertificateRequest::new(&client_kp, &[("CN".to_string(), "client".to_string())]).unwrap();
        let cert = authority.certify(&csr, DEFAULT_CLIENT_VALIDITY_DAYS).unwrap();
        assert!(cert.verify(&authority.key_pair).unwrap());
        assert_eq!(authority.next_serial(), 2);
    }

    #[test]
    fn rejects_csr_without_subject() {
        let authority = ca();
        let client_kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let csr = CertificateRequest::new(&client_kp, &[]);
        assert!(csr.is_err());
        let _ = authority;
    }
}
