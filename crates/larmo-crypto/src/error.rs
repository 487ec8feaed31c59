//! Error taxonomy for the SPEKE session layer and cert exchange.

/// Kinds of failure a SPEKE session, its transport, or the cert exchange
/// server can raise. Distinct from the ad hoc `anyhow!`/`logic_error`
/// exceptions the original threw; each variant here is something a caller
/// can match on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SPEKE constructed with a non-odd (non-safe-prime-shaped) modulus")]
    InvalidPrime,

    #[error("modulus must be odd for ModExp")]
    InvalidModulus,

    #[error("remote public key is out of range [2, p-2]")]
    PeerPublicKeyInvalid,

    #[error("remote identifier is the same as the local identifier")]
    PeerIdentifierInvalid,

    #[error("cannot send application data before key confirmation succeeds")]
    NotAuthenticated,

    #[error("key confirmation data did not match")]
    KeyConfirmationFailed,

    #[error("HMAC signature did not match the signed data")]
    MessageTamper,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("operation attempted on a session that is already closed")]
    SessionClosed,

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("key pair algorithm does not match the requested type")]
    WrongKeyType,

    #[error("certificate has not been signed")]
    NotSigned,

    #[error("certificate signing request is malformed: {0}")]
    MalformedRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DER encoding error: {0}")]
    Der(#[from] der::Error),

    #[error("PKCS#8 error: {0}")]
    Pkcs8(String),

    #[error("signing error: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, Error>;
