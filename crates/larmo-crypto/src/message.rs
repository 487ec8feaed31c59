//! Wire types carried inside length-prefixed SpekeSession frames.
//!
//! `SpekeMessage` is the transport-level envelope (handshake + signed
//! application data); `CertClientMessage`/`CertServerMessage` are the
//! application-level request/response pair the cert exchange server speaks
//! once a session is authenticated. Both are encoded with `bincode`, the
//! same compact binary framing `bincode`'s own docs recommend for
//! tagged-union wire formats.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpekeMessage {
    InitData { id: String, public_key: Vec<u8> },
    KeyConfirmation { data: Vec<u8> },
    SignedData { data: Vec<u8>, hmac_signature: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CertClientMessage {
    CertRequest { request: Vec<u8> },
    ConfirmRequest { cert_hash: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CertServerMessage {
    CertBundle { root_cert: Vec<u8>, client_cert: Vec<u8> },
    ConfirmResponse { response: bool },
    ErrorCode { code: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speke_message_round_trips() {
        let msg = SpekeMessage::InitData {
            id: "alice".to_string(),
            public_key: vec![1, 2, 3],
        };
        let encoded = bincode::serialize(&msg).unwrap();
        let decoded: SpekeMessage = bincode::deserialize(&encoded).unwrap();
        match decoded {
            SpekeMessage::InitData { id, public_key } => {
                assert_eq!(id, "alice");
                assert_eq!(public_key, vec![1, 2, 3]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cert_client_message_round_trips() {
        let msg = CertClientMessage::ConfirmRequest {
            cert_hash: vec![9; 32],
        };
        let encoded = bincode::serialize(&msg).unwrap();
        let decoded: CertClientMessage = bincode::deserialize(&encoded).unwrap();
        assert!(matches!(decoded, CertClientMessage::ConfirmRequest { cert_hash } if cert_hash == vec![9; 32]));
    }
}
