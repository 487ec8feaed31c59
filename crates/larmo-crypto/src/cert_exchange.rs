//! Password-authenticated certificate distribution server.
//!
//! Clients authenticate with a SPEKE handshake over the shared password,
//! then request a client certificate signed by the CA, or confirm they
//! are talking to the expected CA by checking its root certificate hash.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::ca::CertificateAuthority;
use crate::csr::CertificateRequest;
use crate::error::Result;
use crate::message::{CertClientMessage, CertServerMessage};
use crate::speke::{IdCounter, Speke};
use crate::speke_session::{SessionHandler, SessionState, SpekeSession};

/// Handle to a running session, independent of its underlying stream type,
/// so the server can keep a single homogeneous list to sweep.
trait SessionHandle: Send + Sync {
    fn state(&self) -> SessionState;
}

impl<S> SessionHandle for SpekeSession<S> {
    fn state(&self) -> SessionState {
        SpekeSession::state(self)
    }
}

/// Routes authenticated `CertClientMessage` requests to `CertServerMessage`
/// replies, backed by a single `CertificateAuthority`.
struct CertRoutingHandler {
    ca: Arc<CertificateAuthority>,
    client_validity_days: u32,
    root_cert_hash: [u8; 32],
}

#[async_trait::async_trait]
impl SessionHandler for CertRoutingHandler {
    async fn handle(&self, data: Vec<u8>) -> Option<Vec<u8>> {
        let reply = match bincode::deserialize::<CertClientMessage>(&data) {
            Ok(CertClientMessage::CertRequest { request }) => self.handle_cert_request(&request),
            Ok(CertClientMessage::ConfirmRequest { cert_hash }) => self.handle_confirm_request(&cert_hash),
            Err(_) => CertServerMessage::ErrorCode { code: 2 },
        };
        bincode::serialize(&reply).ok()
    }
}

impl CertRoutingHandler {
    fn handle_cert_request(&self, request: &[u8]) -> CertServerMessage {
        let issue = || -> Result<(Vec<u8>, Vec<u8>)> {
            let csr = CertificateRequest::from_der(request)?;
            let client_cert = self.ca.certify(&csr, self.client_validity_days)?;
            Ok((
                self.ca.root_certificate().to_string_pem()?.into_bytes(),
                client_cert.to_string_pem()?.into_bytes(),
            ))
        };
        match issue() {
            Ok((root_cert, client_cert)) => CertServerMessage::CertBundle { root_cert, client_cert },
            Err(e) => {
                warn!(error = %e, "cert request failed");
                CertServerMessage::ErrorCode { code: 1 }
            }
        }
    }

    fn handle_confirm_request(&self, cert_hash: &[u8]) -> CertServerMessage {
        let matches = self.root_cert_hash.ct_eq(cert_hash).into();
        CertServerMessage::ConfirmResponse { response: matches }
    }
}

/// Listens for client connections, authorizes them with a shared password
/// over SPEKE, and distributes certificates signed by `CA`.
pub struct CertExchangeServer {
    password: String,
    ca: Arc<CertificateAuthority>,
    client_validity_days: u32,
    max_frame_len: usize,
    counter: IdCounter,
    sessions: Arc<Mutex<Vec<Arc<dyn SessionHandle>>>>,
}

impl CertExchangeServer {
    pub fn new(password: impl Into<String>, ca: CertificateAuthority, client_validity_days: u32, max_frame_len: usize) -> Self {
        CertExchangeServer {
            password: password.into(),
            ca: Arc::new(ca),
            client_validity_days,
            max_frame_len,
            counter: IdCounter::new(),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of sessions currently tracked, including ones not yet swept.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// The CA's next unused serial number, for persisting across restarts.
    pub fn ca_next_serial(&self) -> u64 {
        self.ca.next_serial()
    }

    async fn sweep_sessions(&self) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|s| !s.state().is_terminal());
    }

    fn handler(&self) -> Arc<CertRoutingHandler> {
        Arc::new(CertRoutingHandler {
            ca: self.ca.clone(),
            client_validity_days: self.client_validity_days,
            root_cert_hash: self.ca.root_certificate().get_hash().expect("root certificate is always signed"),
        })
    }

    #[cfg(unix)]
    pub async fn start(self: Arc<Self>, socket_path: std::path::PathBuf) -> Result<()> {
        use tokio::net::UnixListener;

        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = UnixListener::bind(&socket_path)?;
        loop {
            let (stream, _addr) = listener.accept().await?;
            self.clone().spawn_session(stream).await;
        }
    }

    #[cfg(windows)]
    pub async fn start(self: Arc<Self>, pipe_name: String) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;

        loop {
            let server = ServerOptions::new().create(&pipe_name)?;
            server.connect().await?;
            self.clone().spawn_session(server).await;
        }
    }

    async fn spawn_session<S>(self: Arc<Self>, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let speke = match Speke::new("server", &self.password, crate::speke::default_safe_prime()) {
            Ok(speke) => speke,
            Err(e) => {
                error!(error = %e, "failed to construct server SPEKE state");
                return;
            }
        };
        let (session, read_half) =
            SpekeSession::with_max_frame_len(stream, speke, self.counter.clone(), self.max_frame_len);

        self.sessions.lock().await.push(Arc::new(session.clone()));
        self.sweep_sessions().await;

        let handler = self.handler();
        tokio::spawn(async move {
            if let Err(e) = session.run(read_half, handler).await {
                warn!(error = %e, "cert exchange session ended with an error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::DEFAULT_ROOT_VALIDITY_DAYS;
    use crate::keypair::{KeyPair, KeyType};
    use crate::message::CertClientMessage;
    use std::sync::Arc as StdArc;
    use tokio::io::duplex;

    fn test_ca() -> CertificateAuthority {
        let kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        CertificateAuthority::new(
            kp,
            &[("CN".to_string(), "larmo test CA".to_string())],
            DEFAULT_ROOT_VALIDITY_DAYS,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn confirm_request_matches_root_hash() {
        let ca = test_ca();
        let root_hash = ca.root_certificate().get_hash().unwrap();
        let server = StdArc::new(CertExchangeServer::new("hunter2", ca, 365, 1024 * 1024));
        let handler = server.handler();

        let ok = handler.handle_confirm_request(&root_hash);
        assert!(matches!(ok, CertServerMessage::ConfirmResponse { response: true }));

        let bad = handler.handle_confirm_request(&[0u8; 32]);
        assert!(matches!(bad, CertServerMessage::ConfirmResponse { response: false }));
    }

    #[tokio::test]
    async fn cert_request_issues_a_client_certificate() {
        let ca = test_ca();
        let server = StdArc::new(CertExchangeServer::new("hunter2", ca, 365, 1024 * 1024));
        let handler = server.handler();

        let client_kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let csr = CertificateRequest::new(&client_kp, &[("CN".to_string(), "client".to_string())]).unwrap();
        let request = bincode::serialize(&CertClientMessage::CertRequest {
            request: csr.to_der().unwrap(),
        })
        .unwrap();

        let reply_bytes = handler.handle(request).await.unwrap();
        let reply: CertServerMessage = bincode::deserialize(&reply_bytes).unwrap();
        assert!(matches!(reply, CertServerMessage::CertBundle { .. }));
    }

    #[tokio::test]
    async fn malformed_request_yields_error_code_two() {
        let ca = test_ca();
        let server = StdArc::new(CertExchangeServer::new("hunter2", ca, 365, 1024 * 1024));
        let handler = server.handler();

        let reply_bytes = handler.handle(vec![0xff; 4]).await.unwrap();
        let reply: CertServerMessage = bincode::deserialize(&reply_bytes).unwrap();
        assert!(matches!(reply, CertServerMessage::ErrorCode { code: 2 }));
    }

    #[tokio::test]
    async fn client_obtains_a_certificate_end_to_end() {
        let ca = test_ca();
        let root_hash = ca.root_certificate().get_hash().unwrap().to_vec();
        let server = StdArc::new(CertExchangeServer::new("hunter2", ca, 365, 1024 * 1024));

        let (client_io, server_io) = duplex(256 * 1024);
        let counter = IdCounter::new();

        let server_speke = Speke::new("server", "hunter2", crate::speke::default_safe_prime()).unwrap();
        let (server_session, server_read) =
            SpekeSession::with_max_frame_len(server_io, server_speke, counter.clone(), 1024 * 1024);
        let handler = server.handler();
        tokio::spawn(server_session.run(server_read, handler));

        let client_kp = KeyPair::generate(KeyType::Ed25519).unwrap();
        let client_speke = Speke::new("client", "hunter2", crate::speke::default_safe_prime()).unwrap();
        let (client_session, client_read) =
            SpekeSession::with_max_frame_len(client_io, client_speke, counter, 1024 * 1024);

        struct NullHandler;
        #[async_trait::async_trait]
        impl SessionHandler for NullHandler {
            async fn handle(&self, _data: Vec<u8>) -> Option<Vec<u8>> {
                None
            }
        }
        let client_for_task = client_session.clone();
        tokio::spawn(client_for_task.run(client_read, StdArc::new(NullHandler)));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let csr = CertificateRequest::new(&client_kp, &[("CN".to_string(), "client".to_string())]).unwrap();
        let request = bincode::serialize(&CertClientMessage::CertRequest {
            request: csr.to_der().unwrap(),
        })
        .unwrap();
        client_session.send_message(&request).await.unwrap();

        let confirm = bincode::serialize(&CertClientMessage::ConfirmRequest {
            cert_hash: root_hash,
        })
        .unwrap();
        client_session.send_message(&confirm).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
