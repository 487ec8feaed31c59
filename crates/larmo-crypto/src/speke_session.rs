//! Framed, full-duplex transport that drives one [`Speke`] handshake and
//! then carries HMAC-authenticated application data over it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::hash;
use crate::message::SpekeMessage;
use crate::speke::{IdCounter, Speke};

pub const BAD_BEHAVIOR_LIMIT: u32 = 3;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    StoppedError,
    StoppedKeyConfirmationFailed,
    StoppedPeerBadBehavior,
    StoppedPeerDisconnected,
    StoppedPeerPublicKeyOrIdInvalid,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Running)
    }
}

/// Receives the plaintext of authenticated `SignedData` frames, in strict
/// per-session FIFO order, and may return a reply to send back.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle(&self, data: Vec<u8>) -> Option<Vec<u8>>;
}

struct Inner<S> {
    writer: AsyncMutex<WriteHalf<S>>,
    speke: AsyncMutex<Speke>,
    counter: IdCounter,
    state: std::sync::Mutex<SessionState>,
    authenticated: AtomicBool,
    bad_behavior: AtomicU32,
    max_frame_len: usize,
    pending: AsyncMutex<VecDeque<Vec<u8>>>,
    handler: AsyncMutex<Option<Arc<dyn SessionHandler>>>,
}

/// A single peer connection driving a SPEKE handshake and, once
/// authenticated, HMAC-signed application messages.
pub struct SpekeSession<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for SpekeSession<S> {
    fn clone(&self) -> Self {
        SpekeSession {
            inner: self.inner.clone(),
        }
    }
}

impl<S> SpekeSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, speke: Speke, counter: IdCounter) -> (Self, ReadHalf<S>) {
        Self::with_max_frame_len(stream, speke, counter, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(
        stream: S,
        speke: Speke,
        counter: IdCounter,
        max_frame_len: usize,
    ) -> (Self, ReadHalf<S>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let session = SpekeSession {
            inner: Arc::new(Inner {
                writer: AsyncMutex::new(write_half),
                speke: AsyncMutex::new(speke),
                counter,
                state: std::sync::Mutex::new(SessionState::Idle),
                authenticated: AtomicBool::new(false),
                bad_behavior: AtomicU32::new(0),
                max_frame_len,
                pending: AsyncMutex::new(VecDeque::new()),
                handler: AsyncMutex::new(None),
            }),
        };
        (session, read_half)
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("session state mutex poisoned")
    }

    /// Whether key confirmation has succeeded and `send_message` will work.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    fn close(&self, new_state: SessionState) {
        let mut state = self.inner.state.lock().expect("session state mutex poisoned");
        if !state.is_terminal() {
            *state = new_state;
        }
    }

    /// Drive the handshake and read loop to completion. Sends the local
    /// `InitData` as the first frame, then dispatches incoming frames until
    /// the peer disconnects or the session is closed.
    pub async fn run(self, mut read_half: ReadHalf<S>, handler: Arc<dyn SessionHandler>) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("session state mutex poisoned");
            *state = SessionState::Running;
        }
        *self.inner.handler.lock().await = Some(handler);

        let init = {
            let speke = self.inner.speke.lock().await;
            SpekeMessage::InitData {
                id: speke.id().to_string(),
                public_key: speke.public_key()?,
            }
        };
        self.write_frame(&init).await?;

        loop {
            if self.state().is_terminal() {
                return Ok(());
            }
            let frame = match read_frame(&mut read_half, self.inner.max_frame_len).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    self.close(SessionState::StoppedPeerDisconnected);
                    return Ok(());
                }
                Err(FrameReadError::TooLarge) => {
                    self.close(SessionState::StoppedPeerBadBehavior);
                    return Ok(());
                }
                Err(FrameReadError::Io(e)) => {
                    self.close(SessionState::StoppedError);
                    return Err(Error::Io(e));
                }
            };

            let message: SpekeMessage = match bincode::deserialize(&frame) {
                Ok(m) => m,
                Err(_) => {
                    if self.tick_bad_behavior() {
                        return Ok(());
                    }
                    continue;
                }
            };

            if self.dispatch(message).await? {
                return Ok(());
            }
        }
    }

    /// Returns `true` if the session just closed due to hitting the
    /// bad-behavior limit.
    fn tick_bad_behavior(&self) -> bool {
        let count = self.inner.bad_behavior.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= BAD_BEHAVIOR_LIMIT {
            warn!(count, "session exceeded bad-behavior limit, closing");
            self.close(SessionState::StoppedPeerBadBehavior);
            true
        } else {
            false
        }
    }

    /// Returns `true` if the session closed as a result of this message.
    async fn dispatch(&self, message: SpekeMessage) -> Result<bool> {
        match message {
            SpekeMessage::InitData { id, public_key } => {
                let already_set = {
                    let speke = self.inner.speke.lock().await;
                    speke.remote_info_set()
                };
                if already_set {
                    return Ok(self.tick_bad_behavior());
                }
                let outcome = {
                    let mut speke = self.inner.speke.lock().await;
                    speke.provide_remote_public_key_id_pair(&public_key, &id, &self.inner.counter)
                };
                match outcome {
                    Ok(()) => {
                        let kcd = {
                            let mut speke = self.inner.speke.lock().await;
                            speke.key_confirmation_data()?.to_vec()
                        };
                        self.write_frame(&SpekeMessage::KeyConfirmation { data: kcd })
                            .await?;
                        Ok(false)
                    }
                    Err(Error::PeerPublicKeyInvalid) | Err(Error::PeerIdentifierInvalid) => {
                        self.close(SessionState::StoppedPeerPublicKeyOrIdInvalid);
                        Ok(true)
                    }
                    Err(e) => Err(e),
                }
            }
            SpekeMessage::KeyConfirmation { data } => {
                let confirmed = {
                    let mut speke = self.inner.speke.lock().await;
                    speke.confirm_key(&data)?
                };
                if !confirmed {
                    self.close(SessionState::StoppedKeyConfirmationFailed);
                    return Ok(true);
                }
                self.inner.authenticated.store(true, Ordering::SeqCst);
                self.drain_pending().await;
                Ok(false)
            }
            SpekeMessage::SignedData { data, hmac_signature } => {
                if !self.inner.authenticated.load(Ordering::SeqCst) {
                    return Ok(self.tick_bad_behavior());
                }
                let verified = {
                    let mut speke = self.inner.speke.lock().await;
                    speke.confirm_hmac_signature(&hmac_signature, &data)?
                };
                if !verified {
                    return Ok(self.tick_bad_behavior());
                }
                self.deliver(data).await;
                Ok(false)
            }
        }
    }

    async fn deliver(&self, data: Vec<u8>) {
        let handler = self.inner.handler.lock().await.clone();
        match handler {
            Some(handler) => {
                if let Some(reply) = handler.handle(data).await {
                    if let Err(e) = self.send_message(&reply).await {
                        debug!(?e, "failed to send handler reply");
                    }
                }
            }
            None => self.inner.pending.lock().await.push_back(data),
        }
    }

    async fn drain_pending(&self) {
        let handler = self.inner.handler.lock().await.clone();
        let Some(handler) = handler else { return };
        loop {
            let next = self.inner.pending.lock().await.pop_front();
            let Some(data) = next else { break };
            if let Some(reply) = handler.handle(data).await {
                let _ = self.send_message(&reply).await;
            }
        }
    }

    /// Emit `SignedData { data, HMAC_K(data) }`. Fails with
    /// `NotAuthenticated` before key confirmation, `SessionClosed` once the
    /// session has reached a terminal state.
    pub async fn send_message(&self, data: &[u8]) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::SessionClosed);
        }
        if !self.inner.authenticated.load(Ordering::SeqCst) {
            return Err(Error::NotAuthenticated);
        }
        let hmac_signature = {
            let mut speke = self.inner.speke.lock().await;
            speke.hmac_sign(data)?
        };
        self.write_frame(&SpekeMessage::SignedData {
            data: data.to_vec(),
            hmac_signature,
        })
        .await
    }

    async fn write_frame(&self, message: &SpekeMessage) -> Result<()> {
        let payload = bincode::serialize(message)
            .map_err(|_| Error::ProtocolViolation("failed to encode outgoing frame".to_string()))?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&(payload.len() as u64).to_le_bytes()).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }
}

enum FrameReadError {
    TooLarge,
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameReadError {
    fn from(e: std::io::Error) -> Self {
        FrameReadError::Io(e)
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_len: usize,
) -> std::result::Result<Option<Vec<u8>>, FrameReadError> {
    let mut len_buf = [0u8; 8];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_le_bytes(len_buf) as usize;
    if len > max_frame_len {
        return Err(FrameReadError::TooLarge);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// `H(CA root DER)`, used by `confirm_request`/`confirm_response`.
pub fn hash_cert_der(der: &[u8]) -> Vec<u8> {
    hash(der)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigint::BigInt;
    use tokio::io::duplex;

    fn toy_prime() -> BigInt {
        BigInt::from_u64(2_692_367)
    }

    struct EchoHandler;

    #[async_trait::async_trait]
    impl SessionHandler for EchoHandler {
        async fn handle(&self, data: Vec<u8>) -> Option<Vec<u8>> {
            Some(data)
        }
    }

    #[tokio::test]
    async fn handshake_authenticates_and_delivers_signed_data() {
        let (client_io, server_io) = duplex(64 * 1024);
        let counter = IdCounter::new();

        let server_speke = Speke::new("server", "hunter2", toy_prime()).unwrap();
        let (server, server_read) = SpekeSession::new(server_io, server_speke, counter.clone());

        let client_speke = Speke::new("client", "hunter2", toy_prime()).unwrap();
        let (client, client_read) = SpekeSession::new(client_io, client_speke, counter);

        let server_for_task = server.clone();
        let client_for_task = client.clone();
        let server_task = tokio::spawn(server_for_task.run(server_read, Arc::new(EchoHandler)));
        let client_task = tokio::spawn(client_for_task.run(client_read, Arc::new(EchoHandler)));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(client.state(), SessionState::Running);
        assert_eq!(server.state(), SessionState::Running);

        client.send_message(b"hello").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        server_task.abort();
        client_task.abort();
    }
}
