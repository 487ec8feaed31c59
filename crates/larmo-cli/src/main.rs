use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use larmo_crypto::ca::DEFAULT_CLIENT_VALIDITY_DAYS;
use larmo_crypto::keypair::{KeyPair, KeyType};
use larmo_crypto::message::{CertClientMessage, CertServerMessage};
use larmo_crypto::speke::{default_safe_prime, IdCounter, Speke};
use larmo_crypto::speke_session::{SessionHandler, SpekeSession};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(author, version, about = "Larmo certificate exchange client", long_about = None)]
struct Cli {
    /// Path to the daemon's cert-exchange Unix socket.
    #[arg(long, default_value = "/run/larmo/cert-exchange.sock")]
    socket: PathBuf,

    /// Identifier this client presents during the SPEKE handshake.
    #[arg(long, default_value_t = default_client_id())]
    id: String,

    /// Environment variable holding the shared cert-exchange password.
    #[arg(long, default_value = "LARMO_SPEKE_PASSWORD")]
    password_env: String,

    #[command(subcommand)]
    command: Commands,
}

fn default_client_id() -> String {
    format!("cli-{}", std::process::id())
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request a client certificate signed by the daemon's CA.
    RequestCert {
        /// Subject common name for the certificate.
        #[arg(long, default_value = "larmo client")]
        common_name: String,
        /// Where to write the issued client certificate (PEM).
        #[arg(long)]
        out_cert: PathBuf,
        /// Where to write the freshly generated client private key (PEM).
        #[arg(long)]
        out_key: PathBuf,
        /// Where to write the CA's root certificate (PEM).
        #[arg(long)]
        out_root: PathBuf,
    },
    /// Confirm the daemon's CA matches an expected root certificate hash.
    ConfirmCa {
        /// Hex-encoded SHA-256 hash of the expected root certificate DER.
        #[arg(long)]
        hash: String,
    },
}

/// Forwards every authenticated reply onto a channel; the session driver
/// runs on its own task while the caller awaits replies one at a time.
struct ReplyForwarder {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait::async_trait]
impl SessionHandler for ReplyForwarder {
    async fn handle(&self, data: Vec<u8>) -> Option<Vec<u8>> {
        let _ = self.tx.send(data);
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let password = Zeroizing::new(read_password(&cli.password_env)?);
    let stream = UnixStream::connect(&cli.socket)
        .await
        .with_context(|| format!("connecting to {}", cli.socket.display()))?;

    let speke = Speke::new(&cli.id, &*password, default_safe_prime())
        .map_err(|e| anyhow!("constructing SPEKE state: {e}"))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (session, read_half) = SpekeSession::new(stream, speke, IdCounter::new());

    let driver = session.clone();
    let handler = std::sync::Arc::new(ReplyForwarder { tx });
    let session_task = tokio::spawn(async move { driver.run(read_half, handler).await });

    wait_for_authentication(&session).await?;

    let (request, pending_key) = match &cli.command {
        Commands::RequestCert { common_name, .. } => {
            let client_kp = KeyPair::generate(KeyType::Ed25519)?;
            let csr = larmo_crypto::csr::CertificateRequest::new(
                &client_kp,
                &[("CN".to_string(), common_name.clone())],
            )
            .map_err(|e| anyhow!("building CSR: {e}"))?;
            let der = csr.to_der().map_err(|e| anyhow!("encoding CSR: {e}"))?;
            (CertClientMessage::CertRequest { request: der }, Some(client_kp))
        }
        Commands::ConfirmCa { hash } => {
            let cert_hash = hex::decode(hash).context("--hash must be hex-encoded")?;
            (CertClientMessage::ConfirmRequest { cert_hash }, None)
        }
    };

    session
        .send_message(&bincode::serialize(&request)?)
        .await
        .map_err(|e| anyhow!("sending request: {e}"))?;

    let reply_bytes = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .context("timed out waiting for a reply")?
        .ok_or_else(|| anyhow!("session closed before replying"))?;
    let reply: CertServerMessage = bincode::deserialize(&reply_bytes)?;

    match (cli.command, reply) {
        (
            Commands::RequestCert { out_cert, out_key, out_root, .. },
            CertServerMessage::CertBundle { root_cert, client_cert },
        ) => {
            let client_kp = pending_key.expect("RequestCert always generates a key pair");
            std::fs::write(&out_root, root_cert)?;
            std::fs::write(&out_cert, client_cert)?;
            client_kp.to_pem_file_priv_key(&out_key, None).map_err(|e| anyhow!("writing client key: {e}"))?;
            println!(
                "client certificate ({} day validity) written to {}",
                DEFAULT_CLIENT_VALIDITY_DAYS,
                out_cert.display()
            );
        }
        (Commands::ConfirmCa { .. }, CertServerMessage::ConfirmResponse { response }) => {
            if response {
                println!("CA confirmed");
            } else {
                bail!("CA root certificate hash did not match");
            }
        }
        (_, CertServerMessage::ErrorCode { code }) => bail!("server returned error code {code}"),
        (_, other) => bail!("unexpected server reply: {other:?}"),
    }

    session_task.abort();
    Ok(())
}

async fn wait_for_authentication<S>(session: &SpekeSession<S>) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    for _ in 0..100 {
        if session.is_authenticated() {
            return Ok(());
        }
        if session.state().is_terminal() {
            bail!("session closed before authenticating: {:?}", session.state());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("timed out waiting for key confirmation (wrong password?)")
}

fn read_password(env_var: &str) -> Result<String> {
    if let Ok(pw) = std::env::var(env_var) {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    rpassword::prompt_password("Shared cert-exchange password: ").map_err(|e| anyhow!("password prompt: {e}"))
}
