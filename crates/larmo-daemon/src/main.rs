use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use larmo_crypto::ca::CertificateAuthority;
use larmo_crypto::cert_exchange::CertExchangeServer;
use larmo_crypto::config::CertExchangeConfig;
use larmo_crypto::keypair::{KeyPair, KeyType};
use larmo_crypto::paths::{ca_cert_path, ca_key_path, ca_serial_path, config_path};
use tracing::info;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(author, version, about = "Larmo player daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a root CA key pair and self-signed certificate.
    Init {
        #[arg(long)]
        ca_cert: Option<PathBuf>,
        #[arg(long)]
        ca_key: Option<PathBuf>,
    },
    /// Run the certificate exchange server.
    Run {
        #[arg(long)]
        ca_cert: Option<PathBuf>,
        #[arg(long)]
        ca_key: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { ca_cert, ca_key } => init_command(ca_cert, ca_key).await,
        Commands::Run { ca_cert, ca_key } => run_command(ca_cert, ca_key).await,
    }
}

async fn init_command(ca_cert_override: Option<PathBuf>, ca_key_override: Option<PathBuf>) -> Result<()> {
    let cert_path = ca_cert_override.map(Ok).unwrap_or_else(ca_cert_path)?;
    let key_path = ca_key_override.map(Ok).unwrap_or_else(ca_key_path)?;
    if cert_path.exists() {
        return Err(anyhow!("CA certificate already exists at {}", cert_path.display()));
    }
    if let Some(parent) = cert_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if key_path.exists() {
        return Err(anyhow!("CA private key already exists at {}", key_path.display()));
    }

    let config_path = config_path()?;
    let config = CertExchangeConfig::load_or_default(&config_path).context("loading configuration")?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(&config_path).context("writing default configuration")?;

    let key_pair = KeyPair::generate(KeyType::Ed25519).context("generating CA key pair")?;
    key_pair.to_pem_file_priv_key(&key_path, None).context("writing CA private key")?;

    let ca = CertificateAuthority::new(key_pair, &config.ca_subject, config.root_validity_days)
        .context("self-signing root certificate")?;
    ca.root_certificate().serialize(&cert_path)?;
    std::fs::write(ca_serial_path()?, ca.next_serial().to_string())?;

    println!("Root CA certificate written to {}", cert_path.display());
    println!("Root CA private key written to {}", key_path.display());
    Ok(())
}

async fn run_command(ca_cert_override: Option<PathBuf>, ca_key_override: Option<PathBuf>) -> Result<()> {
    let cert_path = ca_cert_override.map(Ok).unwrap_or_else(ca_cert_path)?;
    let key_path = ca_key_override.map(Ok).unwrap_or_else(ca_key_path)?;

    let config = CertExchangeConfig::load_or_default(config_path()?).context("loading configuration")?;
    let cert = larmo_crypto::cert::Certificate::deserialize(&cert_path)
        .with_context(|| format!("loading CA certificate from {}", cert_path.display()))?;
    let key_pair = KeyPair::from_pem_file(KeyType::Ed25519, &key_path)
        .with_context(|| format!("loading CA private key from {}", key_path.display()))?;
    let next_serial = std::fs::read_to_string(ca_serial_path()?)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(1);
    let ca = CertificateAuthority::from_parts(cert, key_pair, next_serial);

    let password = Zeroizing::new(read_password(&config.password_env)?);

    let server = std::sync::Arc::new(CertExchangeServer::new(
        (*password).clone(),
        ca,
        config.client_validity_days,
        config.max_frame_len,
    ));

    let socket_path = PathBuf::from(&config.listen.path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let server_task = {
        let server = server.clone();
        let socket_path = socket_path.clone();
        tokio::spawn(async move { server.start(socket_path).await })
    };

    info!(socket = %socket_path.display(), "cert exchange server listening");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server_task.abort();
    std::fs::write(ca_serial_path()?, server.ca_next_serial().to_string())?;
    Ok(())
}

fn read_password(env_var: &str) -> Result<String> {
    if let Ok(pw) = std::env::var(env_var) {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    rpassword::prompt_password("Shared cert-exchange password: ")
        .map_err(|e| anyhow!("password prompt: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_command_writes_cert_key_and_serial() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt.pem");
        let key_path = dir.path().join("ca.key.pem");

        init_command(Some(cert_path.clone()), Some(key_path.clone())).await.unwrap();

        assert!(cert_path.exists());
        assert!(key_path.exists());
        larmo_crypto::cert::Certificate::deserialize(&cert_path).unwrap();
        KeyPair::from_pem_file(KeyType::Ed25519, &key_path).unwrap();
    }

    #[tokio::test]
    async fn init_command_refuses_to_overwrite_existing_cert() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt.pem");
        let key_path = dir.path().join("ca.key.pem");

        init_command(Some(cert_path.clone()), Some(key_path.clone())).await.unwrap();
        let second = init_command(Some(cert_path), Some(key_path)).await;
        assert!(second.is_err());
    }

    #[test]
    fn read_password_prefers_non_empty_env_var() {
        std::env::set_var("LARMO_TEST_PASSWORD_ENV", "s3cret");
        assert_eq!(read_password("LARMO_TEST_PASSWORD_ENV").unwrap(), "s3cret");
        std::env::remove_var("LARMO_TEST_PASSWORD_ENV");
    }
}
