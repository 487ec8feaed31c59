use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "net";
pub const APP_ORG: &str = "larmo";
pub const APP_NAME: &str = "larmo";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Where the CA's root certificate and key pair are kept, PEM-armored.
pub fn ca_cert_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("ca.crt.pem"))
}

pub fn ca_key_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("ca.key.pem"))
}

/// Where the CA's next-serial counter is persisted across restarts.
pub fn ca_serial_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("ca.serial"))
}

/// Where the cert exchange server's JSON configuration lives.
pub fn config_path() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine config directory"))?;
    Ok(dirs.config_dir().join("config.json"))
}
