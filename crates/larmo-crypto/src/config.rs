//! Configuration for the certificate exchange server and its listener.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ca::{DEFAULT_CLIENT_VALIDITY_DAYS, DEFAULT_ROOT_VALIDITY_DAYS};
use crate::speke_session::{BAD_BEHAVIOR_LIMIT, DEFAULT_MAX_FRAME_LEN};

/// Where the cert exchange server listens. A Unix domain socket path on
/// Unix, a named pipe path on Windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenAddr {
    pub path: String,
}

impl Default for ListenAddr {
    fn default() -> Self {
        ListenAddr {
            path: "/run/larmo/cert-exchange.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertExchangeConfig {
    pub listen: ListenAddr,
    /// Name of the environment variable holding the shared SPEKE password.
    pub password_env: String,
    pub ca_subject: Vec<(String, String)>,
    pub client_validity_days: u32,
    pub root_validity_days: u32,
    pub bad_behavior_limit: u32,
    pub max_frame_len: usize,
}

impl Default for CertExchangeConfig {
    fn default() -> Self {
        CertExchangeConfig {
            listen: ListenAddr::default(),
            password_env: "LARMO_SPEKE_PASSWORD".to_string(),
            ca_subject: vec![("CN".to_string(), "larmo root CA".to_string())],
            client_validity_days: DEFAULT_CLIENT_VALIDITY_DAYS,
            root_validity_days: DEFAULT_ROOT_VALIDITY_DAYS,
            bad_behavior_limit: BAD_BEHAVIOR_LIMIT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl CertExchangeConfig {
    /// Load JSON config from `path`, falling back to defaults if the file
    /// does not exist. Any other I/O or parse error is returned.
    pub fn load_or_default(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| crate::error::Error::MalformedRequest(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(crate::error::Error::Io(e)),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> crate::error::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::MalformedRequest(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = CertExchangeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: CertExchangeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.client_validity_days, config.client_validity_days);
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let config = CertExchangeConfig::load_or_default(&path).unwrap();
        assert_eq!(config.client_validity_days, DEFAULT_CLIENT_VALIDITY_DAYS);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = CertExchangeConfig::default();
        config.client_validity_days = 42;
        config.save(&path).unwrap();
        let loaded = CertExchangeConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.client_validity_days, 42);
    }
}
