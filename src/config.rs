use anyhow::{Context, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coordinator API version this client speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ProtocolVersion {
    #[default]
    V4,
}

impl ProtocolVersion {
    pub fn api_prefix(self) -> &'static str {
        match self {
            ProtocolVersion::V4 => "/api/v4/btc/chaumiancoinjoin",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub coordinator_url: String,
    pub network: Network,
    /// SOCKS5 endpoint of a Tor daemon. Each Bob request gets its own circuit.
    pub tor_socks5: Option<SocketAddr>,
    pub protocol_version: ProtocolVersion,
    pub request_timeout_secs: u64,
    pub unconfirmation_timeout_secs: u64,
    /// Upper bound of the random pause before acting on a fresh status.
    pub max_response_delay_secs: u64,
    pub active_poll_secs: [u64; 2],
    pub dormant_poll_secs: [u64; 2],
    pub shutdown_timeout_secs: u64,
    pub metrics_report_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://127.0.0.1:37127".into(),
            network: Network::Regtest,
            tor_socks5: None,
            protocol_version: ProtocolVersion::V4,
            request_timeout_secs: 60,
            unconfirmation_timeout_secs: 5,
            max_response_delay_secs: 7,
            active_poll_secs: [2, 7],
            dormant_poll_secs: [180, 360],
            shutdown_timeout_secs: 60,
            metrics_report_secs: 300,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.coordinator_url.is_empty(), "coordinator_url is empty");
        anyhow::ensure!(
            self.active_poll_secs[0] <= self.active_poll_secs[1],
            "active_poll_secs range is inverted"
        );
        anyhow::ensure!(
            self.dormant_poll_secs[0] <= self.dormant_poll_secs[1],
            "dormant_poll_secs range is inverted"
        );
        Ok(())
    }

    pub fn api_prefix(&self) -> &'static str {
        self.protocol_version.api_prefix()
    }

    /// Timing-privacy delays are pointless on a private test network.
    pub fn skips_response_delay(&self) -> bool {
        self.network == Network::Regtest
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn unconfirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.unconfirmation_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chaumix")
        .join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "coordinator_url": "http://coord.example", "network": "testnet" }"#).unwrap();

        let cfg = ClientConfig::load(&path).unwrap();
        assert_eq!(cfg.coordinator_url, "http://coord.example");
        assert_eq!(cfg.network, Network::Testnet);
        assert_eq!(cfg.max_response_delay_secs, 7);
        assert!(!cfg.skips_response_delay());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = ClientConfig::default();
        cfg.tor_socks5 = Some("127.0.0.1:9050".parse().unwrap());
        cfg.save(&path).unwrap();
        assert_eq!(ClientConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn rejects_inverted_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "active_poll_secs": [9, 2] }"#).unwrap();
        assert!(ClientConfig::load(&path).is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = ClientConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.api_prefix(), "/api/v4/btc/chaumiancoinjoin");
    }
}
