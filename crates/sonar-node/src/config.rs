//! Agent configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sonar_core::NodeRecord;
use sonar_dht::DhtConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ethereum mainnet bootnodes run by the go-ethereum team
pub const MAINNET_BOOTNODES: &[&str] = &[
    // bootnode-aws-ap-southeast-1-001
    "enode://d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666@18.138.108.67:30303",
    // bootnode-aws-us-east-1-001
    "enode://22a8232c3abc76a16ae9d6c3b164f98775fe226f0917b0ca871128a74a8e9630b458460865bab457221f1d448dd9791d24c4e5d88786180ac185df813a68d4de@3.209.45.79:30303",
    // bootnode-hetzner-hel
    "enode://2b252ab6a1d0f971d9722cb839a42cb81db019ba44c08754628ab4a823487071b5695317c8ccd085219c3a03af063495b2f1da8d18218da2d6a82981b45e6ffc@65.108.70.101:30303",
    // bootnode-hetzner-fsn
    "enode://4aeb4ab6c14b23e2c4cfdce879c04b0748a20d8e9b59e25ded2a08143e265c6c25936e74cbc8e641e3312ca288673d91f2f93f8e277de3cfa444ecdaaf982052@157.90.35.166:30303",
];

/// Default location of the config file
pub const DEFAULT_CONFIG_PATH: &str = "~/.sonar/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Node key file (defaults to `<data_dir>/nodekey`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,

    /// Discovery configuration
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Address the UDP socket binds to
    pub listen_ip: IpAddr,
    /// UDP port for discovery traffic
    pub listen_port: u16,
    /// Bootstrap nodes as enode URLs
    pub bootstrap_seeds: Vec<String>,
    /// K parameter (nodes per bucket)
    pub table_capacity_per_bucket: usize,
    /// Alpha parameter (lookup parallelism)
    pub lookup_parallelism: usize,
    pub ping_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub revalidate_interval_secs: u64,
    pub request_timeout_ms: u64,
    /// Consecutive failures before a peer is dropped
    pub max_fail_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.sonar".to_string(),
            key_file: None,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let dht = DhtConfig::default();
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 30303,
            bootstrap_seeds: MAINNET_BOOTNODES.iter().map(|s| s.to_string()).collect(),
            table_capacity_per_bucket: dht.k,
            lookup_parallelism: dht.alpha,
            ping_interval_secs: dht.ping_interval.as_secs(),
            refresh_interval_secs: dht.refresh_interval.as_secs(),
            revalidate_interval_secs: dht.revalidate_interval.as_secs(),
            request_timeout_ms: dht.request_timeout.as_millis() as u64,
            max_fail_count: dht.max_fail_count,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Write configuration to a file, creating parent directories
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    /// Where the node key lives
    pub fn key_file(&self) -> PathBuf {
        match &self.key_file {
            Some(path) => expand_path(path),
            None => self.data_dir().join("nodekey"),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.discovery.listen_ip, self.discovery.listen_port)
    }

    /// Build the DHT configuration, parsing every bootstrap URL
    pub fn to_dht_config(&self) -> anyhow::Result<DhtConfig> {
        let d = &self.discovery;
        let seeds = d
            .bootstrap_seeds
            .iter()
            .map(|url| NodeRecord::from_enode_url(url).with_context(|| format!("bad bootnode {}", url)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let config = DhtConfig {
            k: d.table_capacity_per_bucket,
            alpha: d.lookup_parallelism,
            request_timeout: Duration::from_millis(d.request_timeout_ms),
            ping_interval: Duration::from_secs(d.ping_interval_secs),
            refresh_interval: Duration::from_secs(d.refresh_interval_secs),
            revalidate_interval: Duration::from_secs(d.revalidate_interval_secs),
            max_fail_count: d.max_fail_count,
            bootstrap_seeds: seeds,
            ..DhtConfig::default()
        };
        config.validate().context("invalid [discovery] settings")?;
        Ok(config)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
