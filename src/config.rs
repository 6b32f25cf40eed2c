//! Node configuration.
//!
//! Operator settings only. Consensus parameters come from
//! [`crate::constants`] through [`CurrencyBuilder`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::consensus::{Currency, CurrencyBuilder};
use crate::crypto::{Hash, PublicKey};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network (mainnet, testnet).
    pub network: String,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Extra checkpoints, height to block hash in hex.
    #[serde(default)]
    pub checkpoints: Vec<CheckpointConfig>,
    /// RPC configuration.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Mining configuration.
    #[serde(default)]
    pub mining: MiningConfig,
    /// Pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A (height, hash) pair the chain must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub height: u64,
    pub hash: String,
}

/// RPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Enable the JSON-RPC server.
    pub enabled: bool,
    /// RPC bind address.
    pub bind_address: String,
    /// Allow administrative methods such as chain rollback.
    #[serde(default)]
    pub enable_admin: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:17236".to_string(),
            enable_admin: false,
        }
    }
}

/// Mining configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Enable internal CPU mining.
    pub enabled: bool,
    /// Reward address.
    pub reward_address: Option<String>,
    /// Number of mining threads (0 = auto-detect based on CPU cores).
    #[serde(default)]
    pub threads: usize,
}

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Seconds between expiry sweeps.
    pub eviction_interval_secs: u64,
    /// Seconds between pool snapshots.
    pub flush_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            eviction_interval_secs: 60,
            flush_interval_secs: 300,
        }
    }
}

/// Settings given on the command line, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub network: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub rpc_bind: Option<String>,
    pub log_level: Option<String>,
    pub mining: bool,
    pub mining_threads: usize,
    pub mining_address: Option<String>,
}

impl NodeConfig {
    /// Load configuration from file and CLI overrides.
    pub fn load(config_path: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        let network = overrides.network.as_deref().unwrap_or("mainnet");
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(network)
        };

        if let Some(ref network) = overrides.network {
            config.network = network.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(ref rpc_bind) = overrides.rpc_bind {
            config.rpc.bind_address = rpc_bind.clone();
        }
        if let Some(ref level) = overrides.log_level {
            config.log_level = level.clone();
        }
        if overrides.mining {
            config.mining.enabled = true;
        }
        if overrides.mining_threads > 0 {
            config.mining.threads = overrides.mining_threads;
        }
        if let Some(ref addr) = overrides.mining_address {
            config.mining.reward_address = Some(addr.clone());
        }

        config.validate()?;
        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(network: &str) -> Self {
        let data_dir = match network {
            "testnet" => PathBuf::from(".lithe-testnet"),
            _ => PathBuf::from(".lithe"),
        };

        Self {
            network: network.to_string(),
            data_dir,
            log_level: default_log_level(),
            checkpoints: Vec::new(),
            rpc: RpcConfig::default(),
            mining: MiningConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.network.as_str(), "mainnet" | "testnet") {
            bail!("unknown network {:?}", self.network);
        }
        if self.mining.enabled && self.mining.reward_address.is_none() {
            bail!("mining is enabled but no reward address is set");
        }
        self.rpc_address()?;
        self.reward_key()?;
        Ok(())
    }

    pub fn rpc_address(&self) -> Result<SocketAddr> {
        self.rpc
            .bind_address
            .parse()
            .with_context(|| format!("invalid RPC bind address {:?}", self.rpc.bind_address))
    }

    /// Key paid by locally mined blocks
    pub fn reward_key(&self) -> Result<Option<PublicKey>> {
        self.mining
            .reward_address
            .as_deref()
            .map(|address| {
                PublicKey::from_address(address)
                    .with_context(|| format!("invalid reward address {:?}", address))
            })
            .transpose()
    }

    /// Consensus parameters for the configured network
    pub fn currency(&self) -> Result<Currency> {
        let mut builder = match self.network.as_str() {
            "testnet" => CurrencyBuilder::testnet(),
            _ => CurrencyBuilder::new(),
        };
        for checkpoint in &self.checkpoints {
            let hash = Hash::from_hex(&checkpoint.hash)
                .with_context(|| format!("invalid checkpoint hash at height {}", checkpoint.height))?;
            builder = builder.checkpoint(checkpoint.height, hash);
        }
        builder.build().context("invalid currency parameters")
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
