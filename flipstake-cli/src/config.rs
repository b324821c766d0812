use anyhow::{bail, Context, Result};
use bitcoin::Network;
use flipstake_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
pub const VAULT_KEY_ENV: &str = "FLIPSTAKE_VAULT_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub engine: EngineConfig,
    /// How often `flipstake reap --watch` sweeps stale claims.
    pub reaper_interval_secs: u64,
}

impl CliConfig {
    pub fn new(network: Network, treasury: &str) -> Self {
        Self {
            engine: EngineConfig::new(network).with_treasury(treasury),
            reaper_interval_secs: 30,
        }
    }

    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        if !path.exists() {
            bail!(
                "No configuration at {}; run `flipstake init` first",
                path.display()
            );
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.engine.validate()?;

        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        self.engine.validate()?;
        std::fs::create_dir_all(data_dir)?;

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(data_dir), content)?;
        Ok(())
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flipstake")
}

pub fn parse_network(name: &str) -> Result<Network> {
    match name {
        "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => bail!("Unknown network: {}", other),
    }
}
