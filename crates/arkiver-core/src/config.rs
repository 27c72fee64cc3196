//! Chain and arkive configuration.
//!
//! Every chain source is built from an explicit [`ChainConfig`]; nothing is
//! read from globals or the environment. An [`ArkiverConfig`] bundles the
//! chains of one arkive with its store and logging settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ArkiverError;
use crate::store::StoreConfig;
use crate::telemetry::LogConfig;

/// Per-chain pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain name (e.g. `"ethereum"`).
    pub chain: String,
    /// JSON-RPC endpoint.
    #[serde(default)]
    pub rpc_url: String,
    /// Arkive the checkpoint belongs to. Filled in from [`ArkiverConfig`]
    /// when empty.
    #[serde(default)]
    pub arkive_id: String,
    #[serde(default)]
    pub arkive_version: String,
    /// Size of a fetch window: a window spans `[from, from + block_range]`.
    #[serde(default = "default_block_range")]
    pub block_range: u64,
    /// Unconsumed windows the fetcher may stage ahead of the processor.
    #[serde(default = "default_max_stage_size")]
    pub max_stage_size: usize,
    /// Pause between fetcher ticks, and the processor's idle sleep.
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,
    /// Fetcher sleep once caught up with the head.
    #[serde(default = "default_live_delay_ms")]
    pub live_delay_ms: u64,
    /// Processor sleep while its next window is still being fetched.
    #[serde(default = "default_queue_delay_ms")]
    pub queue_delay_ms: u64,
    /// Fetcher sleep while the staging area is full.
    #[serde(default = "default_max_staging_delay_ms")]
    pub max_staging_delay_ms: u64,
}

fn default_block_range() -> u64 {
    1000
}
fn default_max_stage_size() -> usize {
    10
}
fn default_fetch_interval_ms() -> u64 {
    500
}
fn default_live_delay_ms() -> u64 {
    2000
}
fn default_queue_delay_ms() -> u64 {
    500
}
fn default_max_staging_delay_ms() -> u64 {
    1000
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain: "ethereum".into(),
            rpc_url: String::new(),
            arkive_id: "default".into(),
            arkive_version: "1".into(),
            block_range: default_block_range(),
            max_stage_size: default_max_stage_size(),
            fetch_interval_ms: default_fetch_interval_ms(),
            live_delay_ms: default_live_delay_ms(),
            queue_delay_ms: default_queue_delay_ms(),
            max_staging_delay_ms: default_max_staging_delay_ms(),
        }
    }
}

impl ChainConfig {
    pub fn new(chain: impl Into<String>, rpc_url: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            rpc_url: rpc_url.into(),
            ..Self::default()
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ArkiverError> {
        if self.chain.trim().is_empty() {
            return Err(ArkiverError::Config("chain name is empty".into()));
        }
        if self.rpc_url.trim().is_empty() {
            return Err(ArkiverError::MissingRpcUrl {
                chain: self.chain.clone(),
            });
        }
        if self.block_range == 0 {
            return Err(ArkiverError::Config(format!(
                "chain '{}': block_range must be positive",
                self.chain
            )));
        }
        if self.max_stage_size == 0 {
            return Err(ArkiverError::Config(format!(
                "chain '{}': max_stage_size must be positive",
                self.chain
            )));
        }
        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn live_delay(&self) -> Duration {
        Duration::from_millis(self.live_delay_ms)
    }

    pub fn queue_delay(&self) -> Duration {
        Duration::from_millis(self.queue_delay_ms)
    }

    pub fn max_staging_delay(&self) -> Duration {
        Duration::from_millis(self.max_staging_delay_ms)
    }
}

/// Configuration of one arkive across all of its chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArkiverConfig {
    pub arkive_id: String,
    #[serde(default = "default_arkive_version")]
    pub arkive_version: String,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_arkive_version() -> String {
    "1".into()
}

impl ArkiverConfig {
    pub fn new(arkive_id: impl Into<String>, arkive_version: impl Into<String>) -> Self {
        Self {
            arkive_id: arkive_id.into(),
            arkive_version: arkive_version.into(),
            chains: Vec::new(),
            store: StoreConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Parse a JSON config and fill the arkive ids into its chains.
    pub fn from_json_str(s: &str) -> Result<Self, ArkiverError> {
        let mut config: Self =
            serde_json::from_str(s).map_err(|e| ArkiverError::Config(e.to_string()))?;
        config.fill_chain_ids();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ArkiverError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ArkiverError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Copy `arkive_id` / `arkive_version` into chains that leave them empty.
    pub fn fill_chain_ids(&mut self) {
        for chain in &mut self.chains {
            if chain.arkive_id.is_empty() {
                chain.arkive_id = self.arkive_id.clone();
            }
            if chain.arkive_version.is_empty() {
                chain.arkive_version = self.arkive_version.clone();
            }
        }
    }

    /// Configuration of `chain`, if present.
    pub fn chain(&self, chain: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain == chain)
    }

    pub fn validate(&self) -> Result<(), ArkiverError> {
        if self.arkive_id.trim().is_empty() {
            return Err(ArkiverError::Config("arkive_id is empty".into()));
        }
        for (i, chain) in self.chains.iter().enumerate() {
            chain.validate()?;
            if self.chains[..i].iter().any(|c| c.chain == chain.chain) {
                return Err(ArkiverError::Config(format!(
                    "chain '{}' configured twice",
                    chain.chain
                )));
            }
        }
        Ok(())
    }
}
