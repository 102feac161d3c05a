//! Configuration management for the settlement relayer
//!
//! Loads configuration from a TOML file with environment variable substitution.

use alloy_primitives::{Address, Bytes};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub store: StoreConfig,
    pub queues: QueuesConfig,
    pub cctp: CctpConfig,
    pub send_batch: BatchScanConfig,
    pub withdrawals: BatchScanConfig,
    #[serde(default)]
    pub intent_sources: Vec<IntentSourceConfig>,
    pub indexer: IndexerConfig,
    pub balances: BalancesConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// How long shutdown waits for workers to drain
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    pub liquidity: QueueConfig,
    pub intent_processor: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub stalled_after_secs: Option<u64>,
    /// Delay before a job deferred by a busy group is offered again
    #[serde(default = "default_group_requeue_delay")]
    pub group_requeue_delay_ms: u64,
}

impl QueueConfig {
    pub fn group_requeue_delay(&self) -> Duration {
        Duration::from_millis(self.group_requeue_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CctpConfig {
    pub attestation_api_url: String,
    #[serde(default = "default_repoll_delay")]
    pub repoll_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub chains: Vec<CctpChainConfig>,
}

impl CctpConfig {
    pub fn repoll_delay(&self) -> Duration {
        Duration::from_millis(self.repoll_delay_ms)
    }

    pub fn chain(&self, chain_id: u64) -> Option<&CctpChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CctpChainConfig {
    pub chain_id: u64,
    pub domain: u32,
    pub message_transmitter: Address,
}

/// Recurring batch scan
#[derive(Debug, Clone, Deserialize)]
pub struct BatchScanConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub chunk_size: usize,
}

impl BatchScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentSourceConfig {
    pub source_address: Address,
    /// Portal receiving fulfilments on the destination chain
    pub inbox: Address,
    pub chain_id: u64,
    /// Native fee attached to prove calls
    #[serde(default)]
    pub prove_fee_wei: u64,
    #[serde(default)]
    pub prover_data: Bytes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalancesConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    #[serde(default)]
    pub wallets: Vec<Address>,
    #[serde(default)]
    pub tokens: Vec<TrackedToken>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackedToken {
    pub chain_id: u64,
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    /// Warn threshold in whole tokens
    pub min_balance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_confirmations")]
    pub confirmations: usize,
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "RELAYER_PRIVATE_KEY".to_string(),
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_group_requeue_delay() -> u64 {
    5_000
}

fn default_repoll_delay() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    10
}

fn default_confirmations() -> usize {
    1
}

fn default_receipt_timeout() -> u64 {
    120
}

impl Settings {
    /// Load settings from `$SETTLEMENT_CONFIG`, falling back to `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("SETTLEMENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::from_path(&config_path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        if self.store.backend == StoreBackend::Postgres
            && self.store.url.as_deref().map_or(true, str::is_empty)
        {
            anyhow::bail!("store.url is required for the postgres backend");
        }

        for (name, queue) in [
            ("liquidity", &self.queues.liquidity),
            ("intent_processor", &self.queues.intent_processor),
        ] {
            if queue.concurrency == 0 || queue.poll_interval_ms == 0 {
                anyhow::bail!("Queue {} needs positive concurrency and poll interval", name);
            }
        }

        for (name, scan) in [("send_batch", &self.send_batch), ("withdrawals", &self.withdrawals)] {
            if scan.chunk_size == 0 {
                anyhow::bail!("{}.chunk_size must be positive", name);
            }
            if scan.enabled && scan.interval_ms == 0 {
                anyhow::bail!("{}.interval_ms must be positive", name);
            }
        }

        if self.balances.enabled && self.balances.interval_secs == 0 {
            anyhow::bail!("balances.interval_secs must be positive");
        }

        for cctp_chain in &self.cctp.chains {
            match self.chain_by_id(cctp_chain.chain_id) {
                Some(chain) if chain.enabled => {}
                _ => anyhow::bail!(
                    "CCTP chain {} has no enabled chain configuration",
                    cctp_chain.chain_id
                ),
            }
        }

        if (self.send_batch.enabled || self.withdrawals.enabled) && self.intent_sources.is_empty() {
            tracing::warn!("Batch scans enabled without intent sources - they will find nothing");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    let result = re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}
