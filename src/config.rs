//! Configuration management for the bridge relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::pricing::PricingPolicy;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid regex");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub pricing: PricingPolicy,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain_a: ChainAConfig,
    pub chain_b: ChainBConfig,
}

/// Reconciliation policy values
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// How long a submitted lock may stay unconfirmed before the request fails
    pub source_confirm_timeout_secs: u64,
    /// Number of concurrent engine workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub confirmation_depth: ConfirmationDepth,
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConfirmationDepth {
    pub chain_a: u64,
    pub chain_b: u64,
}

impl BridgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn source_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.source_confirm_timeout_secs)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            source_confirm_timeout_secs: 1_800,
            workers: default_workers(),
            confirmation_depth: ConfirmationDepth {
                chain_a: 12,
                chain_b: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Postgres(DatabaseConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ChainAConfig {
    Evm(EvmChainConfig),
    Simulated(SimulatedChainConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ChainBConfig {
    Canister(CanisterConfig),
    Simulated(SimulatedChainConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub bridge_address: String,
    /// Name of the environment variable holding the relayer signing key
    pub private_key_env: String,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// How far back to search bridge events for an already processed key
    #[serde(default = "default_key_lookback_blocks")]
    pub key_lookback_blocks: u64,
}

fn default_gas_limit() -> u64 {
    150_000
}

fn default_key_lookback_blocks() -> u64 {
    50_000
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanisterConfig {
    pub gateway_url: String,
    pub canister_id: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

/// In-process ledger for local runs
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedChainConfig {
    pub block_interval_ms: u64,
}

impl Settings {
    /// Load settings from `$CKBRIDGE_CONFIG` or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("CKBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let bridge = &self.bridge;

        if bridge.max_attempts == 0 {
            anyhow::bail!("bridge.max_attempts must be at least 1");
        }
        if bridge.poll_interval_ms == 0 {
            anyhow::bail!("bridge.poll_interval_ms must be positive");
        }
        if bridge.backoff_base_ms > bridge.backoff_cap_ms {
            anyhow::bail!("bridge.backoff_base_ms must not exceed bridge.backoff_cap_ms");
        }
        if bridge.workers == 0 {
            anyhow::bail!("bridge.workers must be at least 1");
        }

        self.pricing.validate()?;

        if let ChainAConfig::Evm(evm) = &self.chain_a {
            if evm.rpc_urls.is_empty() {
                anyhow::bail!("chain_a has no RPC URLs configured");
            }
            if evm.bridge_address.is_empty() {
                anyhow::bail!("chain_a has no bridge contract address");
            }
        }

        if let ChainBConfig::Canister(canister) = &self.chain_b {
            if canister.gateway_url.is_empty() || canister.canister_id.is_empty() {
                anyhow::bail!("chain_b requires gateway_url and canister_id");
            }
        }

        if matches!(self.chain_a, ChainAConfig::Simulated(_))
            || matches!(self.chain_b, ChainBConfig::Simulated(_))
        {
            tracing::warn!("At least one chain runs in simulated mode - no real funds will move");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[bridge]
poll_interval_ms = 500
max_attempts = 4
backoff_base_ms = 200
backoff_cap_ms = 5000
source_confirm_timeout_secs = 600
workers = 2

[bridge.confirmation_depth]
chain_a = 12
chain_b = 1

[pricing]
kind = "flat_fee"
bps = 30

[store]
backend = "memory"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chain_a]
mode = "evm"
chain_id = 11155111
rpc_urls = ["https://rpc.${CKBRIDGE_TEST_HOST}/v1"]
bridge_address = "0x00000000000000000000000000000000000000b1"
private_key_env = "RELAYER_PRIVATE_KEY"
gas_price_strategy = "eip1559"
max_gas_price_gwei = 200

[chain_b]
mode = "simulated"
block_interval_ms = 1000
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CKBRIDGE_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${CKBRIDGE_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("CKBRIDGE_TEST_HOST", "sepolia.example");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.bridge.max_attempts, 4);
        assert_eq!(settings.bridge.workers, 2);
        assert_eq!(settings.bridge.confirmation_depth.chain_a, 12);
        assert_eq!(settings.pricing, PricingPolicy::FlatFee { bps: 30 });
        assert!(matches!(settings.store, StoreConfig::Memory));
        assert!(matches!(settings.chain_b, ChainBConfig::Simulated(_)));

        match settings.chain_a {
            ChainAConfig::Evm(evm) => {
                assert_eq!(evm.rpc_urls, vec!["https://rpc.sepolia.example/v1"]);
                assert_eq!(evm.gas_price_strategy, GasPriceStrategy::Eip1559);
                assert_eq!(evm.gas_limit, 150_000);
            }
            other => panic!("unexpected chain_a config: {:?}", other),
        }
    }

    #[test]
    fn test_bundled_local_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/local.toml");
        let settings = Settings::load_from(&path).unwrap();
        assert!(matches!(settings.chain_a, ChainAConfig::Simulated(_)));
        assert!(matches!(settings.chain_b, ChainBConfig::Simulated(_)));
        assert_eq!(settings.pricing, PricingPolicy::FlatFee { bps: 10 });
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let raw = SAMPLE.replace("backoff_base_ms = 200", "backoff_base_ms = 9000");
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let raw = SAMPLE.replace("max_attempts = 4", "max_attempts = 0");
        assert!(Settings::parse(&raw).is_err());
    }
}
