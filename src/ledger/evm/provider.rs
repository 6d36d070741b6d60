//! Chain A provider with multi-RPC support and automatic failover

use crate::config::{EvmChainConfig, GasPriceStrategy};
use crate::error::{BridgeError, BridgeResult, LedgerError, LedgerResult};
use crate::request::Chain;

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct EvmProvider {
    chain_id: u64,
    gas_price_strategy: GasPriceStrategy,
    max_gas_price_gwei: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmProvider {
    pub fn new(config: &EvmChainConfig) -> BridgeResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(BridgeError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            chain_id: config.chain_id,
            gas_price_strategy: config.gas_price_strategy.clone(),
            max_gas_price_gwei: config.max_gas_price_gwei,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    fn unavailable(&self, what: &str) -> LedgerError {
        LedgerError::transient(
            Chain::A,
            format!("all providers failed to {} on chain {}", what, self.chain_id),
        )
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> LedgerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }
        Err(self.unavailable("get block number"))
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> LedgerResult<Option<TransactionReceipt>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!("Failed to get receipt {:?} from chain {}: {}", tx_hash, self.chain_id, e);
                    self.failover();
                }
            }
        }
        Err(self.unavailable("get receipt"))
    }

    pub async fn get_transaction(&self, tx_hash: H256) -> LedgerResult<Option<Transaction>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction(tx_hash).await {
                Ok(tx) => return Ok(tx),
                Err(e) => {
                    warn!("Failed to get transaction {:?} from chain {}: {}", tx_hash, self.chain_id, e);
                    self.failover();
                }
            }
        }
        Err(self.unavailable("get transaction"))
    }

    pub async fn get_logs(&self, filter: &Filter) -> LedgerResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }
        Err(self.unavailable("get logs"))
    }

    pub async fn get_balance(&self, address: Address) -> LedgerResult<U256> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_balance(address, None).await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    warn!("Failed to get balance from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }
        Err(self.unavailable("get balance"))
    }

    pub async fn get_transaction_count(&self, address: Address) -> LedgerResult<u64> {
        let nonce = self
            .http()
            .get_transaction_count(address, None)
            .await
            .map_err(|e| LedgerError::transient(Chain::A, format!("nonce lookup failed: {}", e)))?;
        Ok(nonce.as_u64())
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> LedgerResult<GasPrice> {
        match self.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self.http().get_gas_price().await.map_err(|e| {
                    LedgerError::transient(Chain::A, format!("gas price lookup failed: {}", e))
                })?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> LedgerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| LedgerError::transient(Chain::A, e.to_string()))?
            .ok_or_else(|| LedgerError::transient(Chain::A, "no latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| LedgerError::permanent(Chain::A, "no base fee in block"))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // 2 * base_fee + priority_fee, capped
        let max_fee = base_fee * 2 + priority_fee;
        let max_gwei = U256::from(self.max_gas_price_gwei) * U256::from(1_000_000_000u64);

        Ok((std::cmp::min(max_fee, max_gwei), priority_fee))
    }

    /// Health check: some provider answers with a block number
    pub async fn health_check(&self) -> LedgerResult<()> {
        self.get_block_number().await.map(|_| ())
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
