//! Gas limit and price buffering for bridge calls

use super::provider::{EvmProvider, GasPrice};
use crate::error::LedgerResult;

use ethers::types::U256;
use tracing::debug;

/// Gas estimator for bridge contract calls
pub struct GasEstimator {
    /// Base gas limit for a lock/release call
    base_gas_limit: u64,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new(base_gas_limit: u64) -> Self {
        Self {
            base_gas_limit,
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    pub fn gas_limit(&self) -> U256 {
        let base = U256::from(self.base_gas_limit);
        base + base * self.gas_limit_buffer_percent / 100
    }

    /// Current gas price with buffer applied
    pub async fn gas_price(&self, provider: &EvmProvider) -> LedgerResult<GasPrice> {
        let buffered = self.apply_buffer(provider.get_gas_price().await?);
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn apply_buffer(&self, price: GasPrice) -> GasPrice {
        let pct = self.gas_price_buffer_percent;
        match price {
            GasPrice::Legacy(price) => GasPrice::Legacy(price + price * pct / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: max_fee_per_gas + max_fee_per_gas * pct / 100,
                max_priority_fee_per_gas: max_priority_fee_per_gas
                    + max_priority_fee_per_gas * pct / 100,
            },
        }
    }
}
