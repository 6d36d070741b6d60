//! Bridge contract event lookups by idempotency key

use super::provider::EvmProvider;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::LedgerOp;
use crate::request::Chain;

use async_trait::async_trait;
use ethers::types::{Address, Filter, Log, H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;

pub const LOCKED_EVENT: &str = "Locked(bytes32,address,uint256)";
pub const RELEASED_EVENT: &str = "Released(bytes32,address,uint256)";

/// Topic of the event the contract emits when it processes `op`
pub fn event_topic(op: LedgerOp) -> H256 {
    match op {
        LedgerOp::Lock => H256::from(keccak256(LOCKED_EVENT)),
        _ => H256::from(keccak256(RELEASED_EVENT)),
    }
}

/// Where the contract records which keys it has processed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyedEventLog: Send + Sync {
    /// Transaction in which the contract processed `op` for `digest`, if any
    async fn find_processed(&self, op: LedgerOp, digest: [u8; 32]) -> LedgerResult<Option<H256>>;
}

/// Searches the bridge contract's logs, `key` being the first indexed topic
pub struct ContractEvents {
    provider: Arc<EvmProvider>,
    bridge_address: Address,
    lookback_blocks: u64,
}

impl ContractEvents {
    pub fn new(provider: Arc<EvmProvider>, bridge_address: Address, lookback_blocks: u64) -> Self {
        Self {
            provider,
            bridge_address,
            lookback_blocks,
        }
    }
}

#[async_trait]
impl KeyedEventLog for ContractEvents {
    async fn find_processed(&self, op: LedgerOp, digest: [u8; 32]) -> LedgerResult<Option<H256>> {
        let latest = self.provider.get_block_number().await?;
        let filter = Filter::new()
            .address(self.bridge_address)
            .topic0(event_topic(op))
            .topic1(H256::from(digest))
            .from_block(latest.saturating_sub(self.lookback_blocks));

        let logs = self.provider.get_logs(&filter).await?;
        Ok(logs
            .into_iter()
            .filter(|log| log.removed != Some(true))
            .find_map(|log| log.transaction_hash))
    }
}

/// Account and amount of a `Locked` event emitted by `bridge_address`
pub fn decode_locked(logs: &[Log], bridge_address: Address) -> LedgerResult<(Address, U256)> {
    let topic = event_topic(LedgerOp::Lock);
    let log = logs
        .iter()
        .find(|log| log.address == bridge_address && log.topics.first() == Some(&topic))
        .ok_or_else(|| LedgerError::permanent(Chain::A, "transaction emitted no bridge lock"))?;

    if log.topics.len() < 3 || log.data.len() < 32 {
        return Err(LedgerError::permanent(Chain::A, "malformed Locked event"));
    }

    let account = Address::from(log.topics[2]);
    let amount = U256::from_big_endian(&log.data[..32]);
    Ok((account, amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    fn locked_log(bridge: Address, account: Address, amount: u64) -> Log {
        let mut data = [0u8; 32];
        U256::from(amount).to_big_endian(&mut data);
        Log {
            address: bridge,
            topics: vec![
                event_topic(LedgerOp::Lock),
                H256::repeat_byte(7),
                H256::from(account),
            ],
            data: Bytes::from(data.to_vec()),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_locked() {
        let bridge = Address::from_low_u64_be(0xb71d);
        let account = Address::from_low_u64_be(0xaaa);
        let logs = vec![locked_log(bridge, account, 2_500)];

        let (from, amount) = decode_locked(&logs, bridge).unwrap();
        assert_eq!(from, account);
        assert_eq!(amount, U256::from(2_500u64));
    }

    #[test]
    fn test_lock_from_another_contract_is_ignored() {
        let bridge = Address::from_low_u64_be(0xb71d);
        let other = Address::from_low_u64_be(0xbad);
        let logs = vec![locked_log(other, Address::from_low_u64_be(0xaaa), 2_500)];

        assert!(!decode_locked(&logs, bridge).unwrap_err().is_transient());
    }

    #[test]
    fn test_event_topics_differ() {
        assert_ne!(event_topic(LedgerOp::Lock), event_topic(LedgerOp::Release));
    }
}
