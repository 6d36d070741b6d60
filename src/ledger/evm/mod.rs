//! Chain A adapter: bridge contract calls signed by the relayer wallet

mod events;
mod gas;
mod nonce;
mod provider;

pub use events::{ContractEvents, KeyedEventLog};
pub use provider::{EvmProvider, GasPrice};

use super::memory::LedgerOp;
use super::{LedgerAdapter, LockRecord, ReleaseProof, TxStatus};
use crate::config::EvmChainConfig;
use crate::error::{BridgeError, BridgeResult, LedgerError, LedgerResult};
use crate::request::{Amount, Chain, IdempotencyKey, TxRef};
use gas::GasEstimator;
use nonce::NonceManager;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const LOCK_SIGNATURE: &str = "lock(bytes32,address,uint256)";
const RELEASE_SIGNATURE: &str = "release(bytes32,address,uint256,bytes)";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EvmLedger {
    provider: Arc<EvmProvider>,
    wallet: LocalWallet,
    nonces: NonceManager,
    gas: GasEstimator,
    bridge_address: Address,
    confirmation_depth: u64,
    /// Processed keys as the contract recorded them, across restarts
    events: Box<dyn KeyedEventLog>,
    /// Hashes already broadcast by this process, by call and key
    submitted: DashMap<(LedgerOp, IdempotencyKey), H256>,
}

impl EvmLedger {
    pub fn new(config: &EvmChainConfig, confirmation_depth: u64) -> BridgeResult<Self> {
        let provider = Arc::new(EvmProvider::new(config)?);

        let key = std::env::var(&config.private_key_env).map_err(|_| {
            BridgeError::Config(format!(
                "Signing key not set: export {}",
                config.private_key_env
            ))
        })?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| BridgeError::Config(format!("Invalid private key: {}", e)))?
            .with_chain_id(config.chain_id);

        let bridge_address = Address::from_str(&config.bridge_address)
            .map_err(|e| BridgeError::Config(format!("Invalid bridge address: {}", e)))?;

        info!(
            "Chain A ledger ready: chain {} bridge {:?} wallet {:?}",
            config.chain_id,
            bridge_address,
            wallet.address()
        );

        Ok(Self {
            events: Box::new(ContractEvents::new(
                provider.clone(),
                bridge_address,
                config.key_lookback_blocks,
            )),
            provider,
            nonces: NonceManager::new(wallet.address()),
            wallet,
            gas: GasEstimator::new(config.gas_limit),
            bridge_address,
            confirmation_depth,
            submitted: DashMap::new(),
        })
    }

    /// Replace where processed keys are looked up
    pub fn with_events(mut self, events: Box<dyn KeyedEventLog>) -> Self {
        self.events = events;
        self
    }

    fn build_tx(&self, data: Vec<u8>, nonce: u64, gas_price: &GasPrice) -> TypedTransaction {
        let chain_id = self.provider.chain_id();
        let gas_limit = self.gas.gas_limit();

        match gas_price {
            GasPrice::Legacy(price) => TypedTransaction::Legacy(
                TransactionRequest::new()
                    .to(self.bridge_address)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*price)
                    .chain_id(chain_id),
            ),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .to(self.bridge_address)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(chain_id),
            ),
        }
    }

    /// Sign and broadcast one contract call
    async fn send_call(&self, op: LedgerOp, key: IdempotencyKey, data: Vec<u8>) -> LedgerResult<TxRef> {
        if let Some(hash) = self.submitted.get(&(op, key)) {
            debug!("{:?} for key {} already broadcast as {:?}", op, key, *hash);
            return Ok(tx_ref(*hash));
        }

        // A previous process may have broadcast this key before it could
        // record the hash; a second transaction would only revert.
        if let Some(hash) = self.events.find_processed(op, key.digest()).await? {
            info!("Chain A {:?} for key {} already processed in {:?}", op, key, hash);
            self.submitted.insert((op, key), hash);
            return Ok(tx_ref(hash));
        }

        let nonce = self.nonces.allocate(&self.provider).await?;
        let gas_price = match self.gas.gas_price(&self.provider).await {
            Ok(price) => price,
            Err(e) => {
                self.nonces.release(nonce).await;
                return Err(e);
            }
        };

        let tx = self.build_tx(data, nonce, &gas_price);
        let signature = match self.wallet.sign_transaction(&tx).await {
            Ok(sig) => sig,
            Err(e) => {
                self.nonces.release(nonce).await;
                return Err(LedgerError::permanent(Chain::A, format!("signing failed: {}", e)));
            }
        };
        let raw = tx.rlp_signed(&signature);
        let hash = tx.hash(&signature);

        match timeout(SEND_TIMEOUT, self.provider.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => {
                let hash = pending.tx_hash();
                info!("Chain A {:?} sent: {:?} (key {}, nonce {})", op, hash, key, nonce);
                self.submitted.insert((op, key), hash);
                Ok(tx_ref(hash))
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.contains("nonce too low") {
                    self.nonces.reset().await;
                } else {
                    self.nonces.release(nonce).await;
                }
                Err(classify_send_error(message))
            }
            Err(_) => {
                // The node may still have accepted it: keep the nonce consumed
                // and answer replays with this hash.
                warn!("Chain A {:?} send timed out (key {}, hash {:?})", op, key, hash);
                self.submitted.insert((op, key), hash);
                Err(LedgerError::transient(Chain::A, "send transaction timed out"))
            }
        }
    }
}

#[async_trait]
impl LedgerAdapter for EvmLedger {
    fn chain(&self) -> Chain {
        Chain::A
    }

    async fn submit_lock(
        &self,
        account: &str,
        amount: Amount,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef> {
        let data = encode_lock(key, parse_account(account)?, amount);
        self.send_call(LedgerOp::Lock, key, data).await
    }

    async fn submit_release(
        &self,
        account: &str,
        amount: Amount,
        proof: &ReleaseProof,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef> {
        let proof_bytes = serde_json::to_vec(proof)
            .map_err(|e| LedgerError::permanent(Chain::A, format!("proof encoding: {}", e)))?;
        let data = encode_release(key, parse_account(account)?, amount, proof_bytes);
        self.send_call(LedgerOp::Release, key, data).await
    }

    async fn query_status(&self, tx_ref: &TxRef) -> LedgerResult<TxStatus> {
        let hash = parse_hash(tx_ref)?;

        let block = match self.inclusion(hash).await? {
            Inclusion::Pending => return Ok(TxStatus::Pending),
            Inclusion::Mined(block) => block,
            Inclusion::Reverted => {
                let input = self
                    .provider
                    .get_transaction(hash)
                    .await?
                    .map(|tx| tx.input.to_vec())
                    .unwrap_or_default();

                let Some(original) = processed_elsewhere(self.events.as_ref(), hash, &input).await?
                else {
                    return Ok(TxStatus::Rejected("transaction reverted".to_string()));
                };

                info!(
                    "{} reverted on a key already processed in {:?}; following that transaction",
                    tx_ref, original
                );
                match self.inclusion(original).await? {
                    Inclusion::Mined(block) => block,
                    Inclusion::Pending => return Ok(TxStatus::Pending),
                    Inclusion::Reverted => {
                        return Ok(TxStatus::Rejected("transaction reverted".to_string()))
                    }
                }
            }
        };

        let current = self.provider.get_block_number().await?;
        let confirmations = current.saturating_sub(block);

        if confirmations >= self.confirmation_depth {
            Ok(TxStatus::Confirmed)
        } else {
            debug!(
                "{} has {} / {} confirmations on chain A",
                tx_ref, confirmations, self.confirmation_depth
            );
            Ok(TxStatus::Pending)
        }
    }

    async fn query_lock(&self, tx_ref: &TxRef) -> LedgerResult<LockRecord> {
        let hash = parse_hash(tx_ref)?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await?
            .ok_or_else(|| LedgerError::transient(Chain::A, format!("no receipt for {}", tx_ref)))?;

        let (account, amount) = events::decode_locked(&receipt.logs, self.bridge_address)?;
        if amount > U256::from(u128::MAX) {
            return Err(LedgerError::permanent(Chain::A, "lock amount exceeds u128"));
        }

        Ok(LockRecord {
            account: format!("{:?}", account),
            amount: amount.as_u128(),
        })
    }

    async fn query_balance(&self, account: &str) -> LedgerResult<Amount> {
        let balance = self.provider.get_balance(parse_account(account)?).await?;
        if balance > U256::from(u128::MAX) {
            return Err(LedgerError::permanent(Chain::A, "balance exceeds u128"));
        }
        Ok(balance.as_u128())
    }

    async fn health_check(&self) -> LedgerResult<()> {
        self.provider.health_check().await
    }
}

enum Inclusion {
    Pending,
    Reverted,
    Mined(u64),
}

impl EvmLedger {
    async fn inclusion(&self, hash: H256) -> LedgerResult<Inclusion> {
        let Some(receipt) = self.provider.get_transaction_receipt(hash).await? else {
            return Ok(Inclusion::Pending);
        };
        if receipt.status == Some(U64::zero()) {
            return Ok(Inclusion::Reverted);
        }
        Ok(match receipt.block_number {
            Some(block) => Inclusion::Mined(block.as_u64()),
            None => Inclusion::Pending,
        })
    }
}

/// The transaction that consumed the key of the reverted bridge call
/// `reverted` (with calldata `input`), when it is a different one.
async fn processed_elsewhere(
    events: &dyn KeyedEventLog,
    reverted: H256,
    input: &[u8],
) -> LedgerResult<Option<H256>> {
    let Some((op, digest)) = decode_keyed_call(input) else {
        return Ok(None);
    };
    Ok(events
        .find_processed(op, digest)
        .await?
        .filter(|original| *original != reverted))
}

/// Call kind and key digest of bridge calldata
fn decode_keyed_call(input: &[u8]) -> Option<(LedgerOp, [u8; 32])> {
    if input.len() < 36 {
        return None;
    }
    let op = if input[..4] == ethers::utils::id(LOCK_SIGNATURE) {
        LedgerOp::Lock
    } else if input[..4] == ethers::utils::id(RELEASE_SIGNATURE) {
        LedgerOp::Release
    } else {
        return None;
    };

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&input[4..36]);
    Some((op, digest))
}

fn parse_hash(tx_ref: &TxRef) -> LedgerResult<H256> {
    H256::from_str(tx_ref.as_str()).map_err(|e| {
        LedgerError::permanent(Chain::A, format!("malformed tx hash {}: {}", tx_ref, e))
    })
}

fn tx_ref(hash: H256) -> TxRef {
    TxRef::new(format!("0x{}", hex::encode(hash.as_bytes())))
}

fn parse_account(account: &str) -> LedgerResult<Address> {
    Address::from_str(account).map_err(|e| {
        LedgerError::permanent(Chain::A, format!("invalid account {}: {}", account, e))
    })
}

fn calldata(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = ethers::utils::id(signature).to_vec();
    data.extend(abi::encode(tokens));
    data
}

fn encode_lock(key: IdempotencyKey, account: Address, amount: Amount) -> Vec<u8> {
    calldata(
        LOCK_SIGNATURE,
        &[
            Token::FixedBytes(key.digest().to_vec()),
            Token::Address(account),
            Token::Uint(U256::from(amount)),
        ],
    )
}

fn encode_release(
    key: IdempotencyKey,
    account: Address,
    amount: Amount,
    proof: Vec<u8>,
) -> Vec<u8> {
    calldata(
        RELEASE_SIGNATURE,
        &[
            Token::FixedBytes(key.digest().to_vec()),
            Token::Address(account),
            Token::Uint(U256::from(amount)),
            Token::Bytes(proof),
        ],
    )
}

/// Node rejections that will fail the same way on every retry
fn classify_send_error(message: String) -> LedgerError {
    let lower = message.to_lowercase();
    let permanent = ["insufficient funds", "execution reverted", "invalid sender", "intrinsic gas too low"];

    if permanent.iter().any(|needle| lower.contains(needle)) {
        LedgerError::permanent(Chain::A, message)
    } else {
        LedgerError::transient(Chain::A, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GasPriceStrategy;
    use crate::request::RequestId;
    use events::MockKeyedEventLog;

    const KEY_ENV: &str = "CKBRIDGE_TEST_EVM_KEY";

    /// Points at a port nobody listens on: any call that reaches the node fails
    fn offline_ledger(events: MockKeyedEventLog) -> EvmLedger {
        std::env::set_var(
            KEY_ENV,
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        );
        let config = EvmChainConfig {
            chain_id: 31337,
            rpc_urls: vec!["http://127.0.0.1:9".to_string()],
            bridge_address: "0x000000000000000000000000000000000000b71d".to_string(),
            private_key_env: KEY_ENV.to_string(),
            gas_price_strategy: GasPriceStrategy::Legacy,
            max_gas_price_gwei: 100,
            gas_limit: 150_000,
            key_lookback_blocks: 1_000,
        };
        EvmLedger::new(&config, 2)
            .unwrap()
            .with_events(Box::new(events))
    }

    fn proof(request_id: RequestId) -> ReleaseProof {
        ReleaseProof {
            request_id,
            source_chain: Chain::B,
            source_tx_ref: TxRef::new("b-lock"),
        }
    }

    #[tokio::test]
    async fn test_replayed_release_returns_processed_hash() {
        let id = RequestId::new();
        let key = IdempotencyKey::new(id, 0);
        let original = H256::repeat_byte(0x11);

        let mut events = MockKeyedEventLog::new();
        events
            .expect_find_processed()
            .withf(move |op, digest| *op == LedgerOp::Release && *digest == key.digest())
            .times(1)
            .returning(move |_, _| Ok(Some(original)));
        let ledger = offline_ledger(events);

        let account = "0x00000000000000000000000000000000000000cc";
        let first = ledger.submit_release(account, 5, &proof(id), key).await.unwrap();
        let second = ledger.submit_release(account, 5, &proof(id), key).await.unwrap();

        assert_eq!(first, tx_ref(original));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_unprocessed_key_goes_to_the_node() {
        let mut events = MockKeyedEventLog::new();
        events
            .expect_find_processed()
            .times(1)
            .returning(|_, _| Ok(None));
        let ledger = offline_ledger(events);

        let id = RequestId::new();
        let err = ledger
            .submit_release(
                "0x00000000000000000000000000000000000000cc",
                5,
                &proof(id),
                IdempotencyKey::new(id, 0),
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_reverted_replay_follows_original() {
        let key = IdempotencyKey::new(RequestId::new(), 0);
        let input = encode_release(key, Address::from_low_u64_be(0xcc), 5, vec![]);
        let (original, replay) = (H256::repeat_byte(0x11), H256::repeat_byte(0x22));

        let mut events = MockKeyedEventLog::new();
        events
            .expect_find_processed()
            .withf(move |op, digest| *op == LedgerOp::Release && *digest == key.digest())
            .times(1)
            .returning(move |_, _| Ok(Some(original)));

        assert_eq!(
            processed_elsewhere(&events, replay, &input).await.unwrap(),
            Some(original)
        );
    }

    #[tokio::test]
    async fn test_reverted_call_with_unused_key_is_rejected() {
        let key = IdempotencyKey::new(RequestId::new(), 1);
        let input = encode_lock(key, Address::from_low_u64_be(0xaa), 5);
        let reverted = H256::repeat_byte(0x33);

        let mut events = MockKeyedEventLog::new();
        events
            .expect_find_processed()
            .withf(|op, _| *op == LedgerOp::Lock)
            .times(1)
            .returning(|_, _| Ok(None));
        assert_eq!(processed_elsewhere(&events, reverted, &input).await.unwrap(), None);

        // Not bridge calldata: nothing to look up
        let untouched = MockKeyedEventLog::new();
        assert_eq!(
            processed_elsewhere(&untouched, reverted, &[0xde, 0xad]).await.unwrap(),
            None
        );
    }

    #[test]
    fn test_lock_calldata_layout() {
        let key = IdempotencyKey::new(RequestId::new(), 0);
        let account = Address::from_low_u64_be(0xaaa);
        let data = encode_lock(key, account, 2_500);

        assert_eq!(&data[..4], &ethers::utils::id(LOCK_SIGNATURE));
        assert_eq!(data.len(), 4 + 3 * 32);
        assert_eq!(&data[4..36], &key.digest());
        assert_eq!(U256::from_big_endian(&data[68..100]), U256::from(2_500u64));
    }

    #[test]
    fn test_release_key_changes_calldata() {
        let id = RequestId::new();
        let account = Address::from_low_u64_be(1);
        let first = encode_release(IdempotencyKey::new(id, 0), account, 1, vec![1]);
        let second = encode_release(IdempotencyKey::new(id, 1), account, 1, vec![1]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_classify_send_error() {
        assert!(!classify_send_error("insufficient funds for gas * price + value".into()).is_transient());
        assert!(!classify_send_error("execution reverted: key used".into()).is_transient());
        assert!(classify_send_error("connection reset by peer".into()).is_transient());
    }

    #[test]
    fn test_tx_ref_round_trips_to_hash() {
        let hash = H256::repeat_byte(0xab);
        let reference = tx_ref(hash);
        assert_eq!(reference.as_str().len(), 66);
        assert_eq!(H256::from_str(reference.as_str()).unwrap(), hash);
    }

    #[test]
    fn test_parse_account() {
        assert!(parse_account("0x00000000000000000000000000000000000000b1").is_ok());
        assert!(parse_account("bridge-user").is_err());
    }
}
