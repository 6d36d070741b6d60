//! Ledger adapters - the narrow interface to each chain
//!
//! Both chains expose the same calls. Confirmation depth is applied
//! inside the adapter, so `Confirmed` always means "deep enough to act on".
//!
//! - [`EvmLedger`]: Chain A, bridge contract calls through `ethers`
//! - [`CanisterLedger`]: Chain B, bridge canister through its HTTP gateway
//! - [`MemoryLedger`]: in-process ledger for tests and simulated runs

pub mod canister;
pub mod evm;
pub mod memory;

pub use canister::CanisterLedger;
pub use evm::EvmLedger;
pub use memory::{LedgerOp, MemoryLedger};

use crate::error::LedgerResult;
use crate::request::{Amount, Chain, IdempotencyKey, RequestId, TxRef};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Observed status of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// Not yet included, or included but not yet deep enough
    Pending,
    Confirmed,
    Rejected(String),
}

/// Who escrowed how much in a confirmed lock, as recorded on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub account: String,
    pub amount: Amount,
}

/// Evidence handed to the destination chain with a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseProof {
    pub request_id: RequestId,
    pub source_chain: Chain,
    pub source_tx_ref: TxRef,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Escrow `amount` from `account`. Calls repeating `key` must not lock twice.
    async fn submit_lock(
        &self,
        account: &str,
        amount: Amount,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef>;

    /// Pay `amount` out to `account`. Calls repeating `key` must not pay twice.
    async fn submit_release(
        &self,
        account: &str,
        amount: Amount,
        proof: &ReleaseProof,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef>;

    async fn query_status(&self, tx_ref: &TxRef) -> LedgerResult<TxStatus>;

    /// Facts of the bridge lock in `tx_ref`. Permanent error if `tx_ref` is
    /// not a lock into the bridge.
    async fn query_lock(&self, tx_ref: &TxRef) -> LedgerResult<LockRecord>;

    async fn query_balance(&self, account: &str) -> LedgerResult<Amount>;

    async fn health_check(&self) -> LedgerResult<()>;
}

/// One adapter per chain
#[derive(Clone)]
pub struct LedgerSet {
    chain_a: Arc<dyn LedgerAdapter>,
    chain_b: Arc<dyn LedgerAdapter>,
}

impl LedgerSet {
    pub fn new(chain_a: Arc<dyn LedgerAdapter>, chain_b: Arc<dyn LedgerAdapter>) -> Self {
        Self { chain_a, chain_b }
    }

    pub fn get(&self, chain: Chain) -> &Arc<dyn LedgerAdapter> {
        match chain {
            Chain::A => &self.chain_a,
            Chain::B => &self.chain_b,
        }
    }
}
