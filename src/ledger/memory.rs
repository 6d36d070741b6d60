//! In-process ledger with balances, block rounds and scripted faults

use super::{LedgerAdapter, LockRecord, ReleaseProof, TxStatus};
use crate::error::{LedgerError, LedgerResult};
use crate::request::{Amount, Chain, IdempotencyKey, TxRef};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Ledger call kinds, used to script faults and inspect submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Lock,
    Release,
    Status,
    Balance,
}

#[derive(Debug, Clone)]
struct MemoryTx {
    op: LedgerOp,
    account: String,
    amount: Amount,
    height: u64,
    rejected: Option<String>,
}

#[derive(Default)]
struct LedgerState {
    height: u64,
    next_tx: u64,
    balances: HashMap<String, Amount>,
    escrow: Amount,
    txs: HashMap<TxRef, MemoryTx>,
    by_key: HashMap<(LedgerOp, IdempotencyKey), TxRef>,
    faults: HashMap<LedgerOp, VecDeque<LedgerError>>,
    calls: Vec<(LedgerOp, IdempotencyKey)>,
}

/// Deterministic ledger. Transactions are included at the current height and
/// confirm once `confirmation_depth` further rounds have been produced.
pub struct MemoryLedger {
    chain: Chain,
    confirmation_depth: u64,
    /// Mint whatever a lock or release is short of instead of failing
    faucet: bool,
    state: Mutex<LedgerState>,
    stopped: RwLock<bool>,
}

impl MemoryLedger {
    pub fn new(chain: Chain, confirmation_depth: u64) -> Self {
        Self {
            chain,
            confirmation_depth,
            faucet: false,
            state: Mutex::new(LedgerState::default()),
            stopped: RwLock::new(false),
        }
    }

    /// Simulated chains fund every account and the bridge reserve on demand
    pub fn with_faucet(mut self) -> Self {
        self.faucet = true;
        self
    }

    pub async fn credit(&self, account: &str, amount: Amount) {
        let mut state = self.state.lock().await;
        *state.balances.entry(account.to_string()).or_default() += amount;
    }

    /// Produce `rounds` new blocks
    pub async fn advance(&self, rounds: u64) {
        let mut state = self.state.lock().await;
        state.height += rounds;
    }

    pub async fn height(&self) -> u64 {
        self.state.lock().await.height
    }

    /// Record a lock signed outside the relayer (e.g. from the user's wallet)
    pub async fn record_external_lock(&self, account: &str, amount: Amount) -> LedgerResult<TxRef> {
        let mut state = self.state.lock().await;
        self.debit(&mut state, account, amount)?;
        Ok(self.record_tx(&mut state, LedgerOp::Lock, account, amount))
    }

    /// Mark a transaction as reverted on chain
    pub async fn reject(&self, tx_ref: &TxRef, reason: &str) {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.txs.get_mut(tx_ref) {
            tx.rejected = Some(reason.to_string());
        }
    }

    /// Fail the next call of kind `op` with `error`
    pub async fn fail_next(&self, op: LedgerOp, error: LedgerError) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(error);
    }

    /// Every lock/release call received, in order, with its idempotency key
    pub async fn calls(&self) -> Vec<(LedgerOp, IdempotencyKey)> {
        self.state.lock().await.calls.clone()
    }

    /// Number of distinct transactions of kind `op`
    pub async fn tx_count(&self, op: LedgerOp) -> usize {
        self.state
            .lock()
            .await
            .txs
            .values()
            .filter(|tx| tx.op == op)
            .count()
    }

    pub async fn escrowed(&self) -> Amount {
        self.state.lock().await.escrow
    }

    /// Produce a block every `interval` until [`MemoryLedger::stop`]
    pub async fn produce_blocks(self: Arc<Self>, interval: Duration) {
        info!("Simulated {} producing a block every {:?}", self.chain, interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if *self.stopped.read().await {
                break;
            }
            self.advance(1).await;
        }
    }

    pub async fn stop(&self) {
        *self.stopped.write().await = true;
    }

    fn take_fault(&self, state: &mut LedgerState, op: LedgerOp) -> LedgerResult<()> {
        match state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn debit(&self, state: &mut LedgerState, account: &str, amount: Amount) -> LedgerResult<()> {
        let balance = state.balances.entry(account.to_string()).or_default();
        if *balance < amount && self.faucet {
            *balance = amount;
        }
        if *balance < amount {
            return Err(LedgerError::permanent(
                self.chain,
                format!("insufficient balance: have {}, need {}", balance, amount),
            ));
        }
        *balance -= amount;
        state.escrow += amount;
        Ok(())
    }

    fn record_tx(
        &self,
        state: &mut LedgerState,
        op: LedgerOp,
        account: &str,
        amount: Amount,
    ) -> TxRef {
        state.next_tx += 1;
        let tx_ref = TxRef::new(format!("{}-tx-{}", self.chain, state.next_tx));
        let height = state.height;
        state.txs.insert(
            tx_ref.clone(),
            MemoryTx {
                op,
                account: account.to_string(),
                amount,
                height,
                rejected: None,
            },
        );
        tx_ref
    }

    /// Shared path for lock/release: fault injection, then key dedup
    fn submit(
        &self,
        state: &mut LedgerState,
        op: LedgerOp,
        account: &str,
        amount: Amount,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef> {
        state.calls.push((op, key));
        self.take_fault(state, op)?;

        if let Some(existing) = state.by_key.get(&(op, key)) {
            debug!("{} {:?} replayed for key {}", self.chain, op, key);
            return Ok(existing.clone());
        }

        match op {
            LedgerOp::Lock => self.debit(state, account, amount)?,
            _ => {
                if state.escrow < amount && self.faucet {
                    state.escrow = amount;
                }
                if state.escrow < amount {
                    return Err(LedgerError::permanent(
                        self.chain,
                        format!("escrow holds {}, release needs {}", state.escrow, amount),
                    ));
                }
                state.escrow -= amount;
                *state.balances.entry(account.to_string()).or_default() += amount;
            }
        }

        let tx_ref = self.record_tx(state, op, account, amount);
        state.by_key.insert((op, key), tx_ref.clone());
        Ok(tx_ref)
    }
}

#[async_trait]
impl LedgerAdapter for MemoryLedger {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn submit_lock(
        &self,
        account: &str,
        amount: Amount,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef> {
        let mut state = self.state.lock().await;
        self.submit(&mut state, LedgerOp::Lock, account, amount, key)
    }

    async fn submit_release(
        &self,
        account: &str,
        amount: Amount,
        _proof: &ReleaseProof,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef> {
        let mut state = self.state.lock().await;
        self.submit(&mut state, LedgerOp::Release, account, amount, key)
    }

    async fn query_status(&self, tx_ref: &TxRef) -> LedgerResult<TxStatus> {
        let mut state = self.state.lock().await;
        self.take_fault(&mut state, LedgerOp::Status)?;

        let tx = state.txs.get(tx_ref).ok_or_else(|| {
            LedgerError::permanent(self.chain, format!("unknown transaction {}", tx_ref))
        })?;

        if let Some(reason) = &tx.rejected {
            return Ok(TxStatus::Rejected(reason.clone()));
        }

        let confirmations = state.height.saturating_sub(tx.height);
        if confirmations >= self.confirmation_depth {
            Ok(TxStatus::Confirmed)
        } else {
            debug!(
                "{} has {} / {} confirmations on {} ({} of {} for {})",
                tx_ref,
                confirmations,
                self.confirmation_depth,
                self.chain,
                tx.amount,
                tx.account,
                match tx.op {
                    LedgerOp::Lock => "lock",
                    _ => "release",
                }
            );
            Ok(TxStatus::Pending)
        }
    }

    async fn query_lock(&self, tx_ref: &TxRef) -> LedgerResult<LockRecord> {
        let state = self.state.lock().await;
        match state.txs.get(tx_ref) {
            Some(tx) if tx.op == LedgerOp::Lock => Ok(LockRecord {
                account: tx.account.clone(),
                amount: tx.amount,
            }),
            Some(_) => Err(LedgerError::permanent(
                self.chain,
                format!("{} is not a bridge lock", tx_ref),
            )),
            None => Err(LedgerError::permanent(
                self.chain,
                format!("unknown transaction {}", tx_ref),
            )),
        }
    }

    async fn query_balance(&self, account: &str) -> LedgerResult<Amount> {
        let mut state = self.state.lock().await;
        self.take_fault(&mut state, LedgerOp::Balance)?;
        Ok(state.balances.get(account).copied().unwrap_or(0))
    }

    async fn health_check(&self) -> LedgerResult<()> {
        if *self.stopped.read().await {
            return Err(LedgerError::transient(self.chain, "block production stopped"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestId;

    fn proof() -> ReleaseProof {
        ReleaseProof {
            request_id: RequestId::new(),
            source_chain: Chain::A,
            source_tx_ref: TxRef::new("chain_a-tx-1"),
        }
    }

    #[tokio::test]
    async fn test_lock_confirms_after_depth() {
        let ledger = MemoryLedger::new(Chain::A, 2);
        ledger.credit("0xaaa", 100).await;

        let key = IdempotencyKey::new(RequestId::new(), 0);
        let tx = ledger.submit_lock("0xaaa", 60, key).await.unwrap();
        assert_eq!(ledger.query_status(&tx).await.unwrap(), TxStatus::Pending);

        ledger.advance(2).await;
        assert_eq!(ledger.query_status(&tx).await.unwrap(), TxStatus::Confirmed);
        assert_eq!(ledger.query_balance("0xaaa").await.unwrap(), 40);
        assert_eq!(ledger.escrowed().await, 60);
    }

    #[tokio::test]
    async fn test_repeated_key_does_not_lock_twice() {
        let ledger = MemoryLedger::new(Chain::A, 0);
        ledger.credit("0xaaa", 100).await;

        let key = IdempotencyKey::new(RequestId::new(), 0);
        let first = ledger.submit_lock("0xaaa", 60, key).await.unwrap();
        let second = ledger.submit_lock("0xaaa", 60, key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.tx_count(LedgerOp::Lock).await, 1);
        assert_eq!(ledger.query_balance("0xaaa").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_lock_without_funds_is_permanent() {
        let ledger = MemoryLedger::new(Chain::A, 0);
        let key = IdempotencyKey::new(RequestId::new(), 0);
        let err = ledger.submit_lock("0xaaa", 1, key).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_release_pays_out_of_escrow() {
        let ledger = MemoryLedger::new(Chain::B, 0);
        ledger.credit("bridge-user-1", 50).await;
        let lock_key = IdempotencyKey::new(RequestId::new(), 0);
        ledger
            .submit_lock("bridge-user-1", 50, lock_key)
            .await
            .unwrap();

        let key = IdempotencyKey::new(RequestId::new(), 0);
        ledger
            .submit_release("bridge-user-2", 50, &proof(), key)
            .await
            .unwrap();
        assert_eq!(ledger.query_balance("bridge-user-2").await.unwrap(), 50);
        assert_eq!(ledger.escrowed().await, 0);
    }

    #[tokio::test]
    async fn test_faucet_covers_shortfall() {
        let ledger = MemoryLedger::new(Chain::B, 0).with_faucet();
        let key = IdempotencyKey::new(RequestId::new(), 0);
        ledger
            .submit_release("bridge-user-1", 70, &proof(), key)
            .await
            .unwrap();
        ledger.submit_lock("bridge-user-2", 30, key).await.unwrap();

        assert_eq!(ledger.query_balance("bridge-user-1").await.unwrap(), 70);
        assert_eq!(ledger.query_balance("bridge-user-2").await.unwrap(), 0);
        assert_eq!(ledger.escrowed().await, 30);
    }

    #[tokio::test]
    async fn test_scripted_fault_fires_once() {
        let ledger = MemoryLedger::new(Chain::B, 0);
        ledger
            .fail_next(LedgerOp::Balance, LedgerError::transient(Chain::B, "timeout"))
            .await;

        assert!(ledger.query_balance("x").await.unwrap_err().is_transient());
        assert_eq!(ledger.query_balance("x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_lock_reports_lock_facts() {
        let ledger = MemoryLedger::new(Chain::A, 0).with_faucet();
        let lock = ledger.record_external_lock("0xaaa", 10).await.unwrap();
        assert_eq!(
            ledger.query_lock(&lock).await.unwrap(),
            LockRecord {
                account: "0xaaa".to_string(),
                amount: 10,
            }
        );

        let key = IdempotencyKey::new(RequestId::new(), 0);
        let release = ledger
            .submit_release("0xbbb", 5, &proof(), key)
            .await
            .unwrap();
        assert!(!ledger.query_lock(&release).await.unwrap_err().is_transient());
        assert!(ledger
            .query_lock(&TxRef::new("chain_a-tx-99"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stopped_ledger_is_unhealthy() {
        let ledger = MemoryLedger::new(Chain::B, 0);
        assert!(ledger.health_check().await.is_ok());
        ledger.stop().await;
        assert!(ledger.health_check().await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_rejected_tx_reports_reason() {
        let ledger = MemoryLedger::new(Chain::A, 0);
        ledger.credit("0xaaa", 5).await;
        let tx = ledger.record_external_lock("0xaaa", 5).await.unwrap();
        ledger.reject(&tx, "reverted").await;
        assert_eq!(
            ledger.query_status(&tx).await.unwrap(),
            TxStatus::Rejected("reverted".to_string())
        );
    }
}
