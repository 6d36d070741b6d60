//! Nonce allocation for the relayer wallet

use super::provider::EvmProvider;
use crate::error::LedgerResult;

use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Hands out nonces locally so concurrent submissions don't collide.
/// Synced lazily from the chain on first use and after a reset.
pub struct NonceManager {
    wallet_address: Address,
    /// Next nonce to use; `None` until synced
    next: Mutex<Option<u64>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            next: Mutex::new(None),
        }
    }

    /// Allocate the next nonce
    pub async fn allocate(&self, provider: &EvmProvider) -> LedgerResult<u64> {
        let mut next = self.next.lock().await;
        let nonce = match *next {
            Some(nonce) => nonce,
            None => {
                let on_chain = provider.get_transaction_count(self.wallet_address).await?;
                debug!("Synced nonce for chain {}: {}", provider.chain_id(), on_chain);
                on_chain
            }
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Give back a nonce whose transaction never reached the mempool
    pub async fn release(&self, nonce: u64) {
        let mut next = self.next.lock().await;
        if *next == Some(nonce + 1) {
            *next = Some(nonce);
        }
    }

    /// Forget local state; the next allocation re-reads the chain
    pub async fn reset(&self) {
        warn!("Resetting local nonce for {:?}", self.wallet_address);
        *self.next.lock().await = None;
    }
}
