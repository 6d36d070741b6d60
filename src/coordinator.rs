//! Bridge coordinator - public entry point for deposits and withdrawals
//!
//! Validates intents and writes them to the store. Everything that touches a
//! chain happens later in the reconciliation engine, so every call here
//! returns after at most a read and one optimistic write.

use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::pricing::PricingPolicy;
use crate::request::{Amount, BridgeRequest, Chain, Direction, RequestId, RequestState, TxRef};
use crate::store::{RequestStats, RequestStore};

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::info;

lazy_static! {
    static ref CHAIN_A_ACCOUNT: Regex = Regex::new(r"^0x[0-9a-fA-F]{1,40}$").expect("valid regex");
    static ref CHAIN_B_ACCOUNT: Regex = Regex::new(r"^[A-Za-z0-9-]{1,63}$").expect("valid regex");
}

/// Check that `account` is well-formed for `chain`
pub fn validate_account(chain: Chain, account: &str) -> BridgeResult<()> {
    let pattern = match chain {
        Chain::A => &*CHAIN_A_ACCOUNT,
        Chain::B => &*CHAIN_B_ACCOUNT,
    };
    if pattern.is_match(account) {
        Ok(())
    } else {
        Err(BridgeError::InvalidRequest(format!(
            "{:?} is not a valid {} account",
            account, chain
        )))
    }
}

pub struct BridgeCoordinator {
    store: Arc<dyn RequestStore>,
    pricing: PricingPolicy,
    max_attempts: u32,
}

impl BridgeCoordinator {
    pub fn new(store: Arc<dyn RequestStore>, pricing: PricingPolicy, max_attempts: u32) -> Self {
        Self {
            store,
            pricing,
            max_attempts,
        }
    }

    /// Accept a new request; the engine submits the source lock.
    pub async fn initiate(
        &self,
        direction: Direction,
        source_account: &str,
        dest_account: Option<&str>,
        amount: Amount,
    ) -> BridgeResult<RequestId> {
        let request = self.build(direction, source_account, dest_account, amount)?;
        self.accept(request).await
    }

    /// Accept a request whose source lock the user already signed.
    pub async fn initiate_observed(
        &self,
        direction: Direction,
        source_account: &str,
        dest_account: Option<&str>,
        amount: Amount,
        source_tx_ref: TxRef,
    ) -> BridgeResult<RequestId> {
        if source_tx_ref.as_str().trim().is_empty() {
            return Err(BridgeError::InvalidRequest(
                "source_tx_ref must not be empty".to_string(),
            ));
        }

        let mut request = self.build(direction, source_account, dest_account, amount)?;
        request.source_tx_ref = Some(source_tx_ref);
        self.accept(request).await
    }

    pub async fn status(&self, id: RequestId) -> BridgeResult<BridgeRequest> {
        self.store.get(id).await?.ok_or(BridgeError::NotFound(id))
    }

    /// Cancel a request whose source lock does not exist yet. A request
    /// citing an observed lock is irrevocable from the start.
    pub async fn cancel(&self, id: RequestId) -> BridgeResult<BridgeRequest> {
        let request = self.status(id).await?;
        if request.state != RequestState::Pending || request.source_tx_ref.is_some() {
            return Err(BridgeError::InvalidState {
                id,
                state: request.state,
            });
        }

        let mut next = request.clone();
        next.state = RequestState::Cancelled;
        self.store.update(&next, RequestState::Pending).await?;

        metrics::record_transition(RequestState::Pending, RequestState::Cancelled);
        info!("Request {} cancelled", id);
        Ok(next)
    }

    /// Attach the destination account to a deposit created without one
    pub async fn link_destination(
        &self,
        id: RequestId,
        dest_account: &str,
    ) -> BridgeResult<BridgeRequest> {
        let request = self.status(id).await?;
        validate_account(request.dest_chain(), dest_account)?;

        if !matches!(
            request.state,
            RequestState::Pending | RequestState::AwaitingSourceConfirm
        ) {
            return Err(BridgeError::InvalidState {
                id,
                state: request.state,
            });
        }

        match request.dest_account.as_deref() {
            Some(existing) if existing == dest_account => return Ok(request),
            Some(existing) => {
                return Err(BridgeError::InvalidRequest(format!(
                    "request {} already releases to {}",
                    id, existing
                )))
            }
            None => {}
        }

        let mut next = request.clone();
        next.dest_account = Some(dest_account.to_string());
        self.store.update(&next, request.state).await?;

        info!("Request {} linked to destination {}", id, dest_account);
        Ok(next)
    }

    /// Operator recovery of a failed request whose funds are already locked
    pub async fn retry(&self, id: RequestId) -> BridgeResult<BridgeRequest> {
        let request = self.status(id).await?;
        if request.state != RequestState::Failed || request.release_amount.is_none() {
            return Err(BridgeError::InvalidState {
                id,
                state: request.state,
            });
        }

        let mut next = request.clone();
        next.state = RequestState::Retrying;
        next.retry_ceiling = request.attempts.saturating_add(self.max_attempts);
        next.failure_reason = None;
        next.next_attempt_at = None;
        self.store.update(&next, RequestState::Failed).await?;

        metrics::record_transition(RequestState::Failed, RequestState::Retrying);
        info!(
            "Request {} queued for operator retry (attempts {}, ceiling {})",
            id, next.attempts, next.retry_ceiling
        );
        Ok(next)
    }

    pub async fn list(&self, state: RequestState) -> BridgeResult<Vec<BridgeRequest>> {
        self.store.list_by_state(state).await
    }

    pub async fn stats(&self) -> BridgeResult<RequestStats> {
        self.store.stats().await
    }

    pub async fn health_check(&self) -> BridgeResult<()> {
        self.store.health_check().await
    }

    fn build(
        &self,
        direction: Direction,
        source_account: &str,
        dest_account: Option<&str>,
        amount: Amount,
    ) -> BridgeResult<BridgeRequest> {
        if amount == 0 {
            return Err(BridgeError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            ));
        }

        validate_account(direction.source_chain(), source_account)?;
        match dest_account {
            Some(account) => validate_account(direction.dest_chain(), account)?,
            None if direction == Direction::DepositToB => {}
            None => {
                return Err(BridgeError::InvalidRequest(format!(
                    "{} requires a destination account",
                    direction
                )))
            }
        }

        // Reject amounts the fee would swallow before anything is locked
        self.pricing.quote(direction, amount)?;

        Ok(BridgeRequest::new(
            direction,
            source_account,
            dest_account.map(str::to_string),
            amount,
            self.max_attempts,
        ))
    }

    async fn accept(&self, request: BridgeRequest) -> BridgeResult<RequestId> {
        self.store.insert(&request).await?;

        metrics::record_request_initiated(request.direction);
        info!(
            "Request {} accepted: {} {} from {}",
            request.id, request.direction, request.amount, request.source_account
        );
        Ok(request.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_amount;
    use crate::store::MemoryStore;

    fn coordinator() -> BridgeCoordinator {
        BridgeCoordinator::new(Arc::new(MemoryStore::new()), PricingPolicy::OneToOne, 3)
    }

    #[tokio::test]
    async fn test_initiate_then_status_is_pending() {
        let coordinator = coordinator();
        let amount = parse_amount("2.5").unwrap();
        let id = coordinator
            .initiate(Direction::DepositToB, "0xAAA", Some("bridge-user-1"), amount)
            .await
            .unwrap();

        let request = coordinator.status(id).await.unwrap();
        assert_eq!(request.state, RequestState::Pending);
        assert_eq!(request.amount, amount);
        assert_eq!(request.retry_ceiling, 3);
    }

    #[tokio::test]
    async fn test_rejects_zero_amount() {
        let err = coordinator()
            .initiate(Direction::DepositToB, "0xAAA", Some("bridge-user-1"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_rejects_malformed_accounts() {
        let coordinator = coordinator();
        let cases = [
            (Direction::DepositToB, "AAA", Some("bridge-user-1")),
            (Direction::DepositToB, "0xAAA", Some("bridge_user")),
            (Direction::WithdrawToA, "bridge-user-1", Some("0xZZ")),
            (Direction::WithdrawToA, "bridge-user-1", None),
        ];

        for (direction, source, dest) in cases {
            let result = coordinator.initiate(direction, source, dest, 10).await;
            assert!(
                matches!(result, Err(BridgeError::InvalidRequest(_))),
                "{:?} {} {:?} should be rejected",
                direction,
                source,
                dest
            );
        }
    }

    #[tokio::test]
    async fn test_deposit_may_defer_destination() {
        let coordinator = coordinator();
        let id = coordinator
            .initiate(Direction::DepositToB, "0xAAA", None, 10)
            .await
            .unwrap();

        let linked = coordinator.link_destination(id, "bridge-user-1").await.unwrap();
        assert_eq!(linked.dest_account.as_deref(), Some("bridge-user-1"));

        let err = coordinator
            .link_destination(id, "bridge-user-2")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let coordinator = coordinator();
        let id = coordinator
            .initiate(Direction::DepositToB, "0xAAA", Some("bridge-user-1"), 10)
            .await
            .unwrap();

        let cancelled = coordinator.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, RequestState::Cancelled);

        let err = coordinator.cancel(id).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidState { state: RequestState::Cancelled, .. }
        ));
    }

    #[tokio::test]
    async fn test_status_of_unknown_id() {
        let id = RequestId::new();
        assert!(matches!(
            coordinator().status(id).await,
            Err(BridgeError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_retry_requires_locked_funds() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = BridgeCoordinator::new(store.clone(), PricingPolicy::OneToOne, 3);

        let id = coordinator
            .initiate(Direction::DepositToB, "0xAAA", Some("bridge-user-1"), 10)
            .await
            .unwrap();
        let mut request = coordinator.status(id).await.unwrap();

        // Failed before the lock confirmed: nothing to recover
        request.state = RequestState::AwaitingSourceConfirm;
        store.update(&request, RequestState::Pending).await.unwrap();
        request.state = RequestState::Failed;
        store
            .update(&request, RequestState::AwaitingSourceConfirm)
            .await
            .unwrap();
        assert!(matches!(
            coordinator.retry(id).await,
            Err(BridgeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_raises_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = BridgeCoordinator::new(store.clone(), PricingPolicy::OneToOne, 3);

        let id = coordinator
            .initiate_observed(
                Direction::DepositToB,
                "0xAAA",
                Some("bridge-user-1"),
                10,
                TxRef::new("chain_a-tx-1"),
            )
            .await
            .unwrap();

        let mut request = coordinator.status(id).await.unwrap();
        request.attempts = 3;
        for (from, to) in [
            (RequestState::Pending, RequestState::AwaitingSourceConfirm),
            (RequestState::AwaitingSourceConfirm, RequestState::Settling),
            (RequestState::Settling, RequestState::Failed),
        ] {
            request.state = to;
            if to == RequestState::Settling {
                request.release_amount = Some(10);
            }
            store.update(&request, from).await.unwrap();
        }

        let retried = coordinator.retry(id).await.unwrap();
        assert_eq!(retried.state, RequestState::Retrying);
        assert_eq!(retried.attempts, 3);
        assert_eq!(retried.retry_ceiling, 6);
        assert!(retried.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_observed_lock_cannot_be_cancelled() {
        let coordinator = coordinator();
        let id = coordinator
            .initiate_observed(
                Direction::DepositToB,
                "0xAAA",
                Some("bridge-user-1"),
                10,
                TxRef::new("chain_a-tx-1"),
            )
            .await
            .unwrap();

        let err = coordinator.cancel(id).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidState { state: RequestState::Pending, .. }
        ));
        assert_eq!(coordinator.status(id).await.unwrap().state, RequestState::Pending);
    }

    #[tokio::test]
    async fn test_observed_lock_needs_tx_ref() {
        let err = coordinator()
            .initiate_observed(
                Direction::DepositToB,
                "0xAAA",
                Some("bridge-user-1"),
                10,
                TxRef::new(" "),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }
}
