//! Reconciliation engine for bridge requests
//!
//! Each pass lists the active states and takes at most one chain action per
//! request. Progress is only ever recorded through the store's optimistic
//! update, so any number of engines may run against the same store and a
//! restarted engine resumes from whatever was last persisted.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, LedgerError};
use crate::ledger::{LedgerSet, LockRecord, ReleaseProof, TxStatus};
use crate::metrics;
use crate::pricing::PricingPolicy;
use crate::request::{BridgeRequest, RequestState, TxRef};
use crate::store::RequestStore;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const DUPLICATE_SOURCE_REASON: &str = "source transaction already settled by another request";

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub scanned: usize,
    pub advanced: usize,
    pub errors: usize,
}

/// `min(base * 2^(attempts - 1), cap)`
pub fn backoff_delay(config: &BridgeConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    config
        .backoff_base()
        .saturating_mul(1u32 << exponent)
        .min(config.backoff_cap())
}

pub struct ReconciliationEngine {
    store: Arc<dyn RequestStore>,
    ledgers: LedgerSet,
    pricing: PricingPolicy,
    config: BridgeConfig,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn RequestStore>,
        ledgers: LedgerSet,
        pricing: PricingPolicy,
        config: BridgeConfig,
    ) -> Self {
        Self {
            store,
            ledgers,
            pricing,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main reconciliation loop
    pub async fn run(&self) -> BridgeResult<()> {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Reconciliation engine started (poll every {:?})",
            self.config.poll_interval()
        );

        loop {
            ticker.tick().await;

            if *self.shutdown.read().await {
                break;
            }

            match self.reconcile_once().await {
                Ok(report) => {
                    metrics::record_reconcile_pass(true);
                    if report.advanced > 0 || report.errors > 0 {
                        debug!(
                            "Pass over {} requests: {} advanced, {} errors",
                            report.scanned, report.advanced, report.errors
                        );
                    }
                }
                Err(e) => {
                    metrics::record_reconcile_pass(false);
                    error!("Reconciliation pass failed: {}", e);
                }
            }
        }

        info!("Reconciliation engine stopped");
        Ok(())
    }

    /// Stop the engine after the current pass
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Scan every active state once
    pub async fn reconcile_once(&self) -> BridgeResult<PassReport> {
        let mut report = PassReport::default();

        for state in RequestState::ACTIVE {
            for request in self.store.list_by_state(state).await? {
                report.scanned += 1;
                let id = request.id;

                match self.step(request).await {
                    Ok(true) => report.advanced += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.errors += 1;
                        warn!("Request {} not advanced: {}", id, e);
                    }
                }
            }
        }

        match self.store.stats().await {
            Ok(stats) => metrics::record_request_stats(&stats),
            Err(e) => debug!("Skipping state gauges: {}", e),
        }

        Ok(report)
    }

    /// Take the next action for one request. `Ok(true)` if anything was persisted.
    async fn step(&self, request: BridgeRequest) -> BridgeResult<bool> {
        if request.is_backing_off(Utc::now()) {
            return Ok(false);
        }

        match request.state {
            RequestState::Pending => self.start(request).await,
            RequestState::AwaitingSourceConfirm => match request.source_tx_ref.clone() {
                None => self.submit_lock(request).await,
                Some(source_tx) => self.check_source(request, source_tx).await,
            },
            RequestState::Settling => match request.dest_tx_ref.clone() {
                None => self.submit_release(request).await,
                Some(dest_tx) => self.check_release(request, dest_tx).await,
            },
            RequestState::Retrying => self.resume(request).await,
            RequestState::Settled | RequestState::Failed | RequestState::Cancelled => Ok(false),
        }
    }

    /// Pending: claim the request before touching the chain so a late
    /// cancel fails instead of racing the lock.
    async fn start(&self, request: BridgeRequest) -> BridgeResult<bool> {
        let mut next = request;
        next.state = RequestState::AwaitingSourceConfirm;
        next.awaiting_since = Some(Utc::now());

        if !self.persist(&next, RequestState::Pending).await? {
            return Ok(false);
        }
        if next.source_tx_ref.is_some() {
            return Ok(true);
        }

        self.submit_lock(next).await.map(|_| true)
    }

    async fn submit_lock(&self, request: BridgeRequest) -> BridgeResult<bool> {
        let chain = request.source_chain();
        let key = request.submission_key();

        let result = self
            .ledgers
            .get(chain)
            .submit_lock(&request.source_account, request.amount, key)
            .await;
        metrics::record_ledger_call(chain, "submit_lock", result.is_ok());

        let mut next = request;
        match result {
            Ok(tx_ref) => {
                info!("Request {} locked on {}: {} (key {})", next.id, chain, tx_ref, key);
                next.source_tx_ref = Some(tx_ref);
                next.open_submission = None;
            }
            Err(e) => self.record_failure(&mut next, e, Some(key.attempt)),
        }

        self.persist(&next, RequestState::AwaitingSourceConfirm).await
    }

    async fn check_source(&self, request: BridgeRequest, source_tx: TxRef) -> BridgeResult<bool> {
        let chain = request.source_chain();
        let status = self.ledgers.get(chain).query_status(&source_tx).await;
        metrics::record_ledger_call(chain, "query_status", status.is_ok());

        let mut next = request.clone();
        match status {
            Err(e) => self.record_failure(&mut next, e, None),
            Ok(TxStatus::Rejected(reason)) => {
                fail(&mut next, format!("source transaction rejected: {}", reason));
            }
            Ok(TxStatus::Pending) => {
                if !self.source_timed_out(&request, Utc::now()) {
                    return Ok(false);
                }
                fail(
                    &mut next,
                    format!(
                        "source transaction not confirmed within {}s",
                        self.config.source_confirm_timeout_secs
                    ),
                );
            }
            Ok(TxStatus::Confirmed) => {
                if request.dest_account.is_none() {
                    debug!(
                        "Request {} confirmed on {}; waiting for a destination account",
                        request.id, chain
                    );
                    return Ok(false);
                }

                let lock = self.ledgers.get(chain).query_lock(&source_tx).await;
                metrics::record_ledger_call(chain, "query_lock", lock.is_ok());
                match lock {
                    Err(e) => self.record_failure(&mut next, e, None),
                    Ok(lock) => self.settle_against(&mut next, lock),
                }
            }
        }

        match self.persist(&next, RequestState::AwaitingSourceConfirm).await {
            Err(BridgeError::DuplicateSettlement {
                holder,
                source_tx_ref,
            }) => {
                warn!(
                    "Request {} carries source {} already settled by {}",
                    request.id, source_tx_ref, holder
                );
                let mut failed = request;
                fail(&mut failed, DUPLICATE_SOURCE_REASON.to_string());
                self.persist(&failed, RequestState::AwaitingSourceConfirm).await
            }
            other => other,
        }
    }

    /// Move to Settling on what the source chain says was locked, not on
    /// what the request claims.
    fn settle_against(&self, next: &mut BridgeRequest, lock: LockRecord) {
        let chain = next.source_chain();
        if !chain.same_account(&lock.account, &next.source_account) {
            let reason = format!(
                "source transaction locked funds of {}, not {}",
                lock.account, next.source_account
            );
            fail(next, reason);
            return;
        }
        if lock.amount < next.amount {
            let reason = format!(
                "source transaction locked {}, request claims {}",
                lock.amount, next.amount
            );
            fail(next, reason);
            return;
        }
        if lock.amount > next.amount {
            info!(
                "Request {} claimed {} but {} was locked; settling the locked amount",
                next.id, next.amount, lock.amount
            );
            next.amount = lock.amount;
        }

        match self.pricing.quote(next.direction, lock.amount) {
            Ok(release) if release <= lock.amount => {
                next.state = RequestState::Settling;
                next.release_amount = Some(release);
                next.next_attempt_at = None;
                next.open_submission = None;
            }
            Ok(release) => {
                let reason = format!(
                    "quoted release {} exceeds locked amount {}",
                    release, lock.amount
                );
                fail(next, reason);
            }
            Err(e) => fail(next, e.to_string()),
        }
    }

    async fn submit_release(&self, request: BridgeRequest) -> BridgeResult<bool> {
        let (Some(dest_account), Some(release_amount), Some(source_tx_ref)) = (
            request.dest_account.clone(),
            request.release_amount,
            request.source_tx_ref.clone(),
        ) else {
            let mut next = request;
            fail(
                &mut next,
                "settling without destination, release amount or source transaction".to_string(),
            );
            return self.persist(&next, RequestState::Settling).await;
        };

        let chain = request.dest_chain();
        let key = request.submission_key();
        let proof = ReleaseProof {
            request_id: request.id,
            source_chain: request.source_chain(),
            source_tx_ref,
        };

        let result = self
            .ledgers
            .get(chain)
            .submit_release(&dest_account, release_amount, &proof, key)
            .await;
        metrics::record_ledger_call(chain, "submit_release", result.is_ok());

        let mut next = request;
        match result {
            Ok(tx_ref) => {
                info!(
                    "Request {} release submitted on {}: {} (key {})",
                    next.id, chain, tx_ref, key
                );
                next.dest_tx_ref = Some(tx_ref);
                next.open_submission = None;
            }
            Err(e) => self.record_failure(&mut next, e, Some(key.attempt)),
        }

        self.persist(&next, RequestState::Settling).await
    }

    async fn check_release(&self, request: BridgeRequest, dest_tx: TxRef) -> BridgeResult<bool> {
        let chain = request.dest_chain();
        let status = self.ledgers.get(chain).query_status(&dest_tx).await;
        metrics::record_ledger_call(chain, "query_status", status.is_ok());

        let mut next = request.clone();
        match status {
            Err(e) => self.record_failure(&mut next, e, None),
            Ok(TxStatus::Pending) => return Ok(false),
            Ok(TxStatus::Confirmed) => {
                next.state = RequestState::Settled;
                next.next_attempt_at = None;
            }
            Ok(TxStatus::Rejected(reason)) => {
                warn!("Request {} release {} rejected: {}", request.id, dest_tx, reason);
                next.dest_tx_ref = None;
                next.open_submission = None;
                next.attempts = next.attempts.saturating_add(1);
                next.state = RequestState::Retrying;
                next.next_attempt_at = Some(self.retry_at(next.attempts));
            }
        }

        let advanced = self.persist(&next, RequestState::Settling).await?;
        if advanced && next.state == RequestState::Settled {
            let latency = Utc::now().signed_duration_since(request.created_at);
            metrics::record_settlement_latency(
                request.direction,
                latency.num_milliseconds().max(0) as f64 / 1000.0,
            );
        }
        Ok(advanced)
    }

    /// Retrying: back to Settling while attempts remain
    async fn resume(&self, request: BridgeRequest) -> BridgeResult<bool> {
        let mut next = request;
        if next.attempts >= next.retry_ceiling {
            let reason = format!("gave up after {} attempts", next.attempts);
            fail(&mut next, reason);
        } else {
            next.state = RequestState::Settling;
            next.next_attempt_at = None;
        }

        self.persist(&next, RequestState::Retrying).await
    }

    /// Fold an adapter error into `next`.
    ///
    /// `submitted` carries the key attempt of a lock/release whose outcome
    /// is now unknown; replays reuse it.
    fn record_failure(&self, next: &mut BridgeRequest, error: LedgerError, submitted: Option<u32>) {
        if !error.is_transient() {
            next.open_submission = None;
            fail(next, error.to_string());
            return;
        }

        if let Some(attempt) = submitted {
            next.open_submission = Some(attempt);
        }
        next.attempts = next.attempts.saturating_add(1);

        if next.state == RequestState::Settling {
            warn!(
                "Request {} will retry release (attempt {}): {}",
                next.id, next.attempts, error
            );
            next.state = RequestState::Retrying;
            next.next_attempt_at = Some(self.retry_at(next.attempts));
        } else if next.attempts >= next.retry_ceiling {
            let reason = format!("gave up after {} attempts: {}", next.attempts, error);
            fail(next, reason);
        } else {
            warn!(
                "Request {} will retry on {} (attempt {}): {}",
                next.id,
                next.source_chain(),
                next.attempts,
                error
            );
            next.next_attempt_at = Some(self.retry_at(next.attempts));
        }
    }

    fn retry_at(&self, attempts: u32) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(backoff_delay(&self.config, attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now)
    }

    fn source_timed_out(&self, request: &BridgeRequest, now: DateTime<Utc>) -> bool {
        let Some(since) = request.awaiting_since else {
            return false;
        };
        match chrono::Duration::from_std(self.config.source_confirm_timeout()) {
            Ok(timeout) => now.signed_duration_since(since) >= timeout,
            Err(_) => false,
        }
    }

    /// Write `next` if the stored state is still `expected`.
    /// `Ok(false)` when another worker advanced the request first.
    async fn persist(&self, next: &BridgeRequest, expected: RequestState) -> BridgeResult<bool> {
        match self.store.update(next, expected).await {
            Ok(()) => {
                if next.state != expected {
                    metrics::record_transition(expected, next.state);
                    match next.state {
                        RequestState::Failed => error!(
                            "Request {} failed: {}",
                            next.id,
                            next.failure_reason.as_deref().unwrap_or("unknown")
                        ),
                        state => info!("Request {}: {} -> {}", next.id, expected, state),
                    }
                }
                Ok(true)
            }
            Err(BridgeError::Conflict { .. }) => {
                debug!("Request {} advanced by another worker", next.id);
                Ok(false)
            }
            Err(BridgeError::DuplicateSettlement { holder, .. }) if holder == next.id => {
                debug!("Request {} already holds its settlement claim", next.id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn fail(request: &mut BridgeRequest, reason: String) {
    request.state = RequestState::Failed;
    request.failure_reason = Some(reason);
    request.next_attempt_at = None;
}
