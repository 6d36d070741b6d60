//! Durable storage for bridge requests
//!
//! Every mutation of a request goes through [`RequestStore::update`], an
//! optimistic compare-and-set on the request state. It is the only
//! concurrency-control point between coordinator and engine workers.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::BridgeResult;
use crate::request::{BridgeRequest, RequestId, RequestState};

use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new request; fails with `DuplicateId` if the id exists.
    async fn insert(&self, request: &BridgeRequest) -> BridgeResult<()>;

    async fn get(&self, id: RequestId) -> BridgeResult<Option<BridgeRequest>>;

    /// Replace the stored record if its state still equals `expected`.
    ///
    /// Fails with `Conflict` when the state moved underneath the caller, and
    /// with `DuplicateSettlement` when another request already settles the
    /// same `(direction, source_tx_ref)`.
    async fn update(&self, request: &BridgeRequest, expected: RequestState) -> BridgeResult<()>;

    /// Requests in `state`, oldest first
    async fn list_by_state(&self, state: RequestState) -> BridgeResult<Vec<BridgeRequest>>;

    async fn stats(&self) -> BridgeResult<RequestStats>;

    async fn health_check(&self) -> BridgeResult<()> {
        Ok(())
    }
}

/// Request counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub pending: u64,
    pub awaiting_source_confirm: u64,
    pub settling: u64,
    pub retrying: u64,
    pub settled: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl RequestStats {
    pub fn add(&mut self, state: RequestState, count: u64) {
        let slot = match state {
            RequestState::Pending => &mut self.pending,
            RequestState::AwaitingSourceConfirm => &mut self.awaiting_source_confirm,
            RequestState::Settling => &mut self.settling,
            RequestState::Retrying => &mut self.retrying,
            RequestState::Settled => &mut self.settled,
            RequestState::Failed => &mut self.failed,
            RequestState::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn get(&self, state: RequestState) -> u64 {
        match state {
            RequestState::Pending => self.pending,
            RequestState::AwaitingSourceConfirm => self.awaiting_source_confirm,
            RequestState::Settling => self.settling,
            RequestState::Retrying => self.retrying,
            RequestState::Settled => self.settled,
            RequestState::Failed => self.failed,
            RequestState::Cancelled => self.cancelled,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RequestState, u64)> + '_ {
        RequestState::ALL
            .into_iter()
            .map(move |state| (state, self.get(state)))
    }
}
