//! In-memory request store

use super::{RequestStats, RequestStore};
use crate::error::{BridgeError, BridgeResult};
use crate::request::{BridgeRequest, Direction, RequestId, RequestState, TxRef};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// `DashMap`-backed store. Not durable across restarts; the engine's restart
/// semantics are the same as with [`super::PgStore`] while the process lives.
#[derive(Default)]
pub struct MemoryStore {
    requests: DashMap<RequestId, BridgeRequest>,
    /// Settlement claims: (direction, source tx) -> request holding it
    settlements: DashMap<(Direction, TxRef), RequestId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, request: &BridgeRequest) -> BridgeResult<()> {
        match self.requests.entry(request.id) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateId(request.id)),
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: RequestId) -> BridgeResult<Option<BridgeRequest>> {
        Ok(self.requests.get(&id).map(|r| r.value().clone()))
    }

    async fn update(&self, request: &BridgeRequest, expected: RequestState) -> BridgeResult<()> {
        if !expected.can_transition_to(request.state) {
            return Err(BridgeError::InvalidStateTransition {
                from: expected,
                to: request.state,
            });
        }

        // Lock order: request entry, then settlement claim.
        let mut stored = self
            .requests
            .get_mut(&request.id)
            .ok_or(BridgeError::NotFound(request.id))?;

        if stored.state != expected {
            return Err(BridgeError::Conflict {
                id: request.id,
                expected,
            });
        }

        if let Some(key) = request.settlement_key() {
            match self.settlements.entry(key) {
                Entry::Occupied(claim) if *claim.get() != request.id => {
                    return Err(BridgeError::DuplicateSettlement {
                        holder: *claim.get(),
                        source_tx_ref: claim.key().1.clone(),
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(request.id);
                }
            }
        }

        let mut next = request.clone();
        next.updated_at = Utc::now();
        *stored = next;
        Ok(())
    }

    async fn list_by_state(&self, state: RequestState) -> BridgeResult<Vec<BridgeRequest>> {
        let mut requests: Vec<_> = self
            .requests
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.value().clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn stats(&self) -> BridgeResult<RequestStats> {
        let mut stats = RequestStats::default();
        for entry in self.requests.iter() {
            stats.add(entry.state, 1);
        }
        Ok(stats)
    }
}
