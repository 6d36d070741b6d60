//! ckbridge relayer - coordination for a two-way value bridge
//!
//! Ties deposit and withdrawal requests between an EVM chain (Chain A) and a
//! canister network (Chain B) to their on-chain lock and release, settling each
//! request at most once.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod pricing;
pub mod reconcile;
pub mod request;
pub mod store;

pub use coordinator::BridgeCoordinator;
pub use error::{BridgeError, BridgeResult, LedgerError, LedgerResult};
pub use reconcile::ReconciliationEngine;
pub use request::{BridgeRequest, Direction, RequestId, RequestState};
