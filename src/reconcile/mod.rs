//! Reconciliation module
//!
//! Drives every active request through its lifecycle by polling the ledgers.

mod engine;

pub use engine::{backoff_delay, PassReport, ReconciliationEngine};
