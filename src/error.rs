//! Error types for the bridge relayer

use crate::request::{Chain, RequestId, RequestState, TxRef};

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request {0} not found")]
    NotFound(RequestId),

    #[error("Request {id} is {state}; operation not permitted")]
    InvalidState { id: RequestId, state: RequestState },

    #[error("Request {0} already exists")]
    DuplicateId(RequestId),

    #[error("Request {id} changed concurrently (expected {expected})")]
    Conflict {
        id: RequestId,
        expected: RequestState,
    },

    #[error("Source transaction {source_tx_ref} is already settled by request {holder}")]
    DuplicateSettlement {
        holder: RequestId,
        source_tx_ref: TxRef,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: RequestState,
        to: RequestState,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Database(_) | BridgeError::Conflict { .. } => true,
            BridgeError::Ledger(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for relayer operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failure reported by a ledger adapter.
///
/// `Transient` covers network and timeout failures that are safe to retry.
/// `Permanent` means the chain rejected the call and it must not be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transient error on {chain}: {message}")]
    Transient { chain: Chain, message: String },

    #[error("Permanent error on {chain}: {message}")]
    Permanent { chain: Chain, message: String },
}

impl LedgerError {
    pub fn transient(chain: Chain, message: impl Into<String>) -> Self {
        LedgerError::Transient {
            chain,
            message: message.into(),
        }
    }

    pub fn permanent(chain: Chain, message: impl Into<String>) -> Self {
        LedgerError::Permanent {
            chain,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            LedgerError::Transient { message, .. } | LedgerError::Permanent { message, .. } => {
                message
            }
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
