//! Bridge request model
//!
//! A [`BridgeRequest`] is the unit of work that moves value from one chain to
//! the other. Its lifecycle is the state machine in [`RequestState`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Value in the smallest unit of the chain (wei for Chain A).
pub type Amount = u128;

/// Decimals used when parsing human-entered amounts.
pub const AMOUNT_DECIMALS: u32 = 18;

/// Unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The two chains joined by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    /// Account-based smart-contract chain
    #[serde(rename = "chain_a")]
    A,
    /// Canister-based network
    #[serde(rename = "chain_b")]
    B,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::A => "chain_a",
            Chain::B => "chain_b",
        }
    }

    /// Whether two spellings name the same account on this chain.
    ///
    /// Chain A addresses are hex numbers: case and leading zeros do not matter.
    pub fn same_account(&self, a: &str, b: &str) -> bool {
        match self {
            Chain::A => {
                let normalize = |raw: &str| {
                    let digits = raw.strip_prefix("0x").unwrap_or(raw);
                    digits.trim_start_matches('0').to_ascii_lowercase()
                };
                normalize(a) == normalize(b)
            }
            Chain::B => a == b,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Lock on Chain A, release on Chain B
    DepositToB,
    /// Lock on Chain B, release on Chain A
    WithdrawToA,
}

impl Direction {
    pub fn source_chain(&self) -> Chain {
        match self {
            Direction::DepositToB => Chain::A,
            Direction::WithdrawToA => Chain::B,
        }
    }

    pub fn dest_chain(&self) -> Chain {
        match self {
            Direction::DepositToB => Chain::B,
            Direction::WithdrawToA => Chain::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::DepositToB => "deposit_to_b",
            Direction::WithdrawToA => "withdraw_to_a",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit_to_b" => Ok(Direction::DepositToB),
            "withdraw_to_a" => Ok(Direction::WithdrawToA),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    AwaitingSourceConfirm,
    Settling,
    Retrying,
    Settled,
    Failed,
    Cancelled,
}

impl RequestState {
    pub const ALL: [RequestState; 7] = [
        RequestState::Pending,
        RequestState::AwaitingSourceConfirm,
        RequestState::Settling,
        RequestState::Retrying,
        RequestState::Settled,
        RequestState::Failed,
        RequestState::Cancelled,
    ];

    /// States the reconciliation engine scans on every pass
    pub const ACTIVE: [RequestState; 4] = [
        RequestState::Pending,
        RequestState::AwaitingSourceConfirm,
        RequestState::Settling,
        RequestState::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::AwaitingSourceConfirm => "awaiting_source_confirm",
            RequestState::Settling => "settling",
            RequestState::Retrying => "retrying",
            RequestState::Settled => "settled",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }

    /// `Failed` counts as terminal: only an operator moves it again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Settled | RequestState::Failed | RequestState::Cancelled
        )
    }

    /// States that own the settlement slot of their source transaction
    pub fn holds_settlement(&self) -> bool {
        matches!(self, RequestState::Settling | RequestState::Settled)
    }

    /// Whether a stored record in `self` may be overwritten with `next`.
    ///
    /// Non-terminal states may be rewritten in place to record tx refs,
    /// attempts and backoff.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;

        if *self == next {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Pending, AwaitingSourceConfirm)
                | (Pending, Cancelled)
                | (AwaitingSourceConfirm, Settling)
                | (AwaitingSourceConfirm, Failed)
                | (Settling, Settled)
                | (Settling, Retrying)
                | (Settling, Failed)
                | (Retrying, Settling)
                | (Retrying, Failed)
                | (Failed, Retrying)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown request state: {}", s))
    }
}

/// Opaque reference to a transaction on either chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(String);

impl TxRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deduplication key for chain-mutating calls: `(request id, attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub request_id: RequestId,
    pub attempt: u32,
}

impl IdempotencyKey {
    pub fn new(request_id: RequestId, attempt: u32) -> Self {
        Self {
            request_id,
            attempt,
        }
    }

    /// keccak256(uuid bytes || attempt as big-endian u32), for on-chain use
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(self.request_id.as_uuid().as_bytes());
        hasher.update(self.attempt.to_be_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.request_id, self.attempt)
    }
}

/// A deposit or withdrawal moving through the bridge
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRequest {
    pub id: RequestId,
    pub direction: Direction,
    pub source_account: String,
    /// Required before settlement; deposits may link it later.
    pub dest_account: Option<String>,
    pub amount: Amount,
    /// Quoted destination amount, fixed when the request starts settling
    pub release_amount: Option<Amount>,
    pub state: RequestState,
    pub source_tx_ref: Option<TxRef>,
    pub dest_tx_ref: Option<TxRef>,
    pub attempts: u32,
    /// Retrying stops once `attempts` reaches this value
    pub retry_ceiling: u32,
    /// Attempt number of a submission whose outcome is unknown. Replays reuse
    /// it so the adapter can deduplicate a call that actually landed.
    pub open_submission: Option<u32>,
    pub failure_reason: Option<String>,
    pub awaiting_since: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BridgeRequest {
    pub fn new(
        direction: Direction,
        source_account: impl Into<String>,
        dest_account: Option<String>,
        amount: Amount,
        retry_ceiling: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            direction,
            source_account: source_account.into(),
            dest_account,
            amount,
            release_amount: None,
            state: RequestState::Pending,
            source_tx_ref: None,
            dest_tx_ref: None,
            attempts: 0,
            retry_ceiling,
            open_submission: None,
            failure_reason: None,
            awaiting_since: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source_chain(&self) -> Chain {
        self.direction.source_chain()
    }

    pub fn dest_chain(&self) -> Chain {
        self.direction.dest_chain()
    }

    /// Key for the next chain-mutating call on behalf of this request
    pub fn submission_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.id, self.open_submission.unwrap_or(self.attempts))
    }

    /// `(direction, source tx)` pair that may settle only once
    pub fn settlement_key(&self) -> Option<(Direction, TxRef)> {
        if !self.state.holds_settlement() {
            return None;
        }
        self.source_tx_ref
            .as_ref()
            .map(|tx_ref| (self.direction, tx_ref.clone()))
    }

    /// Whether the engine should leave this request alone until `now`
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(false, |at| at > now)
    }
}

/// Parse a decimal amount ("2.5") into the smallest unit using 18 decimals.
pub fn parse_amount(input: &str) -> Result<Amount, String> {
    let value = ethers::utils::parse_units(input.trim(), AMOUNT_DECIMALS)
        .map_err(|e| format!("invalid amount {:?}: {}", input, e))?;
    let value: ethers::types::U256 = value.into();

    if value > ethers::types::U256::from(u128::MAX) {
        return Err(format!("amount {:?} out of range", input));
    }
    Ok(value.as_u128())
}
