//! Conversion between a locked source amount and the released destination amount

use crate::error::{BridgeError, BridgeResult};
use crate::request::{Amount, Direction};

use serde::Deserialize;

const BPS_DENOMINATOR: u128 = 10_000;

/// External pricing policy applied when a request starts settling.
///
/// Both sides carry the same wrapped asset, so the default is one-to-one.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PricingPolicy {
    #[default]
    OneToOne,
    /// Fee in basis points deducted from the released amount
    FlatFee { bps: u32 },
}

impl PricingPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let PricingPolicy::FlatFee { bps } = self {
            if u128::from(*bps) >= BPS_DENOMINATOR {
                anyhow::bail!("pricing fee of {} bps leaves nothing to release", bps);
            }
        }
        Ok(())
    }

    /// Amount to release on the destination chain for `amount` locked.
    ///
    /// Never exceeds `amount`; fails if nothing would be released.
    pub fn quote(&self, _direction: Direction, amount: Amount) -> BridgeResult<Amount> {
        let release = match self {
            PricingPolicy::OneToOne => amount,
            PricingPolicy::FlatFee { bps } => {
                let bps = u128::from(*bps);
                // split to stay clear of u128 overflow on large amounts
                let fee = (amount / BPS_DENOMINATOR) * bps
                    + (amount % BPS_DENOMINATOR) * bps / BPS_DENOMINATOR;
                amount.saturating_sub(fee)
            }
        };

        if release == 0 {
            return Err(BridgeError::InvalidRequest(format!(
                "amount {} does not cover the bridge fee",
                amount
            )));
        }
        Ok(release)
    }
}
