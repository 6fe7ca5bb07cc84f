//! Commission adjustment planning
//!
//! When the fee of an item changes, each driver commission on it is scaled by
//! the same proportion. The ledger only ever receives the difference:
//!
//! ```text
//! delta = (new_fee - old_fee) × old_commission / old_fee
//! ```
//!
//! A fee of 10 → 15 with a commission of 2 yields one ADJUSTMENT of +1, not a
//! fresh EARNING of 3. When the currency changes the old commission is
//! reversed in the old currency and the rescaled one credited in the new, so
//! no row ever mixes currencies.

use crate::types::{DriverRole, ParcelItem};
use ledger_core::{ActorId, Money};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Why a derived adjustment was not written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentReason {
    /// Old fee was zero, the proportion is undefined
    ZeroBaseFee,
    /// Ledger refused or failed the write
    LedgerWrite(String),
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentReason::ZeroBaseFee => f.write_str("old fee is zero"),
            AdjustmentReason::LedgerWrite(e) => write!(f, "ledger write failed: {}", e),
        }
    }
}

/// Adjustment that needs manual reconciliation
///
/// Never retried automatically; carries what an operator needs to re-run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentFailure {
    /// Booking
    pub booking_id: Uuid,
    /// Item
    pub item_id: Uuid,
    /// Driver wallet
    pub actor_id: ActorId,
    /// Driver role on the item
    pub role: DriverRole,
    /// Fee before the correction
    pub old_fee: Money,
    /// Fee after the correction
    pub new_fee: Money,
    /// Amount that should have been written, when it could be computed
    pub pending_amount: Option<Money>,
    /// Cause
    pub reason: AdjustmentReason,
}

impl fmt::Display for AdjustmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} adjustment for {} on item {} (booking {}), fee {} -> {}",
            self.role, self.actor_id, self.item_id, self.booking_id, self.old_fee, self.new_fee
        )?;
        if let Some(amount) = self.pending_amount {
            write!(f, ", pending {}", amount)?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// One ledger row to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAdjustment {
    /// Driver wallet
    pub actor_id: ActorId,
    /// Driver role on the item
    pub role: DriverRole,
    /// Signed delta
    pub amount: Money,
    /// Ledger memo
    pub memo: String,
}

/// Result of planning a fee change against an item's commissions
#[derive(Debug, Clone, Default)]
pub struct AdjustmentPlan {
    /// Rows to write
    pub adjustments: Vec<PlannedAdjustment>,
    /// Commissions that could not be rescaled
    pub failures: Vec<AdjustmentFailure>,
    /// Revised commission per role
    pub revised: Vec<(DriverRole, Money)>,
}

impl AdjustmentPlan {
    /// Check if nothing needs to happen
    pub fn is_empty(&self) -> bool {
        self.adjustments.is_empty() && self.failures.is_empty() && self.revised.is_empty()
    }
}

/// Plan the commission changes caused by a fee change
///
/// `emit_rows` is false for items that have not earned anything yet: their
/// commissions are rescaled but no ledger rows are planned.
pub fn plan(item: &ParcelItem, old_fee: Money, new_fee: Money, emit_rows: bool) -> AdjustmentPlan {
    let mut plan = AdjustmentPlan::default();
    if old_fee == new_fee {
        return plan;
    }

    for (role, commission) in item.commissions() {
        let old_commission = commission.amount;

        if old_fee.is_zero() {
            if !old_commission.is_zero() {
                plan.failures.push(AdjustmentFailure {
                    booking_id: item.booking_id,
                    item_id: item.item_id,
                    actor_id: commission.actor_id.clone(),
                    role,
                    old_fee,
                    new_fee,
                    pending_amount: None,
                    reason: AdjustmentReason::ZeroBaseFee,
                });
            }
            continue;
        }

        let memo = format!(
            "{:?} commission correction for {} (fee {} -> {})",
            role, item.tracking_code, old_fee, new_fee
        );

        if old_fee.currency() == new_fee.currency() {
            let delta = Money::new(
                (new_fee.amount() - old_fee.amount()) * old_commission.amount() / old_fee.amount(),
                new_fee.currency(),
            )
            .rounded();
            if delta.is_zero() {
                continue;
            }
            plan.revised.push((
                role,
                Money::new(old_commission.amount() + delta.amount(), new_fee.currency()),
            ));
            if emit_rows {
                plan.adjustments.push(PlannedAdjustment {
                    actor_id: commission.actor_id.clone(),
                    role,
                    amount: delta,
                    memo,
                });
            }
        } else {
            let rescaled = Money::new(
                new_fee.amount() * old_commission.amount() / old_fee.amount(),
                new_fee.currency(),
            )
            .rounded();
            plan.revised.push((role, rescaled));
            if emit_rows {
                if !old_commission.is_zero() {
                    plan.adjustments.push(PlannedAdjustment {
                        actor_id: commission.actor_id.clone(),
                        role,
                        amount: old_commission.negated(),
                        memo: format!("{} (reversal)", memo),
                    });
                }
                if !rescaled.is_zero() {
                    plan.adjustments.push(PlannedAdjustment {
                        actor_id: commission.actor_id.clone(),
                        role,
                        amount: rescaled,
                        memo,
                    });
                }
            }
        }
    }

    plan
}
