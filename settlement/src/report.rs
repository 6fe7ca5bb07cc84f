//! Payout report rendered on approval
//!
//! The text form goes to the notification transport; the JSON form carries
//! the per-item breakdown for audit and export.

use chrono::{DateTime, Utc};
use ledger_core::{ActorId, CurrencyTotals, Money, TransactionType, WalletTransaction};
use parcel_engine::{BookingView, DriverRole, ParcelItem};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

/// One item in a payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLine {
    /// Booking
    pub booking_id: Uuid,
    /// Item
    pub item_id: Uuid,
    /// Tracking code
    pub tracking_code: String,
    /// Receiver name
    pub receiver_name: String,
    /// COD collected
    pub cod: Money,
    /// Delivery fee charged
    pub fee: Money,
    /// Amount paid for this item: COD net of fee, or the driver commission
    pub amount: Money,
    /// Delivery time
    pub delivered_at: Option<DateTime<Utc>>,
}

impl ReportLine {
    /// Line for a customer COD payout
    pub fn customer(view: &BookingView, item: &ParcelItem) -> Self {
        let fee = view.effective_fee(item);
        let net = Money::new(item.cod.amount() - fee.amount(), item.currency());
        Self::build(item, fee, net)
    }

    /// Line for a driver commission payout
    pub fn driver(view: &BookingView, item: &ParcelItem, actor_id: &ActorId) -> Self {
        let fee = view.effective_fee(item);
        let commission = item
            .commissions()
            .filter(|(_, c)| &c.actor_id == actor_id)
            .fold(Money::zero(item.currency()), |acc, (_, c)| {
                Money::new(acc.amount() + c.amount.amount(), acc.currency())
            });
        Self::build(item, fee, commission)
    }

    fn build(item: &ParcelItem, fee: Money, amount: Money) -> Self {
        Self {
            booking_id: item.booking_id,
            item_id: item.item_id,
            tracking_code: item.tracking_code.clone(),
            receiver_name: item.receiver.name.clone(),
            cod: item.cod,
            fee,
            amount,
            delivered_at: item.delivered_at,
        }
    }
}

/// Report of an approved (or rejected) payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReport {
    /// Ledger transaction
    pub transaction_id: Uuid,
    /// Wallet paid
    pub actor_id: ActorId,
    /// Display name
    pub actor_name: Option<String>,
    /// SETTLEMENT or WITHDRAWAL
    pub transaction_type: TransactionType,
    /// Amount of the ledger row
    pub amount: Money,
    /// Payout channel
    pub payout_channel: Option<String>,
    /// Decision time
    pub decided_at: Option<DateTime<Utc>>,
    /// Per-item breakdown
    pub lines: Vec<ReportLine>,
    /// Line amounts per currency
    pub totals: CurrencyTotals,
}

impl SettlementReport {
    /// Build from a ledger row and its breakdown
    pub fn new(transaction: &WalletTransaction, lines: Vec<ReportLine>) -> Self {
        let totals = lines.iter().map(|line| line.amount).collect();
        Self {
            transaction_id: transaction.transaction_id,
            actor_id: transaction.actor_id.clone(),
            actor_name: transaction.actor_name.clone(),
            transaction_type: transaction.transaction_type,
            amount: transaction.money(),
            payout_channel: transaction.payout_channel.clone(),
            decided_at: transaction.decided_at,
            lines,
            totals,
        }
    }

    /// Human-readable report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let title = match self.transaction_type {
            TransactionType::Settlement => "COD payout",
            TransactionType::Withdrawal => "Commission withdrawal",
            _ => "Wallet transaction",
        };

        let _ = writeln!(
            out,
            "{} {} for {}",
            title,
            self.transaction_id,
            self.actor_name.as_deref().unwrap_or(self.actor_id.as_str())
        );
        let _ = writeln!(out, "Amount: {}", self.amount);
        if let Some(channel) = &self.payout_channel {
            let _ = writeln!(out, "Channel: {}", channel);
        }
        if let Some(at) = self.decided_at {
            let _ = writeln!(out, "Approved: {}", at.format("%Y-%m-%d %H:%M UTC"));
        }

        if !self.lines.is_empty() {
            let _ = writeln!(out, "Items ({}):", self.lines.len());
            for line in &self.lines {
                let _ = writeln!(
                    out,
                    "  {} {} | COD {} | fee {} | {}",
                    line.tracking_code, line.receiver_name, line.cod, line.fee, line.amount
                );
            }
            for total in self.totals.non_zero() {
                let _ = writeln!(out, "Total {}: {}", total.currency(), total);
            }
        }

        out
    }

    /// JSON export
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Driver roles an actor holds on an item
pub fn roles_of(item: &ParcelItem, actor_id: &ActorId) -> Vec<DriverRole> {
    item.commissions()
        .filter(|(_, c)| &c.actor_id == actor_id)
        .map(|(role, _)| role)
        .collect()
}
