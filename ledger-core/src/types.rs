//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Currency safety (an amount never travels without its currency)
//! - Stable JSON shapes for stored rows and report export

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Wallet owner identifier (driver or customer wallet)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Create new actor ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    /// US Dollar
    USD,
    /// Cambodian Riel
    KHR,
}

impl Currency {
    /// Every supported currency, in bucket order
    pub const ALL: [Currency; 2] = [Currency::USD, Currency::KHR];

    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::KHR => "KHR",
        }
    }

    /// Number of decimal places an amount may carry
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::USD => 2,
            // Riel circulates without sub-units
            Currency::KHR => 0,
        }
    }

    /// Round to the currency's precision, midpoints away from zero
    pub fn round(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.minor_units(), RoundingStrategy::MidpointAwayFromZero)
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::USD),
            "KHR" | "RIEL" => Ok(Currency::KHR),
            other => Err(Error::Validation(format!("Unknown currency: {}", other))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Amount tagged with its currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Create a money value (any sign)
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Zero in the given currency
    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Create a money value that must not be negative (COD, fees, commissions)
    pub fn non_negative(amount: Decimal, currency: Currency) -> Result<Self> {
        if amount < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "Amount must not be negative: {} {}",
                amount, currency
            )));
        }
        Ok(Self::new(amount, currency))
    }

    /// Amount
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Currency
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Check for zero
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Same value rounded to the currency's precision
    pub fn rounded(self) -> Self {
        Self::new(self.currency.round(self.amount), self.currency)
    }

    /// Negated value
    pub fn negated(self) -> Self {
        Self::new(-self.amount, self.currency)
    }

    /// Add two amounts of the same currency
    pub fn checked_add(self, other: Money) -> Result<Money> {
        self.ensure_same_currency(&other)?;
        Ok(Self::new(self.amount + other.amount, self.currency))
    }

    /// Subtract two amounts of the same currency
    pub fn checked_sub(self, other: Money) -> Result<Money> {
        self.ensure_same_currency(&other)?;
        Ok(Self::new(self.amount - other.amount, self.currency))
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<()> {
        if self.currency != other.currency {
            return Err(Error::CurrencyMismatch {
                expected: self.currency,
                found: other.currency,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Per-currency totals, never converted into each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyTotals {
    /// USD bucket
    pub usd: Decimal,
    /// KHR bucket
    pub khr: Decimal,
}

impl CurrencyTotals {
    /// Add an amount to its bucket
    pub fn add(&mut self, money: Money) {
        match money.currency() {
            Currency::USD => self.usd += money.amount(),
            Currency::KHR => self.khr += money.amount(),
        }
    }

    /// Bucket for a currency
    pub fn get(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::USD => self.usd,
            Currency::KHR => self.khr,
        }
    }

    /// Buckets holding a non-zero amount
    pub fn non_zero(&self) -> Vec<Money> {
        Currency::ALL
            .iter()
            .map(|c| Money::new(self.get(*c), *c))
            .filter(|m| !m.is_zero())
            .collect()
    }

    /// Check if every bucket is zero
    pub fn is_zero(&self) -> bool {
        self.usd.is_zero() && self.khr.is_zero()
    }
}

impl FromIterator<Money> for CurrencyTotals {
    fn from_iter<I: IntoIterator<Item = Money>>(iter: I) -> Self {
        let mut totals = CurrencyTotals::default();
        for money in iter {
            totals.add(money);
        }
        totals
    }
}

/// Back-reference from a transaction to a parcel item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelatedItem {
    /// Booking the item belongs to
    pub booking_id: Uuid,
    /// Item ID
    pub item_id: Uuid,
}

impl RelatedItem {
    /// Create new reference
    pub fn new(booking_id: Uuid, item_id: Uuid) -> Self {
        Self { booking_id, item_id }
    }
}

/// Kind of money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Commission accrued by a driver
    Earning,
    /// COD payout owed to a customer
    Settlement,
    /// Cash-out requested by a wallet holder
    Withdrawal,
    /// Compensating delta after a retroactive correction
    Adjustment,
}

impl TransactionType {
    /// Label used in metrics and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Earning => "EARNING",
            TransactionType::Settlement => "SETTLEMENT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::Adjustment => "ADJUSTMENT",
        }
    }

    /// Check the sign convention for this type
    pub fn accepts(&self, amount: Decimal) -> bool {
        match self {
            TransactionType::Earning => amount > Decimal::ZERO,
            TransactionType::Withdrawal => amount < Decimal::ZERO,
            TransactionType::Settlement | TransactionType::Adjustment => !amount.is_zero(),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Awaiting approval
    Pending,
    /// Counted in the balance (terminal)
    Approved,
    /// Rejected or failed (terminal)
    Failed,
}

impl TransactionStatus {
    /// Check if status is terminal
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Label used in metrics and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Approved => "APPROVED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

/// Immutable ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    /// Unique transaction ID (UUIDv7 for time-ordering)
    pub transaction_id: Uuid,

    /// Wallet owner
    pub actor_id: ActorId,

    /// Display name of the wallet owner
    pub actor_name: Option<String>,

    /// Signed amount (positive credits the actor)
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Kind of movement
    pub transaction_type: TransactionType,

    /// Approval status
    pub status: TransactionStatus,

    /// Items this row covers
    pub related_items: Vec<RelatedItem>,

    /// Free-text memo
    pub memo: String,

    /// Payout channel (bank, e-wallet, cash) for payouts
    pub payout_channel: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Set when the row leaves PENDING
    pub decided_at: Option<DateTime<Utc>>,

    /// Reason given when the row was failed
    pub failure_reason: Option<String>,
}

impl WalletTransaction {
    /// Amount as money
    pub fn money(&self) -> Money {
        Money::new(self.amount, self.currency)
    }

    /// Check if counted in balances
    pub fn is_approved(&self) -> bool {
        self.status == TransactionStatus::Approved
    }

    /// Check if this row references an item
    pub fn covers(&self, item: &RelatedItem) -> bool {
        self.related_items.contains(item)
    }
}

/// Request to append a ledger row
#[derive(Debug, Clone)]
pub struct RecordRequest {
    /// Wallet owner
    pub actor_id: ActorId,
    /// Display name
    pub actor_name: Option<String>,
    /// Signed amount and currency
    pub amount: Money,
    /// Kind of movement
    pub transaction_type: TransactionType,
    /// Items covered
    pub related_items: Vec<RelatedItem>,
    /// Memo
    pub memo: String,
    /// Payout channel
    pub payout_channel: Option<String>,
    /// Status the row is written with
    pub status: TransactionStatus,
}

impl RecordRequest {
    /// Create a pending request
    pub fn new(actor_id: ActorId, amount: Money, transaction_type: TransactionType) -> Self {
        Self {
            actor_id,
            actor_name: None,
            amount,
            transaction_type,
            related_items: Vec::new(),
            memo: String::new(),
            payout_channel: None,
            status: TransactionStatus::Pending,
        }
    }

    /// Set memo
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = memo.into();
        self
    }

    /// Set display name
    pub fn with_actor_name(mut self, name: impl Into<String>) -> Self {
        self.actor_name = Some(name.into());
        self
    }

    /// Set covered items
    pub fn with_related_items(mut self, items: Vec<RelatedItem>) -> Self {
        self.related_items = items;
        self
    }

    /// Set payout channel
    pub fn with_payout_channel(mut self, channel: impl Into<String>) -> Self {
        self.payout_channel = Some(channel.into());
        self
    }

    /// Write the row already approved (system-derived entries)
    pub fn approved(mut self) -> Self {
        self.status = TransactionStatus::Approved;
        self
    }

    /// Build the row
    pub(crate) fn into_transaction(self, now: DateTime<Utc>) -> WalletTransaction {
        let decided_at = self.status.is_final().then_some(now);
        WalletTransaction {
            transaction_id: Uuid::now_v7(),
            actor_id: self.actor_id,
            actor_name: self.actor_name,
            amount: self.amount.amount(),
            currency: self.amount.currency(),
            transaction_type: self.transaction_type,
            status: self.status,
            related_items: self.related_items,
            memo: self.memo,
            payout_channel: self.payout_channel,
            created_at: now,
            decided_at,
            failure_reason: None,
        }
    }
}

/// Cash-out request from the UI layer
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    /// Wallet owner
    pub actor_id: ActorId,
    /// Display name
    pub actor_name: String,
    /// Positive amount to withdraw
    pub amount: Money,
    /// Payout channel
    pub payout_channel: String,
    /// Memo
    pub memo: String,
    /// Items the withdrawal pays out for (driver commission settlement)
    pub related_items: Vec<RelatedItem>,
}
