//! Booking and item model
//!
//! Items are stored individually (see [`crate::store`]); a booking only keeps
//! the ordered list of its item IDs. Booking status is never stored, it is
//! derived from the live items on every read.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use ledger_core::{ActorId, Currency, Money, RelatedItem};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sender (customer) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(String);

impl CustomerId {
    /// Create new customer ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Item lifecycle status
///
/// ```text
/// PENDING → PICKED_UP → IN_TRANSIT → DELIVERED
///    └──────────┴───────────┴──→ RETURNED | CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Booked, waiting for pickup
    Pending,
    /// Collected from the sender
    PickedUp,
    /// At the hub or on the way
    InTransit,
    /// Handed to the receiver, COD collected
    Delivered,
    /// Sent back to the sender
    Returned,
    /// Cancelled before delivery
    Cancelled,
}

impl ItemStatus {
    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Delivered | ItemStatus::Returned | ItemStatus::Cancelled
        )
    }

    /// Check if a transition to `next` is allowed
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        match (self, next) {
            (Pending, PickedUp) => true,
            (PickedUp, InTransit) => true,
            (PickedUp | InTransit, Delivered) => true,
            (from, Returned | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Label used in logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::PickedUp => "PICKED_UP",
            ItemStatus::InTransit => "IN_TRANSIT",
            ItemStatus::Delivered => "DELIVERED",
            ItemStatus::Returned => "RETURNED",
            ItemStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Booking status, derived from the items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// At least one item waits for pickup
    Pending,
    /// Every live item is at least picked up
    Confirmed,
    /// At least one item is in transit
    InTransit,
    /// Every live item is delivered or returned
    Completed,
    /// Every item is cancelled
    Cancelled,
}

impl BookingStatus {
    /// Coarsest status among the non-cancelled items
    pub fn derive(statuses: impl IntoIterator<Item = ItemStatus>) -> Self {
        let (mut live, mut pending, mut picked_up, mut in_transit) = (0, false, false, false);

        for status in statuses {
            match status {
                ItemStatus::Cancelled => continue,
                ItemStatus::Pending => pending = true,
                ItemStatus::PickedUp => picked_up = true,
                ItemStatus::InTransit => in_transit = true,
                ItemStatus::Delivered | ItemStatus::Returned => {}
            }
            live += 1;
        }

        if live == 0 {
            BookingStatus::Cancelled
        } else if in_transit {
            BookingStatus::InTransit
        } else if pending {
            BookingStatus::Pending
        } else if picked_up {
            BookingStatus::Confirmed
        } else {
            BookingStatus::Completed
        }
    }
}

/// Settlement flag for one side of an item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementFlag {
    /// Not yet paid out
    #[default]
    Unsettled,
    /// Paid out; financial fields are frozen
    Settled,
}

/// Side of an item being settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementParty {
    /// Sender receiving the COD net of fees
    Customer,
    /// Driver handing over collected cash / receiving commission
    Driver,
}

/// Receiver contact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receiver {
    /// Receiver name
    pub name: String,
    /// Receiver phone
    pub phone: String,
    /// Delivery address
    pub address: String,
}

/// Driver role on an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverRole {
    /// Picked the item up from the sender
    Collector,
    /// Delivered the item to the receiver
    Deliverer,
}

/// Driver assignment with the commission owed for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    /// Driver wallet
    pub actor_id: ActorId,
    /// Commission, in the item's COD currency
    pub amount: Money,
}

impl Commission {
    /// Create new commission
    pub fn new(actor_id: ActorId, amount: Money) -> Self {
        Self { actor_id, amount }
    }
}

/// One physical parcel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelItem {
    /// Item ID
    pub item_id: Uuid,
    /// Owning booking
    pub booking_id: Uuid,
    /// Unique tracking code
    pub tracking_code: String,
    /// Receiver contact
    pub receiver: Receiver,
    /// Declared COD amount; its currency is the item currency
    pub cod: Money,
    /// Per-item delivery fee; `None` when the booking carries a total fee
    pub delivery_fee: Option<Money>,
    /// Weight in kilograms
    pub weight_kg: Decimal,
    /// Lifecycle status
    pub status: ItemStatus,
    /// Collecting driver
    pub collector: Option<Commission>,
    /// Delivering driver
    pub deliverer: Option<Commission>,
    /// Driver-side settlement flag
    pub driver_settlement: SettlementFlag,
    /// Customer-side settlement flag
    pub customer_settlement: SettlementFlag,
    /// Pickup timestamp
    pub picked_up_at: Option<DateTime<Utc>>,
    /// Delivery timestamp
    pub delivered_at: Option<DateTime<Utc>>,
}

impl ParcelItem {
    /// Item currency (fee and commissions follow it)
    pub fn currency(&self) -> Currency {
        self.cod.currency()
    }

    /// Check if either side has been settled
    pub fn is_settled(&self) -> bool {
        self.driver_settlement == SettlementFlag::Settled
            || self.customer_settlement == SettlementFlag::Settled
    }

    /// Settlement flag for one side
    pub fn settlement(&self, party: SettlementParty) -> SettlementFlag {
        match party {
            SettlementParty::Customer => self.customer_settlement,
            SettlementParty::Driver => self.driver_settlement,
        }
    }

    /// Back-reference used by ledger rows
    pub fn related(&self) -> RelatedItem {
        RelatedItem::new(self.booking_id, self.item_id)
    }

    /// Assigned drivers with their commissions
    pub fn commissions(&self) -> impl Iterator<Item = (DriverRole, &Commission)> {
        [
            (DriverRole::Collector, self.collector.as_ref()),
            (DriverRole::Deliverer, self.deliverer.as_ref()),
        ]
        .into_iter()
        .filter_map(|(role, commission)| commission.map(|c| (role, c)))
    }

    /// Mutable commission slot for a role
    pub fn commission_mut(&mut self, role: DriverRole) -> &mut Option<Commission> {
        match role {
            DriverRole::Collector => &mut self.collector,
            DriverRole::Deliverer => &mut self.deliverer,
        }
    }

    /// Check field invariants
    pub fn validate(&self) -> Result<()> {
        if self.tracking_code.trim().is_empty() {
            return Err(Error::Validation("Tracking code must not be empty".to_string()));
        }

        let currency = self.currency();
        check_money("COD", self.cod, currency)?;

        if let Some(fee) = self.delivery_fee {
            check_money("Delivery fee", fee, currency)?;
        }

        for (role, commission) in self.commissions() {
            check_money(&format!("{:?} commission", role), commission.amount, currency)?;
        }

        if self.weight_kg < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "Weight must not be negative: {}",
                self.weight_kg
            )));
        }

        Ok(())
    }
}

fn check_money(label: &str, money: Money, currency: Currency) -> Result<()> {
    if money.currency() != currency {
        return Err(Error::Validation(format!(
            "{} currency {} does not match item currency {}",
            label,
            money.currency(),
            currency
        )));
    }
    if money.amount() < Decimal::ZERO {
        return Err(Error::Validation(format!(
            "{} must not be negative: {}",
            label, money
        )));
    }
    if money.amount().normalize().scale() > currency.minor_units() {
        return Err(Error::Validation(format!(
            "{} has too many decimal places: {}",
            label, money
        )));
    }
    Ok(())
}

/// One pickup request from one sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelBooking {
    /// Booking ID
    pub booking_id: Uuid,
    /// Sender
    pub customer_id: CustomerId,
    /// Sender display name
    pub sender_name: String,
    /// Pickup address
    pub pickup_address: String,
    /// Business date of the booking
    pub booking_date: NaiveDate,
    /// Service the fee was resolved for
    pub service_id: String,
    /// Items, in booking order
    pub item_ids: Vec<Uuid>,
    /// Booking-level fee, apportioned evenly across live items
    pub total_delivery_fee: Option<Money>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Consistent snapshot of a booking with its items
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingView {
    /// Booking header
    pub booking: ParcelBooking,
    /// Items, in booking order
    pub items: Vec<ParcelItem>,
    /// Derived status
    pub status: BookingStatus,
}

impl BookingView {
    /// Build a view, deriving the booking status
    pub fn new(booking: ParcelBooking, items: Vec<ParcelItem>) -> Self {
        let status = BookingStatus::derive(items.iter().map(|i| i.status));
        Self {
            booking,
            items,
            status,
        }
    }

    /// Number of non-cancelled items
    pub fn live_item_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status != ItemStatus::Cancelled)
            .count()
    }

    /// Fee charged for an item: its own fee, or a share of the booking fee
    ///
    /// Shares are cut down to the currency's precision; the last live item
    /// takes the remainder, so the shares always add up to the booking fee.
    pub fn effective_fee(&self, item: &ParcelItem) -> Money {
        if let Some(fee) = item.delivery_fee {
            return fee;
        }

        match self.booking.total_delivery_fee {
            Some(total) if total.currency() == item.currency() => {
                let count = self.live_item_count().max(1);
                let share = (total.amount() / Decimal::from(count as u64)).round_dp_with_strategy(
                    total.currency().minor_units(),
                    RoundingStrategy::ToZero,
                );

                let last_live = self
                    .items
                    .iter()
                    .rev()
                    .find(|i| i.status != ItemStatus::Cancelled)
                    .map(|i| i.item_id);
                if last_live == Some(item.item_id) {
                    let others = share * Decimal::from(count as u64 - 1);
                    Money::new(total.amount() - others, total.currency())
                } else {
                    Money::new(share, total.currency())
                }
            }
            _ => Money::zero(item.currency()),
        }
    }

    /// Find an item by ID
    pub fn item(&self, item_id: Uuid) -> Option<&ParcelItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }
}

/// How the delivery fee of a new booking is stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeMode {
    /// Each item carries its own fee
    #[default]
    PerItem,
    /// The booking carries one total fee
    BookingTotal,
}

/// Item input for a new booking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    /// Unique tracking code
    pub tracking_code: String,
    /// Receiver contact
    pub receiver: Receiver,
    /// Declared COD
    pub cod: Money,
    /// Weight in kilograms
    #[serde(default)]
    pub weight_kg: Decimal,
    /// Fee override; resolved from the tariff when absent
    #[serde(default)]
    pub delivery_fee: Option<Money>,
}

/// Input for a new booking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBooking {
    /// Sender
    pub customer_id: CustomerId,
    /// Sender display name
    pub sender_name: String,
    /// Pickup address
    pub pickup_address: String,
    /// Business date (selects the special rate)
    pub booking_date: NaiveDate,
    /// Service tariff
    pub service_id: String,
    /// Fee storage mode
    #[serde(default)]
    pub fee_mode: FeeMode,
    /// Distance for per-km pricing
    #[serde(default)]
    pub distance_km: Option<Decimal>,
    /// Items
    pub items: Vec<NewItem>,
}

/// Field changes for an item
///
/// `None` leaves a field untouched. Financial fields are `cod`,
/// `delivery_fee` and `currency`; a currency change requires a new COD
/// amount and a new fee.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemCorrection {
    /// Receiver name
    pub receiver_name: Option<String>,
    /// Receiver phone
    pub receiver_phone: Option<String>,
    /// Receiver address
    pub receiver_address: Option<String>,
    /// Weight in kilograms
    pub weight_kg: Option<Decimal>,
    /// COD amount (in the new currency if one is given)
    pub cod: Option<Decimal>,
    /// Per-item fee (in the new currency if one is given)
    pub delivery_fee: Option<Decimal>,
    /// Item currency
    pub currency: Option<Currency>,
    /// Version the caller read; checked before committing
    pub expected_version: Option<u64>,
}

impl ItemCorrection {
    /// Check if any financial field differs from the item's current value
    pub fn changes_financials(&self, item: &ParcelItem) -> bool {
        let currency_changed = self.currency.is_some_and(|c| c != item.currency());
        let cod_changed = self.cod.is_some_and(|amount| amount != item.cod.amount());
        let fee_changed = self
            .delivery_fee
            .is_some_and(|amount| item.delivery_fee.map(|f| f.amount()) != Some(amount));
        currency_changed || cod_changed || fee_changed
    }

    /// Apply the non-financial fields
    pub(crate) fn apply_contact(&self, item: &mut ParcelItem) {
        if let Some(name) = &self.receiver_name {
            item.receiver.name = name.clone();
        }
        if let Some(phone) = &self.receiver_phone {
            item.receiver.phone = phone.clone();
        }
        if let Some(address) = &self.receiver_address {
            item.receiver.address = address.clone();
        }
        if let Some(weight) = self.weight_kg {
            item.weight_kg = weight;
        }
    }

    /// New COD and fee after applying the financial fields
    pub(crate) fn financials(&self, item: &ParcelItem) -> Result<(Money, Option<Money>)> {
        let currency = self.currency.unwrap_or(item.currency());
        let currency_changed = currency != item.currency();

        let cod = match (self.cod, currency_changed) {
            (Some(amount), _) => Money::new(amount, currency),
            (None, false) => item.cod,
            (None, true) => {
                return Err(Error::Validation(
                    "Currency change requires a COD amount in the new currency".to_string(),
                ))
            }
        };

        // A booking-level fee cannot cover an item in another currency, so a
        // currency change always moves the fee onto the item
        let fee = match (self.delivery_fee, currency_changed) {
            (Some(amount), _) => Some(Money::new(amount, currency)),
            (None, true) => {
                return Err(Error::Validation(
                    "Currency change requires a delivery fee in the new currency".to_string(),
                ))
            }
            (None, false) => item.delivery_fee,
        };

        Ok((cod, fee))
    }
}
