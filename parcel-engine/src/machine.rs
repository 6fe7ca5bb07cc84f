//! Parcel state machine
//!
//! The only place item status and item financial fields change.
//!
//! ```text
//! create_booking ──► PENDING ──verify_pickup──► PICKED_UP ──transfer──► IN_TRANSIT
//!                                                   │                       │
//!                                                   └──────mark_delivered───┴──► DELIVERED
//! any non-terminal ──► RETURNED | CANCELLED
//! ```
//!
//! Every mutation is one store commit for one booking. Ledger rows derived
//! from a mutation (earnings on delivery, adjustments on correction) are
//! written after the commit; a failed ledger write is reported back as a
//! degraded outcome and never rolls the item back.

use crate::adjustment::{self, AdjustmentFailure, AdjustmentReason};
use crate::fees::{FeeRequest, FeeResolver, FeeWarning};
use crate::store::{BookingStore, ItemWrite, VersionedItem};
use crate::types::{
    BookingView, Commission, CustomerId, DriverRole, FeeMode, ItemCorrection, ItemStatus,
    NewBooking, ParcelBooking, ParcelItem, SettlementFlag, SettlementParty,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::{ActorId, LedgerWriter, Money, RecordRequest, TransactionType, WalletTransaction};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Result of creating a booking
#[derive(Debug, Clone, Serialize)]
pub struct BookingReceipt {
    /// Stored booking
    pub view: BookingView,
    /// Whether any fee came from a special rate
    pub used_special_rate: bool,
    /// Fee resolution warnings
    pub warnings: Vec<FeeWarning>,
}

/// Result of an item correction
#[derive(Debug, Clone)]
pub struct EditOutcome {
    /// Committed item
    pub item: VersionedItem,
    /// Fee before the correction
    pub old_fee: Money,
    /// Fee after the correction
    pub new_fee: Money,
    /// COD before the correction
    pub old_cod: Money,
    /// COD after the correction
    pub new_cod: Money,
    /// Compensating rows written to driver wallets
    pub adjustments: Vec<WalletTransaction>,
    /// Adjustments left for manual reconciliation
    pub failures: Vec<AdjustmentFailure>,
}

impl EditOutcome {
    /// Fee delta, when the currency did not change
    pub fn fee_delta(&self) -> Option<Money> {
        self.new_fee.checked_sub(self.old_fee).ok()
    }

    /// COD delta, when the currency did not change
    pub fn cod_delta(&self) -> Option<Money> {
        self.new_cod.checked_sub(self.old_cod).ok()
    }

    /// Item updated but some ledger adjustment is missing
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Turn a degraded outcome into [`Error::PartialAdjustment`]
    pub fn into_result(self) -> Result<Self> {
        match self.failures.first() {
            Some(failure) => Err(Error::PartialAdjustment(Box::new(failure.clone()))),
            None => Ok(self),
        }
    }
}

/// Earning that could not be written on delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnrecordedEarning {
    /// Driver role
    pub role: DriverRole,
    /// Driver wallet
    pub actor_id: ActorId,
    /// Commission
    pub amount: Money,
    /// Ledger error
    pub reason: String,
}

/// Result of a delivery
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// Committed item
    pub item: VersionedItem,
    /// EARNING rows written for the drivers
    pub earnings: Vec<WalletTransaction>,
    /// Earnings left for manual reconciliation
    pub unrecorded: Vec<UnrecordedEarning>,
}

/// Booking that stopped a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    /// Booking
    pub booking_id: Uuid,
    /// Error message
    pub error: String,
}

/// Progress of a bulk operation
///
/// Bookings are processed in order; the first failure stops the loop.
/// Processed bookings stay committed and unprocessed ones are untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    /// Committed bookings
    pub processed: Vec<Uuid>,
    /// Booking that failed, if any
    pub failed: Option<BulkFailure>,
    /// Bookings never attempted
    pub unprocessed: Vec<Uuid>,
}

impl BulkReport {
    /// Check if every booking was processed
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && self.unprocessed.is_empty()
    }
}

/// Parcel lifecycle state machine
pub struct ParcelStateMachine {
    store: Arc<BookingStore>,
    fees: Arc<FeeResolver>,
    ledger: Arc<dyn LedgerWriter>,
}

impl ParcelStateMachine {
    /// Create new state machine
    pub fn new(
        store: Arc<BookingStore>,
        fees: Arc<FeeResolver>,
        ledger: Arc<dyn LedgerWriter>,
    ) -> Self {
        Self {
            store,
            fees,
            ledger,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<BookingStore> {
        &self.store
    }

    /// Fee resolver
    pub fn fees(&self) -> &Arc<FeeResolver> {
        &self.fees
    }

    /// Consistent snapshot of a booking
    pub fn view(&self, booking_id: Uuid) -> Result<BookingView> {
        self.store.view(booking_id)
    }

    /// Snapshots of every booking of a customer
    pub fn bookings_for_customer(&self, customer_id: &CustomerId) -> Vec<BookingView> {
        self.store.bookings_for_customer(customer_id)
    }

    /// Create a booking, stamping fees from the tariff
    pub fn create_booking(&self, request: NewBooking) -> Result<BookingReceipt> {
        if request.items.is_empty() {
            return Err(Error::Validation("Booking has no items".to_string()));
        }

        let booking_id = Uuid::now_v7();
        let fee_request = |item_count: usize, currency| FeeRequest {
            service_id: request.service_id.clone(),
            customer_id: request.customer_id.clone(),
            item_count,
            cod_currency: currency,
            as_of: request.booking_date,
            distance_km: request.distance_km,
        };

        let mut warnings: Vec<FeeWarning> = Vec::new();
        let mut used_special_rate = false;
        let mut note = |quote: &crate::fees::FeeQuote| {
            used_special_rate |= quote.used_special_rate;
            for warning in &quote.warnings {
                if !warnings.contains(warning) {
                    warnings.push(warning.clone());
                }
            }
        };

        let total_delivery_fee = match request.fee_mode {
            FeeMode::PerItem => None,
            FeeMode::BookingTotal => {
                let currency = request.items[0].cod.currency();
                if request.items.iter().any(|i| i.cod.currency() != currency) {
                    return Err(Error::Validation(
                        "A booking-level fee needs every item in one currency".to_string(),
                    ));
                }
                let quote = self.fees.resolve(&fee_request(request.items.len(), currency));
                note(&quote);
                Some(quote.fee)
            }
        };

        let mut items = Vec::with_capacity(request.items.len());
        for new_item in &request.items {
            let delivery_fee = match (new_item.delivery_fee, request.fee_mode) {
                (Some(fee), _) => Some(fee),
                (None, FeeMode::BookingTotal) => None,
                (None, FeeMode::PerItem) => {
                    let quote = self.fees.resolve(&fee_request(1, new_item.cod.currency()));
                    note(&quote);
                    Some(quote.fee)
                }
            };

            items.push(ParcelItem {
                item_id: Uuid::now_v7(),
                booking_id,
                tracking_code: new_item.tracking_code.trim().to_string(),
                receiver: new_item.receiver.clone(),
                cod: new_item.cod,
                delivery_fee,
                weight_kg: new_item.weight_kg,
                status: ItemStatus::Pending,
                collector: None,
                deliverer: None,
                driver_settlement: SettlementFlag::Unsettled,
                customer_settlement: SettlementFlag::Unsettled,
                picked_up_at: None,
                delivered_at: None,
            });
        }

        let booking = ParcelBooking {
            booking_id,
            customer_id: request.customer_id,
            sender_name: request.sender_name,
            pickup_address: request.pickup_address,
            booking_date: request.booking_date,
            service_id: request.service_id,
            item_ids: items.iter().map(|i| i.item_id).collect(),
            total_delivery_fee,
            created_at: Utc::now(),
        };

        let view = self.store.insert(booking, items)?;

        tracing::info!(
            booking_id = %booking_id,
            customer_id = %view.booking.customer_id,
            items = view.items.len(),
            used_special_rate,
            warnings = warnings.len(),
            "Booking created"
        );

        Ok(BookingReceipt {
            view,
            used_special_rate,
            warnings,
        })
    }

    /// VERIFY mode: confirm pickup of a PENDING item, optionally correcting it
    pub fn verify_pickup(
        &self,
        booking_id: Uuid,
        item_id: Uuid,
        correction: ItemCorrection,
        collector: Option<Commission>,
    ) -> Result<VersionedItem> {
        let current = self.load(booking_id, item_id, correction.expected_version)?;
        if current.item.status != ItemStatus::Pending {
            return Err(Error::StateConflict(format!(
                "Item {} is {}, pickup can only be verified while PENDING",
                item_id, current.item.status
            )));
        }

        let view = self.store.view(booking_id)?;
        let (mut item, plan) = Self::corrected(&view, &current.item, &correction, false)?;
        if let Some(failure) = plan.failures.first() {
            tracing::warn!(item_id = %item_id, %failure, "Commission not rescaled");
        }

        item.status = ItemStatus::PickedUp;
        item.picked_up_at = Some(Utc::now());
        if let Some(collector) = collector {
            item.collector = Some(collector);
        }

        let committed = self.commit_one(booking_id, item, current.version)?;
        tracing::info!(
            booking_id = %booking_id,
            item_id = %item_id,
            version = committed.version,
            "Pickup verified"
        );
        Ok(committed)
    }

    /// EDIT mode: correct an item without changing its status
    ///
    /// COD, fee and currency are frozen once either settlement flag is
    /// SETTLED; re-submitting the stored value is still accepted. Fee changes
    /// on a delivered item write compensating ADJUSTMENT rows.
    pub async fn edit_item(
        &self,
        booking_id: Uuid,
        item_id: Uuid,
        correction: ItemCorrection,
    ) -> Result<EditOutcome> {
        let current = self.load(booking_id, item_id, correction.expected_version)?;
        let old = &current.item;

        if old.is_settled() && correction.changes_financials(old) {
            return Err(Error::StateConflict(format!(
                "Item {} is settled; COD, fee and currency are read-only",
                item_id
            )));
        }

        let view = self.store.view(booking_id)?;
        let old_fee = view.effective_fee(old);
        let delivered = old.status == ItemStatus::Delivered;
        let (item, plan) = Self::corrected(&view, old, &correction, delivered)?;
        let new_fee = view.effective_fee(&item);
        let new_cod = item.cod;
        let related = item.related();

        let committed = self.commit_one(booking_id, item, current.version)?;
        tracing::info!(
            booking_id = %booking_id,
            item_id = %item_id,
            version = committed.version,
            old_fee = %old_fee,
            new_fee = %new_fee,
            old_cod = %old.cod,
            new_cod = %new_cod,
            "Item edited"
        );

        let mut failures = plan.failures;
        let mut adjustments = Vec::with_capacity(plan.adjustments.len());

        for planned in plan.adjustments {
            let request = RecordRequest::new(
                planned.actor_id.clone(),
                planned.amount,
                TransactionType::Adjustment,
            )
            .with_related_items(vec![related])
            .with_memo(planned.memo)
            .approved();

            match self.ledger.record(request).await {
                Ok(tx) => adjustments.push(tx),
                Err(e) => {
                    tracing::error!(
                        booking_id = %booking_id,
                        item_id = %item_id,
                        actor_id = %planned.actor_id,
                        amount = %planned.amount,
                        error = %e,
                        "Adjustment not written, needs manual reconciliation"
                    );
                    failures.push(AdjustmentFailure {
                        booking_id,
                        item_id,
                        actor_id: planned.actor_id,
                        role: planned.role,
                        old_fee,
                        new_fee,
                        pending_amount: Some(planned.amount),
                        reason: AdjustmentReason::LedgerWrite(e.to_string()),
                    });
                }
            }
        }

        for failure in failures.iter().filter(|f| f.reason == AdjustmentReason::ZeroBaseFee) {
            tracing::warn!(%failure, "Adjustment skipped, needs manual reconciliation");
        }

        Ok(EditOutcome {
            item: committed,
            old_fee,
            new_fee,
            old_cod: old.cod,
            new_cod,
            adjustments,
            failures,
        })
    }

    /// Confirm pickup of every PENDING item, booking by booking
    pub fn bulk_confirm_pickup(&self, booking_ids: &[Uuid]) -> BulkReport {
        let now = Utc::now();
        self.bulk(booking_ids, "confirm pickup", |item| {
            (item.status == ItemStatus::Pending).then(|| {
                let mut next = item.clone();
                next.status = ItemStatus::PickedUp;
                next.picked_up_at = Some(now);
                next
            })
        })
    }

    /// Move every PICKED_UP item to IN_TRANSIT, booking by booking
    pub fn bulk_transfer_to_hub(&self, booking_ids: &[Uuid]) -> BulkReport {
        self.bulk(booking_ids, "transfer to hub", |item| {
            (item.status == ItemStatus::PickedUp).then(|| {
                let mut next = item.clone();
                next.status = ItemStatus::InTransit;
                next
            })
        })
    }

    fn bulk(
        &self,
        booking_ids: &[Uuid],
        operation: &str,
        step: impl Fn(&ParcelItem) -> Option<ParcelItem>,
    ) -> BulkReport {
        let mut report = BulkReport::default();

        for (index, booking_id) in booking_ids.iter().enumerate() {
            let result = self.store.items(*booking_id).and_then(|items| {
                let writes: Vec<ItemWrite> = items
                    .iter()
                    .filter_map(|current| {
                        step(&current.item).map(|item| ItemWrite {
                            item,
                            expected_version: current.version,
                        })
                    })
                    .collect();

                if writes.is_empty() {
                    return Err(Error::StateConflict(format!(
                        "Booking {} has no item eligible to {}",
                        booking_id, operation
                    )));
                }
                self.store.commit(*booking_id, writes)
            });

            match result {
                Ok(committed) => {
                    tracing::info!(
                        booking_id = %booking_id,
                        items = committed.len(),
                        operation,
                        "Bulk step committed"
                    );
                    report.processed.push(*booking_id);
                }
                Err(e) => {
                    tracing::warn!(
                        booking_id = %booking_id,
                        operation,
                        error = %e,
                        processed = report.processed.len(),
                        "Bulk operation stopped"
                    );
                    report.failed = Some(BulkFailure {
                        booking_id: *booking_id,
                        error: e.to_string(),
                    });
                    report.unprocessed = booking_ids[index + 1..].to_vec();
                    break;
                }
            }
        }

        report
    }

    /// Deliver an item now and credit the driver commissions
    pub async fn mark_delivered(
        &self,
        booking_id: Uuid,
        item_id: Uuid,
        deliverer: Option<Commission>,
    ) -> Result<DeliveryOutcome> {
        self.mark_delivered_at(booking_id, item_id, deliverer, Utc::now())
            .await
    }

    /// Deliver an item at a given time and credit the driver commissions
    pub async fn mark_delivered_at(
        &self,
        booking_id: Uuid,
        item_id: Uuid,
        deliverer: Option<Commission>,
        delivered_at: DateTime<Utc>,
    ) -> Result<DeliveryOutcome> {
        let item = self.transition(booking_id, item_id, ItemStatus::Delivered, |item| {
            item.delivered_at = Some(delivered_at);
            if deliverer.is_some() {
                item.deliverer = deliverer;
            }
        })?;

        let related = item.item.related();
        let mut earnings = Vec::new();
        let mut unrecorded = Vec::new();

        for (role, commission) in item.item.commissions() {
            if commission.amount.is_zero() {
                continue;
            }

            let request = RecordRequest::new(
                commission.actor_id.clone(),
                commission.amount,
                TransactionType::Earning,
            )
            .with_related_items(vec![related])
            .with_memo(format!(
                "{:?} commission for {}",
                role, item.item.tracking_code
            ))
            .approved();

            match self.ledger.record(request).await {
                Ok(tx) => earnings.push(tx),
                Err(e) => {
                    tracing::error!(
                        item_id = %item_id,
                        actor_id = %commission.actor_id,
                        amount = %commission.amount,
                        error = %e,
                        "Earning not written, needs manual reconciliation"
                    );
                    unrecorded.push(UnrecordedEarning {
                        role,
                        actor_id: commission.actor_id.clone(),
                        amount: commission.amount,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(DeliveryOutcome {
            item,
            earnings,
            unrecorded,
        })
    }

    /// Send an item back to the sender
    pub fn mark_returned(&self, booking_id: Uuid, item_id: Uuid) -> Result<VersionedItem> {
        self.transition(booking_id, item_id, ItemStatus::Returned, |_| {})
    }

    /// Cancel one item
    pub fn cancel_item(&self, booking_id: Uuid, item_id: Uuid) -> Result<VersionedItem> {
        self.transition(booking_id, item_id, ItemStatus::Cancelled, |_| {})
    }

    /// Cancel every non-terminal item of a booking in one commit
    pub fn cancel_booking(&self, booking_id: Uuid) -> Result<BookingView> {
        let writes: Vec<ItemWrite> = self
            .store
            .items(booking_id)?
            .into_iter()
            .filter(|current| !current.item.status.is_terminal())
            .map(|mut current| {
                current.item.status = ItemStatus::Cancelled;
                current.into()
            })
            .collect();

        if writes.is_empty() {
            return Err(Error::StateConflict(format!(
                "Booking {} has no item left to cancel",
                booking_id
            )));
        }

        let cancelled = self.store.commit(booking_id, writes)?.len();
        tracing::info!(booking_id = %booking_id, items = cancelled, "Booking cancelled");
        self.store.view(booking_id)
    }

    /// Flag delivered items of one booking as settled for one side
    ///
    /// Idempotent: items already settled are left as they are.
    pub fn mark_settled(
        &self,
        booking_id: Uuid,
        item_ids: &[Uuid],
        party: SettlementParty,
    ) -> Result<Vec<VersionedItem>> {
        let mut writes = Vec::with_capacity(item_ids.len());
        let mut unchanged = Vec::new();

        for item_id in item_ids {
            let mut current = self.store.item(booking_id, *item_id)?;
            if current.item.status != ItemStatus::Delivered {
                return Err(Error::StateConflict(format!(
                    "Item {} is {}, only delivered items can be settled",
                    item_id, current.item.status
                )));
            }

            if current.item.settlement(party) == SettlementFlag::Settled {
                unchanged.push(current);
                continue;
            }

            match party {
                SettlementParty::Customer => {
                    current.item.customer_settlement = SettlementFlag::Settled
                }
                SettlementParty::Driver => current.item.driver_settlement = SettlementFlag::Settled,
            }
            writes.push(ItemWrite::from(current));
        }

        let mut settled = if writes.is_empty() {
            Vec::new()
        } else {
            self.store.commit(booking_id, writes)?
        };

        tracing::info!(
            booking_id = %booking_id,
            party = ?party,
            flipped = settled.len(),
            already_settled = unchanged.len(),
            "Items marked settled"
        );

        settled.extend(unchanged);
        Ok(settled)
    }

    fn load(
        &self,
        booking_id: Uuid,
        item_id: Uuid,
        expected_version: Option<u64>,
    ) -> Result<VersionedItem> {
        let current = self.store.item(booking_id, item_id)?;
        match expected_version {
            Some(expected) if expected != current.version => Err(Error::VersionConflict {
                item_id,
                expected,
                found: current.version,
            }),
            _ => Ok(current),
        }
    }

    fn transition(
        &self,
        booking_id: Uuid,
        item_id: Uuid,
        next: ItemStatus,
        update: impl FnOnce(&mut ParcelItem),
    ) -> Result<VersionedItem> {
        let current = self.store.item(booking_id, item_id)?;
        if !current.item.status.can_transition_to(next) {
            return Err(Error::StateConflict(format!(
                "Item {} cannot move from {} to {}",
                item_id, current.item.status, next
            )));
        }

        let mut item = current.item.clone();
        item.status = next;
        update(&mut item);

        let committed = self.commit_one(booking_id, item, current.version)?;
        tracing::info!(
            booking_id = %booking_id,
            item_id = %item_id,
            from = %current.item.status,
            to = %next,
            "Item status changed"
        );
        Ok(committed)
    }

    fn commit_one(
        &self,
        booking_id: Uuid,
        item: ParcelItem,
        expected_version: u64,
    ) -> Result<VersionedItem> {
        let item_id = item.item_id;
        self.store
            .commit(
                booking_id,
                vec![ItemWrite {
                    item,
                    expected_version,
                }],
            )?
            .pop()
            .ok_or(Error::ItemNotFound(item_id))
    }

    /// Apply a correction and plan the commission changes it causes
    fn corrected(
        view: &BookingView,
        old: &ParcelItem,
        correction: &ItemCorrection,
        emit_rows: bool,
    ) -> Result<(ParcelItem, adjustment::AdjustmentPlan)> {
        let mut item = old.clone();
        correction.apply_contact(&mut item);

        let (cod, fee) = correction.financials(old)?;
        item.cod = cod;
        item.delivery_fee = fee;

        let plan = adjustment::plan(
            old,
            view.effective_fee(old),
            view.effective_fee(&item),
            emit_rows,
        );
        for (role, amount) in &plan.revised {
            if let Some(commission) = item.commission_mut(*role) {
                commission.amount = *amount;
            }
        }

        Ok((item, plan))
    }
}

impl std::fmt::Debug for ParcelStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParcelStateMachine")
            .field("bookings", &self.store.booking_count())
            .finish()
    }
}
