//! Payout approval workflow
//!
//! Payout rows are written PENDING. A human approves or rejects them here;
//! approval is the only point where settlement flags flip and where the
//! payout notification is enqueued.

use crate::{
    report::{roles_of, ReportLine, SettlementReport},
    Error, Result,
};
use ledger_core::{
    Money, RelatedItem, TransactionStatus, TransactionType, WalletLedger, WalletTransaction,
    WithdrawalRequest,
};
use message_bus::{Notification, NotificationKind, Outbox};
use parcel_engine::{
    BookingView, ItemStatus, ParcelStateMachine, SettlementFlag, SettlementParty, VersionedItem,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Result of approving a payout
#[derive(Debug, Clone)]
pub struct PayoutApproval {
    /// Approved ledger row
    pub transaction: WalletTransaction,
    /// Items flagged SETTLED (or already settled)
    pub settled_items: Vec<VersionedItem>,
    /// Rendered report
    pub report: SettlementReport,
    /// Whether a notification was enqueued (false when already queued)
    pub notified: bool,
}

/// Payout workflow
#[derive(Debug)]
pub struct PayoutWorkflow {
    machine: Arc<ParcelStateMachine>,
    ledger: Arc<WalletLedger>,
    outbox: Arc<Outbox>,
}

impl PayoutWorkflow {
    /// Create new workflow
    pub fn new(
        machine: Arc<ParcelStateMachine>,
        ledger: Arc<WalletLedger>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            machine,
            ledger,
            outbox,
        }
    }

    /// Request a cash-out; returns the PENDING transaction ID
    ///
    /// Related items, when given, must be delivered items on which the actor
    /// holds a commission and whose driver side is still unsettled.
    pub async fn request_withdrawal(&self, request: WithdrawalRequest) -> Result<Uuid> {
        for related in &request.related_items {
            let current = self.machine.store().item(related.booking_id, related.item_id)?;
            let item = &current.item;
            if item.status != ItemStatus::Delivered {
                return Err(Error::Validation(format!(
                    "Item {} is {}, only delivered items can be paid out",
                    item.item_id, item.status
                )));
            }
            if roles_of(item, &request.actor_id).is_empty() {
                return Err(Error::Validation(format!(
                    "{} holds no commission on item {}",
                    request.actor_id, item.item_id
                )));
            }
            if item.currency() != request.amount.currency() {
                return Err(Error::Validation(format!(
                    "Item {} is paid in {}, the withdrawal is in {}",
                    item.item_id,
                    item.currency(),
                    request.amount.currency()
                )));
            }
            if item.settlement(SettlementParty::Driver) == SettlementFlag::Settled {
                return Err(Error::Validation(format!(
                    "Item {} is already settled for the driver",
                    item.item_id
                )));
            }
        }

        let actor_id = request.actor_id.clone();
        let amount = request.amount;
        let transaction_id = self.ledger.request_withdrawal(request).await?;
        tracing::info!(
            transaction_id = %transaction_id,
            actor_id = %actor_id,
            amount = %amount,
            "Withdrawal requested"
        );
        Ok(transaction_id)
    }

    /// Approve a PENDING payout row
    ///
    /// SETTLEMENT rows flip the customer flags of their items; WITHDRAWAL rows
    /// flip the driver flags. Only items in the row's currency are flipped.
    /// A SETTLEMENT row whose items no longer net to its amount (an item was
    /// corrected or settled meanwhile) is refused with
    /// [`Error::OutdatedPayout`]; reject it and settle again.
    ///
    /// The report is enqueued keyed by the transaction ID, so a repeated
    /// enqueue is a no-op.
    pub async fn approve(&self, transaction_id: Uuid) -> Result<PayoutApproval> {
        let pending = self.ledger.transaction(transaction_id)?;
        let (party, kind) = Self::payout_kind(&pending)?;
        let covered = self.covered_items(&pending);
        let views = self.views(&covered)?;
        if party == SettlementParty::Customer {
            Self::ensure_current(&pending, &covered, &views)?;
        }

        let transaction = self.ledger.approve(transaction_id).await?;

        let mut settled_items = Vec::with_capacity(covered.len());
        for (booking_id, item_ids) in group_by_booking(&covered) {
            settled_items.extend(self.machine.mark_settled(booking_id, &item_ids, party)?);
        }

        let report = Self::report(&transaction, &covered, party, &views);
        let notified = match serde_json::to_value(&report) {
            Ok(payload) => self.notify(
                Notification::new(kind, transaction_id.to_string(), payload)
                    .with_text(report.render())
                    .with_header("actor_id", transaction.actor_id.as_str()),
            ),
            Err(e) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Payout report not serializable, notification skipped"
                );
                false
            }
        };

        tracing::info!(
            transaction_id = %transaction_id,
            actor_id = %transaction.actor_id,
            amount = %transaction.money(),
            items = settled_items.len(),
            "Payout approved"
        );

        Ok(PayoutApproval {
            transaction,
            settled_items,
            report,
            notified,
        })
    }

    /// Reject a PENDING payout row; settlement flags are left alone
    pub async fn reject(
        &self,
        transaction_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<WalletTransaction> {
        let pending = self.ledger.transaction(transaction_id)?;
        Self::payout_kind(&pending)?;

        let reason = reason.into();
        let transaction = self.ledger.reject(transaction_id, reason.clone()).await?;

        self.notify(
            Notification::new(
                NotificationKind::PayoutRejected,
                transaction_id.to_string(),
                json!({
                    "transaction_id": transaction_id,
                    "actor_id": transaction.actor_id,
                    "amount": transaction.money(),
                    "transaction_type": transaction.transaction_type,
                    "reason": reason,
                }),
            )
            .with_text(format!(
                "Payout {} of {} rejected: {}",
                transaction_id,
                transaction.money(),
                reason
            ))
            .with_header("actor_id", transaction.actor_id.as_str()),
        );

        tracing::info!(
            transaction_id = %transaction_id,
            actor_id = %transaction.actor_id,
            reason = %reason,
            "Payout rejected"
        );
        Ok(transaction)
    }

    fn payout_kind(tx: &WalletTransaction) -> Result<(SettlementParty, NotificationKind)> {
        if tx.status != TransactionStatus::Pending {
            return Err(ledger_core::Error::StateConflict(format!(
                "Transaction {} is already {}",
                tx.transaction_id,
                tx.status.as_str()
            ))
            .into());
        }

        match tx.transaction_type {
            TransactionType::Settlement => {
                Ok((SettlementParty::Customer, NotificationKind::SettlementApproved))
            }
            TransactionType::Withdrawal => {
                Ok((SettlementParty::Driver, NotificationKind::WithdrawalApproved))
            }
            other => Err(Error::Validation(format!(
                "{} rows are not payouts",
                other
            ))),
        }
    }

    /// Related items in the row's currency; unknown items are kept so the
    /// view lookup reports them
    fn covered_items(&self, tx: &WalletTransaction) -> Vec<RelatedItem> {
        tx.related_items
            .iter()
            .filter(|r| {
                self.machine
                    .store()
                    .item(r.booking_id, r.item_id)
                    .map(|current| current.item.currency() == tx.currency)
                    .unwrap_or(true)
            })
            .copied()
            .collect()
    }

    fn ensure_current(
        tx: &WalletTransaction,
        covered: &[RelatedItem],
        views: &BTreeMap<Uuid, BookingView>,
    ) -> Result<()> {
        let mut current = Decimal::ZERO;
        for r in covered {
            let Some(view) = views.get(&r.booking_id) else {
                continue;
            };
            match view.item(r.item_id) {
                Some(item) if item.customer_settlement == SettlementFlag::Unsettled => {
                    current += ReportLine::customer(view, item).amount.amount();
                }
                _ => {}
            }
        }

        if current != tx.amount {
            tracing::warn!(
                transaction_id = %tx.transaction_id,
                requested = %tx.amount,
                current = %current,
                "Settlement row no longer matches its items"
            );
            return Err(Error::OutdatedPayout {
                transaction_id: tx.transaction_id,
                requested: tx.money(),
                current: Money::new(current, tx.currency),
            });
        }
        Ok(())
    }

    fn views(&self, related: &[RelatedItem]) -> Result<BTreeMap<Uuid, BookingView>> {
        let mut views = BTreeMap::new();
        for booking_id in related.iter().map(|r| r.booking_id) {
            if !views.contains_key(&booking_id) {
                views.insert(booking_id, self.machine.view(booking_id)?);
            }
        }

        for r in related {
            let delivered = views
                .get(&r.booking_id)
                .and_then(|view| view.item(r.item_id))
                .map(|item| item.status == ItemStatus::Delivered);
            match delivered {
                Some(true) => {}
                Some(false) => {
                    return Err(Error::Validation(format!(
                        "Item {} is no longer delivered",
                        r.item_id
                    )))
                }
                None => return Err(parcel_engine::Error::ItemNotFound(r.item_id).into()),
            }
        }

        Ok(views)
    }

    fn report(
        tx: &WalletTransaction,
        covered: &[RelatedItem],
        party: SettlementParty,
        views: &BTreeMap<Uuid, BookingView>,
    ) -> SettlementReport {
        let lines = covered
            .iter()
            .filter_map(|r| {
                let view = views.get(&r.booking_id)?;
                let item = view.item(r.item_id)?;
                Some(match party {
                    SettlementParty::Customer => ReportLine::customer(view, item),
                    SettlementParty::Driver => ReportLine::driver(view, item, &tx.actor_id),
                })
            })
            .collect();
        SettlementReport::new(tx, lines)
    }

    fn notify(&self, notification: Notification) -> bool {
        let key = notification.dedupe_key.clone();
        let enqueued = self.outbox.enqueue(notification);
        if !enqueued {
            tracing::warn!(dedupe_key = %key, "Payout notification already queued");
        }
        enqueued
    }
}

fn group_by_booking(related: &[RelatedItem]) -> BTreeMap<Uuid, Vec<Uuid>> {
    let mut grouped: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for r in related {
        grouped.entry(r.booking_id).or_default().push(r.item_id);
    }
    grouped
}
