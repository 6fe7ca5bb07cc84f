//! Settlement aggregation
//!
//! What a customer is owed is never stored. It is computed on demand from
//! live item state:
//!
//! ```text
//! owed = Σ (cod − apportioned_fee)   over DELIVERED ∧ customer UNSETTLED items
//! ```
//!
//! kept in separate USD and KHR buckets. [`SettlementAggregator::settle`]
//! turns the current buckets into PENDING SETTLEMENT rows; items only become
//! SETTLED when a human approves the payout.

use crate::{
    directory::{WalletDirectory, WalletLink},
    report::ReportLine,
    Error, Result,
};
use ledger_core::{
    Currency, CurrencyTotals, Money, RecordRequest, RelatedItem, TransactionStatus,
    TransactionType, WalletLedger, WalletTransaction,
};
use parcel_engine::{BookingStore, CustomerId, ItemStatus, SettlementFlag};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Amount owed to a customer right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwedSummary {
    /// Customer
    pub customer_id: CustomerId,
    /// Net USD owed
    pub net_usd: Decimal,
    /// Net KHR owed
    pub net_khr: Decimal,
    /// Items contributing
    pub unsettled_item_count: usize,
    /// Per-item breakdown
    pub items: Vec<ReportLine>,
}

impl OwedSummary {
    fn new(customer_id: CustomerId, items: Vec<ReportLine>) -> Self {
        let totals: CurrencyTotals = items.iter().map(|line| line.amount).collect();
        Self {
            customer_id,
            net_usd: totals.usd,
            net_khr: totals.khr,
            unsettled_item_count: items.len(),
            items,
        }
    }

    /// Buckets as totals
    pub fn totals(&self) -> CurrencyTotals {
        CurrencyTotals {
            usd: self.net_usd,
            khr: self.net_khr,
        }
    }

    /// Net owed in one currency
    pub fn net(&self, currency: Currency) -> Money {
        Money::new(self.totals().get(currency), currency)
    }

    /// Item references
    pub fn related_items(&self) -> Vec<RelatedItem> {
        self.items
            .iter()
            .map(|line| RelatedItem::new(line.booking_id, line.item_id))
            .collect()
    }

    /// Check if no item is owed
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Payout request issued by [`SettlementAggregator::settle`]
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    /// Items and amounts covered by the request
    pub summary: OwedSummary,
    /// One PENDING SETTLEMENT row per non-zero currency bucket
    pub transactions: Vec<WalletTransaction>,
}

/// Settlement aggregator
#[derive(Debug)]
pub struct SettlementAggregator {
    store: Arc<BookingStore>,
    ledger: Arc<WalletLedger>,
    directory: Arc<WalletDirectory>,
    settle_lock: tokio::sync::Mutex<()>,
}

impl SettlementAggregator {
    /// Create new aggregator
    pub fn new(
        store: Arc<BookingStore>,
        ledger: Arc<WalletLedger>,
        directory: Arc<WalletDirectory>,
    ) -> Self {
        Self {
            store,
            ledger,
            directory,
            settle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Net COD owed to a customer across delivered, unsettled items
    ///
    /// Read-only. An item delivered while the scan runs is picked up by the
    /// next call.
    pub fn compute_owed(&self, customer_id: &CustomerId) -> OwedSummary {
        let mut lines = Vec::new();
        for view in self.store.bookings_for_customer(customer_id) {
            for item in &view.items {
                if item.status == ItemStatus::Delivered
                    && item.customer_settlement == SettlementFlag::Unsettled
                {
                    lines.push(ReportLine::customer(&view, item));
                }
            }
        }

        OwedSummary::new(customer_id.clone(), lines)
    }

    /// Issue PENDING SETTLEMENT rows for everything currently owed
    ///
    /// Items already covered by a settlement row that has not failed are
    /// left out, so calling this twice before approval issues nothing new.
    pub async fn settle(&self, customer_id: &CustomerId) -> Result<SettlementRequest> {
        let link = self
            .directory
            .resolve(customer_id)
            .ok_or_else(|| Error::UnlinkedActor(customer_id.clone()))?;

        let _guard = self.settle_lock.lock().await;

        let requested = self.requested_items(&link);
        let owed = self.compute_owed(customer_id);
        let lines: Vec<ReportLine> = owed
            .items
            .into_iter()
            .filter(|line| !requested.contains(&RelatedItem::new(line.booking_id, line.item_id)))
            .collect();
        let summary = OwedSummary::new(customer_id.clone(), lines);

        let buckets = summary.totals().non_zero();
        if buckets.is_empty() {
            tracing::debug!(customer_id = %customer_id, "Nothing to settle");
            return Err(Error::NothingToSettle(customer_id.clone()));
        }

        // Every row references the full item set; a row only ever pays and
        // settles the items of its own currency
        let related = summary.related_items();
        let mut transactions = Vec::with_capacity(buckets.len());
        for amount in buckets {
            let mut request =
                RecordRequest::new(link.actor_id.clone(), amount, TransactionType::Settlement)
                    .with_actor_name(link.display_name.clone())
                    .with_related_items(related.clone())
                    .with_memo(format!(
                        "COD payout for {} items ({})",
                        summary.unsettled_item_count,
                        amount.currency()
                    ));
            if let Some(channel) = &link.payout_channel {
                request = request.with_payout_channel(channel.clone());
            }
            transactions.push(self.ledger.record(request).await?);
        }

        tracing::info!(
            customer_id = %customer_id,
            actor_id = %link.actor_id,
            items = summary.unsettled_item_count,
            net_usd = %summary.net_usd,
            net_khr = %summary.net_khr,
            requests = transactions.len(),
            "Settlement requested"
        );

        Ok(SettlementRequest {
            summary,
            transactions,
        })
    }

    /// Items paid by a pending or approved settlement row of the wallet
    ///
    /// An item counts only for a row of its own currency.
    fn requested_items(&self, link: &WalletLink) -> HashSet<RelatedItem> {
        self.ledger
            .transactions_for(&link.actor_id)
            .into_iter()
            .filter(|tx| tx.transaction_type == TransactionType::Settlement)
            .filter(|tx| tx.status != TransactionStatus::Failed)
            .flat_map(|tx| {
                let currency = tx.currency;
                tx.related_items
                    .into_iter()
                    .filter(move |r| self.item_currency(r) == Some(currency))
            })
            .collect()
    }

    fn item_currency(&self, related: &RelatedItem) -> Option<Currency> {
        self.store
            .item(related.booking_id, related.item_id)
            .ok()
            .map(|current| current.item.currency())
    }
}
