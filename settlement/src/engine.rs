//! Settlement engine
//!
//! Wires the wallet ledger, the parcel state machine, the aggregator, the
//! cashback evaluator and the payout workflow around one notification outbox.

use crate::{
    aggregator::{OwedSummary, SettlementAggregator, SettlementRequest},
    cashback::{CashbackAward, CashbackEvaluator, CashbackRule, CashbackRuleBook, Eligibility},
    config::Config,
    directory::{WalletDirectory, WalletLink},
    payout::{PayoutApproval, PayoutWorkflow},
    Result,
};
use chrono::NaiveDate;
use ledger_core::{WalletLedger, WalletTransaction, WithdrawalRequest};
use message_bus::{
    spawn_relay, Notification, NotificationDispatcher, NotificationKind, Outbox, RelayHandle,
};
use parcel_engine::{BookingStore, CustomerId, EditOutcome, ItemCorrection, ParcelStateMachine};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Settlement engine
#[derive(Debug)]
pub struct SettlementEngine {
    ledger: Arc<WalletLedger>,
    machine: Arc<ParcelStateMachine>,
    directory: Arc<WalletDirectory>,
    aggregator: SettlementAggregator,
    cashback: CashbackEvaluator,
    payouts: PayoutWorkflow,
    outbox: Arc<Outbox>,
    config: Config,
}

impl SettlementEngine {
    /// Open the ledger and build every component from configuration
    pub async fn open(config: Config) -> Result<Self> {
        tracing::info!(service = %config.service_name, "Opening settlement engine");

        let ledger = Arc::new(WalletLedger::open(config.ledger.clone()).await?);
        let fees = Arc::new(config.parcel.fee_resolver()?);
        let store = Arc::new(BookingStore::open(ledger.storage().clone())?);
        let machine = Arc::new(ParcelStateMachine::new(
            store.clone(),
            fees,
            ledger.clone(),
        ));

        let directory: Arc<WalletDirectory> =
            Arc::new(config.wallet_links.iter().cloned().collect());

        let rules = Arc::new(CashbackRuleBook::new());
        for rule in &config.cashback_rules {
            rules.save(rule.clone())?;
        }

        let outbox = Arc::new(Outbox::new(config.outbox.to_outbox_config()));

        let aggregator = SettlementAggregator::new(store.clone(), ledger.clone(), directory.clone());
        let cashback = CashbackEvaluator::new(rules, store);
        let payouts = PayoutWorkflow::new(machine.clone(), ledger.clone(), outbox.clone());

        tracing::info!(
            wallet_links = directory.len(),
            cashback_rules = config.cashback_rules.len(),
            "Settlement engine ready"
        );

        Ok(Self {
            ledger,
            machine,
            directory,
            aggregator,
            cashback,
            payouts,
            outbox,
            config,
        })
    }

    /// Parcel state machine
    pub fn parcels(&self) -> &Arc<ParcelStateMachine> {
        &self.machine
    }

    /// Wallet ledger
    pub fn ledger(&self) -> &Arc<WalletLedger> {
        &self.ledger
    }

    /// Notification outbox
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Wallet directory
    pub fn directory(&self) -> &Arc<WalletDirectory> {
        &self.directory
    }

    /// Cashback rule book
    pub fn cashback_rules(&self) -> &Arc<CashbackRuleBook> {
        self.cashback.rules()
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Link a customer to a payable wallet
    pub fn link_wallet(&self, link: WalletLink) {
        self.directory.link(link);
    }

    /// Save a cashback rule
    pub fn save_cashback_rule(&self, rule: CashbackRule) -> Result<()> {
        self.cashback.rules().save(rule)
    }

    /// Net COD currently owed to a customer
    pub fn compute_owed(&self, customer_id: &CustomerId) -> OwedSummary {
        self.aggregator.compute_owed(customer_id)
    }

    /// Request a COD payout for everything currently owed
    pub async fn settle(&self, customer_id: &CustomerId) -> Result<SettlementRequest> {
        self.aggregator.settle(customer_id).await
    }

    /// Request a cash-out
    pub async fn request_withdrawal(&self, request: WithdrawalRequest) -> Result<Uuid> {
        self.payouts.request_withdrawal(request).await
    }

    /// Approve a pending payout
    pub async fn approve(&self, transaction_id: Uuid) -> Result<PayoutApproval> {
        self.payouts.approve(transaction_id).await
    }

    /// Reject a pending payout
    pub async fn reject(
        &self,
        transaction_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<WalletTransaction> {
        self.payouts.reject(transaction_id, reason).await
    }

    /// Monthly cashback eligibility
    pub fn is_eligible(
        &self,
        customer_id: &CustomerId,
        month_start: NaiveDate,
        month_end: NaiveDate,
        today: NaiveDate,
    ) -> Eligibility {
        self.cashback
            .is_eligible(customer_id, month_start, month_end, today)
    }

    /// Monthly cashback amount
    pub fn cashback_award(
        &self,
        customer_id: &CustomerId,
        month_start: NaiveDate,
        month_end: NaiveDate,
        today: NaiveDate,
    ) -> CashbackAward {
        self.cashback
            .cashback_award(customer_id, month_start, month_end, today)
    }

    /// Correct an item and announce every adjustment written for it
    ///
    /// A degraded outcome (item committed, adjustment missing) is returned as
    /// is; callers decide whether to surface it as an error.
    pub async fn edit_item(
        &self,
        booking_id: Uuid,
        item_id: Uuid,
        correction: ItemCorrection,
    ) -> Result<EditOutcome> {
        let outcome = self
            .machine
            .edit_item(booking_id, item_id, correction)
            .await?;

        for tx in &outcome.adjustments {
            self.outbox.enqueue(
                Notification::new(
                    NotificationKind::AdjustmentRecorded,
                    tx.transaction_id.to_string(),
                    json!({
                        "transaction_id": tx.transaction_id,
                        "actor_id": tx.actor_id,
                        "amount": tx.money(),
                        "booking_id": booking_id,
                        "item_id": item_id,
                        "old_fee": outcome.old_fee,
                        "new_fee": outcome.new_fee,
                    }),
                )
                .with_text(format!(
                    "Commission adjusted by {} for item {}",
                    tx.money(),
                    outcome.item.item.tracking_code
                ))
                .with_header("actor_id", tx.actor_id.as_str()),
            );
        }

        Ok(outcome)
    }

    /// Start relaying the outbox to a dispatcher
    pub fn spawn_relay(&self, dispatcher: Arc<dyn NotificationDispatcher>) -> RelayHandle {
        spawn_relay(
            self.outbox.clone(),
            dispatcher,
            self.config.outbox.to_outbox_config().poll_interval,
        )
    }

    /// Shutdown engine
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down settlement engine");

        let Self {
            ledger,
            machine,
            aggregator,
            payouts,
            ..
        } = self;
        drop(payouts);
        drop(aggregator);
        drop(machine);

        match Arc::try_unwrap(ledger) {
            Ok(ledger) => ledger.shutdown().await?,
            Err(_) => tracing::warn!("Wallet ledger still shared, writer stops when released"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.ledger.data_dir = Some(temp_dir.path().join("wallet"));

        let engine = SettlementEngine::open(config).await.unwrap();
        assert!(engine.outbox().is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_customer_owes_nothing() {
        let engine = SettlementEngine::open(Config::default()).await.unwrap();

        let owed = engine.compute_owed(&CustomerId::new("nobody"));
        assert!(owed.is_empty());
        assert!(engine.settle(&CustomerId::new("nobody")).await.is_err());

        engine.shutdown().await.unwrap();
    }
}
