//! Wallet ledger orchestration layer
//!
//! Ties storage, the single-writer actor and metrics together into the API
//! used by the parcel and settlement crates.
//!
//! Balances are never stored: `balance(actor, currency)` is the sum of the
//! APPROVED rows for that pair, recomputed on every call.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{ActorId, Config, Currency, Money, RecordRequest, TransactionType, WalletLedger};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let ledger = WalletLedger::open(Config::default()).await?;
//!
//!     let driver = ActorId::new("driver-7");
//!     let request = RecordRequest::new(
//!         driver.clone(),
//!         Money::new(Decimal::new(150, 2), Currency::USD),
//!         TransactionType::Earning,
//!     )
//!     .approved();
//!     ledger.record(request).await?;
//!
//!     assert_eq!(ledger.balance(&driver, Currency::USD), Decimal::new(150, 2));
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    metrics::Metrics,
    types::{
        ActorId, Currency, CurrencyTotals, RecordRequest, TransactionStatus, TransactionType,
        WalletTransaction, WithdrawalRequest,
    },
    Config, Error, Result, Storage,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Write seam used by components that emit ledger rows
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Append a row
    async fn record(&self, request: RecordRequest) -> Result<WalletTransaction>;
}

/// Main ledger interface
pub struct WalletLedger {
    /// Actor handle for writes
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl WalletLedger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let handle = spawn_ledger_actor(storage.clone(), config.mailbox_capacity);
        let metrics = Metrics::new()?;

        tracing::info!(
            service = %config.service_name,
            persistent = config.data_dir.is_some(),
            "Wallet ledger opened"
        );

        Ok(Self {
            handle,
            storage,
            metrics,
            config,
        })
    }

    /// Append a row
    ///
    /// Validates the sign and precision rules, then appends through the writer.
    pub async fn record(&self, request: RecordRequest) -> Result<WalletTransaction> {
        self.append(request, false).await
    }

    /// Request a cash-out; returns the PENDING transaction ID
    ///
    /// The row is refused when the approved balance minus other pending
    /// withdrawals cannot cover it.
    pub async fn request_withdrawal(&self, request: WithdrawalRequest) -> Result<Uuid> {
        if request.amount.amount() <= Decimal::ZERO {
            self.metrics.rejected_writes.inc();
            return Err(Error::Validation(
                "Withdrawal amount must be positive".to_string(),
            ));
        }

        let record = RecordRequest::new(
            request.actor_id,
            request.amount.negated(),
            TransactionType::Withdrawal,
        )
        .with_actor_name(request.actor_name)
        .with_payout_channel(request.payout_channel)
        .with_memo(request.memo)
        .with_related_items(request.related_items);

        let tx = self.append(record, true).await?;
        Ok(tx.transaction_id)
    }

    /// Approve a PENDING row (the only path into balances)
    pub async fn approve(&self, transaction_id: Uuid) -> Result<WalletTransaction> {
        self.decide(transaction_id, TransactionStatus::Approved, None)
            .await
    }

    /// Fail a PENDING row
    pub async fn reject(
        &self,
        transaction_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<WalletTransaction> {
        self.decide(transaction_id, TransactionStatus::Failed, Some(reason.into()))
            .await
    }

    /// Get row by ID
    pub fn transaction(&self, transaction_id: Uuid) -> Result<WalletTransaction> {
        self.storage.get(transaction_id)
    }

    /// All rows of an actor, in append order
    pub fn transactions_for(&self, actor_id: &ActorId) -> Vec<WalletTransaction> {
        self.storage.for_actor(actor_id)
    }

    /// PENDING rows of an actor, optionally of one type
    pub fn pending_for(
        &self,
        actor_id: &ActorId,
        transaction_type: Option<TransactionType>,
    ) -> Vec<WalletTransaction> {
        self.storage
            .for_actor(actor_id)
            .into_iter()
            .filter(|tx| tx.status == TransactionStatus::Pending)
            .filter(|tx| transaction_type.map_or(true, |t| tx.transaction_type == t))
            .collect()
    }

    /// Balance for an actor/currency pair: Σ APPROVED amounts
    pub fn balance(&self, actor_id: &ActorId, currency: Currency) -> Decimal {
        self.storage.fold_actor(actor_id, Decimal::ZERO, |acc, tx| {
            if tx.is_approved() && tx.currency == currency {
                acc + tx.amount
            } else {
                acc
            }
        })
    }

    /// Balances for every currency bucket of an actor
    pub fn balances(&self, actor_id: &ActorId) -> CurrencyTotals {
        self.storage
            .fold_actor(actor_id, CurrencyTotals::default(), |mut totals, tx| {
                if tx.is_approved() {
                    totals.add(tx.money());
                }
                totals
            })
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying storage, shared with the booking store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Shutdown ledger
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down wallet ledger");
        self.handle.shutdown().await
    }

    async fn append(
        &self,
        request: RecordRequest,
        require_funds: bool,
    ) -> Result<WalletTransaction> {
        if let Err(e) = Self::validate(&request) {
            self.metrics.rejected_writes.inc();
            return Err(e);
        }

        let start = Instant::now();
        let transaction = request.into_transaction(Utc::now());
        let result = self.handle.record(transaction, require_funds).await;
        self.metrics
            .record_duration
            .observe(start.elapsed().as_secs_f64());

        match &result {
            Ok(tx) => {
                self.metrics
                    .transactions_total
                    .with_label_values(&[tx.transaction_type.as_str(), tx.currency.code()])
                    .inc();
                tracing::info!(
                    transaction_id = %tx.transaction_id,
                    actor_id = %tx.actor_id,
                    amount = %tx.amount,
                    currency = %tx.currency,
                    transaction_type = %tx.transaction_type,
                    status = tx.status.as_str(),
                    "Wallet transaction recorded"
                );
            }
            Err(_) => self.metrics.rejected_writes.inc(),
        }

        result
    }

    async fn decide(
        &self,
        transaction_id: Uuid,
        status: TransactionStatus,
        reason: Option<String>,
    ) -> Result<WalletTransaction> {
        let tx = self.handle.decide(transaction_id, status, reason).await?;
        self.metrics
            .decisions_total
            .with_label_values(&[status.as_str()])
            .inc();
        Ok(tx)
    }

    /// Validate row invariants
    fn validate(request: &RecordRequest) -> Result<()> {
        let amount = request.amount.amount();
        let currency = request.amount.currency();

        if !request.transaction_type.accepts(amount) {
            return Err(Error::Validation(format!(
                "{} amount {} {} has the wrong sign",
                request.transaction_type, amount, currency
            )));
        }

        if amount.normalize().scale() > currency.minor_units() {
            return Err(Error::Validation(format!(
                "{} allows {} decimal places, got {}",
                currency,
                currency.minor_units(),
                amount
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl LedgerWriter for WalletLedger {
    async fn record(&self, request: RecordRequest) -> Result<WalletTransaction> {
        WalletLedger::record(self, request).await
    }
}

impl std::fmt::Debug for WalletLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletLedger")
            .field("service", &self.config.service_name)
            .field("transactions", &self.storage.len())
            .finish()
    }
}
