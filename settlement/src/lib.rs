//! COD Settlement
//!
//! Pays customers the COD collected on their behalf and drivers their
//! commission, on top of the wallet ledger and the parcel engine.
//!
//! # Flow
//!
//! 1. **Aggregation**: net COD owed is computed on demand from delivered,
//!    unsettled items, per currency
//! 2. **Request**: `settle` writes one PENDING SETTLEMENT row per non-zero
//!    bucket; drivers request withdrawals against their earnings
//! 3. **Approval**: a human approves or rejects; approval flips the settlement
//!    flags of the covered items
//! 4. **Notification**: the rendered report is enqueued in the outbox, keyed
//!    by the transaction ID
//!
//! # Example
//!
//! ```no_run
//! use parcel_engine::CustomerId;
//! use settlement::{Config, SettlementEngine};
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let engine = SettlementEngine::open(Config::default()).await?;
//!
//!     let customer = CustomerId::new("cust-1");
//!     let owed = engine.compute_owed(&customer);
//!     println!("Owed {} USD and {} KHR", owed.net_usd, owed.net_khr);
//!
//!     let request = engine.settle(&customer).await?;
//!     for tx in &request.transactions {
//!         engine.approve(tx.transaction_id).await?;
//!     }
//!
//!     engine.shutdown().await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod aggregator;
pub mod cashback;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod payout;
pub mod report;

// Re-exports
pub use aggregator::{OwedSummary, SettlementAggregator, SettlementRequest};
pub use cashback::{CashbackAward, CashbackEvaluator, CashbackRule, CashbackRuleBook, Eligibility};
pub use config::{Config, OutboxSettings};
pub use directory::{WalletDirectory, WalletLink};
pub use engine::SettlementEngine;
pub use error::{Error, Result};
pub use payout::{PayoutApproval, PayoutWorkflow};
pub use report::{ReportLine, SettlementReport};
