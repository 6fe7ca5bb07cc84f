//! COD Wallet Ledger Core
//!
//! Append-only wallet ledger for drivers and customers, kept in two
//! currency buckets (USD and KHR).
//!
//! # Architecture
//!
//! - **Append-only**: rows are never edited; a PENDING row may only move to
//!   APPROVED or FAILED
//! - **Single Writer**: one Tokio task performs every write
//! - **Derived balances**: balance = Σ APPROVED amounts, never a stored counter
//! - **Storage**: optional RocksDB database, loaded into memory on open
//!
//! # Invariants
//!
//! - Amounts never cross currency buckets
//! - Corrections are new ADJUSTMENT rows carrying only the delta
//! - Deterministic reload: same database → same balances

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod ledger;
pub mod error;
pub mod actor;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    ActorId, Currency, CurrencyTotals, Money, RecordRequest, RelatedItem, TransactionStatus,
    TransactionType, WalletTransaction, WithdrawalRequest,
};
pub use ledger::{LedgerWriter, WalletLedger};
pub use storage::Storage;
pub use config::{Config, RocksDBConfig};
