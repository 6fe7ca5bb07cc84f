//! Error types for the wallet ledger

use crate::types::{ActorId, Currency};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input shape (zero amount, wrong sign, excess precision)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Attempted status transition from a final status
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// Transaction ID already present
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(Uuid),

    /// Arithmetic across currency buckets
    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch {
        /// Currency of the left operand
        expected: Currency,
        /// Currency of the right operand
        found: Currency,
    },

    /// Withdrawal larger than the available balance
    #[error("Insufficient funds for {actor}: available {available} {currency}, requested {requested}")]
    InsufficientFunds {
        /// Wallet owner
        actor: ActorId,
        /// Currency bucket
        currency: Currency,
        /// Approved balance minus pending withdrawals
        available: Decimal,
        /// Requested amount
        requested: Decimal,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
