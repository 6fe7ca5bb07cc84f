//! Error types for settlement

use ledger_core::Money;
use parcel_engine::CustomerId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Parcel engine error
    #[error("Parcel error: {0}")]
    Parcel(#[from] parcel_engine::Error),

    /// Notification outbox error
    #[error("Outbox error: {0}")]
    Bus(#[from] message_bus::Error),

    /// Customer has no payable wallet
    #[error("Customer {0} is not linked to a payable wallet")]
    UnlinkedActor(CustomerId),

    /// No delivered, unsettled item left to pay out
    #[error("Nothing to settle for customer {0}")]
    NothingToSettle(CustomerId),

    /// Items of a pending payout no longer add up to its amount
    #[error("Payout {transaction_id} is outdated: requested {requested}, items now net {current}")]
    OutdatedPayout {
        /// Pending row
        transaction_id: Uuid,
        /// Amount on the row
        requested: Money,
        /// Net of the row's items that are still unsettled
        current: Money,
    },

    /// Active cashback rules of one customer overlap
    #[error("Cashback rule {rule_id} overlaps active rule {existing} of customer {customer_id}")]
    OverlappingRule {
        /// Rule being saved
        rule_id: Uuid,
        /// Rule already in effect
        existing: Uuid,
        /// Customer
        customer_id: CustomerId,
    },

    /// Cashback rule not found
    #[error("Cashback rule not found: {0}")]
    RuleNotFound(Uuid),

    /// Bad input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
