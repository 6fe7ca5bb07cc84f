//! Error types for the parcel engine

use crate::adjustment::AdjustmentFailure;
use thiserror::Error;
use uuid::Uuid;

/// Result type for parcel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Parcel engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input shape (negative COD, mixed currencies, empty booking)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transition from an invalid status, or a financial edit on a settled item
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// Item changed since the caller read it
    #[error("Version conflict on item {item_id}: expected {expected}, found {found}")]
    VersionConflict {
        /// Item
        item_id: Uuid,
        /// Version the caller read
        expected: u64,
        /// Version in the store
        found: u64,
    },

    /// Booking not found
    #[error("Booking not found: {0}")]
    BookingNotFound(Uuid),

    /// Item not found
    #[error("Item not found: {0}")]
    ItemNotFound(Uuid),

    /// Tracking code already used by another item
    #[error("Duplicate tracking code: {0}")]
    DuplicateTrackingCode(String),

    /// Item committed, but a derived ledger adjustment was not written
    #[error("Partial adjustment: {0}")]
    PartialAdjustment(Box<AdjustmentFailure>),

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
