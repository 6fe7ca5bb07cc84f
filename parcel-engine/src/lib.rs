//! COD Parcel Engine
//!
//! Booking and item lifecycle for cash-on-delivery parcels.
//!
//! # Components
//!
//! - **Fee resolution**: tariff or customer special rate, fee in the COD currency
//! - **Item store**: items keyed by `(booking_id, item_id)` with optimistic versions
//! - **State machine**: pickup verification, bulk transitions, delivery, corrections
//! - **Adjustments**: fee corrections reach driver wallets as deltas, never as
//!   replacement rows
//!
//! # Invariants
//!
//! - Fee currency always equals COD currency
//! - Once an item is settled on either side its COD, fee and currency are frozen
//! - One commit touches one booking and is all-or-nothing

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod adjustment;
pub mod config;
pub mod error;
pub mod fees;
pub mod machine;
pub mod store;
pub mod types;

// Re-exports
pub use adjustment::{AdjustmentFailure, AdjustmentReason};
pub use config::Config;
pub use error::{Error, Result};
pub use fees::{ExchangeRate, FeeQuote, FeeRequest, FeeResolver, FeeWarning, Prices, ServiceTariff, SpecialRate};
pub use machine::{BookingReceipt, BulkReport, DeliveryOutcome, EditOutcome, ParcelStateMachine};
pub use store::{BookingStore, ItemKey, VersionedItem};
pub use types::{
    BookingStatus, BookingView, Commission, CustomerId, DriverRole, FeeMode, ItemCorrection,
    ItemStatus, NewBooking, NewItem, ParcelBooking, ParcelItem, Receiver, SettlementFlag,
    SettlementParty,
};
