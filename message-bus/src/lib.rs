//! Notification outbox
//!
//! Ledger state changes announce themselves through notifications that are
//! written to an outbox and relayed to a transport in the background:
//! - Idempotent enqueue keyed by the ledger transaction ID
//! - At-least-once delivery with exponential backoff and dead-lettering
//! - Receiver-side deduplication
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod dispatcher;
pub mod error;
pub mod message;
pub mod metrics;
pub mod outbox;
pub mod relay;

pub use dispatcher::{IdempotentReceiver, LogDispatcher, NotificationDispatcher};
pub use error::{Error, Result};
pub use message::{Notification, NotificationKind};
pub use outbox::{DeliveryState, DrainReport, Outbox, OutboxConfig, OutboxEntry};
pub use relay::{spawn_relay, RelayHandle};
