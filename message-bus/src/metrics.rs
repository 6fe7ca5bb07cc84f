//! Prometheus metrics for the notification outbox

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};

lazy_static! {
    /// Notifications accepted into the outbox
    pub static ref OUTBOX_ENQUEUE_TOTAL: CounterVec = register_counter_vec!(
        "outbox_enqueue_total",
        "Notifications offered to the outbox",
        &["kind", "status"]
    )
    .unwrap();

    /// Delivery attempts
    pub static ref OUTBOX_DELIVERY_TOTAL: CounterVec = register_counter_vec!(
        "outbox_delivery_total",
        "Notification delivery attempts",
        &["kind", "status"]
    )
    .unwrap();

    /// Delivery duration
    pub static ref OUTBOX_DELIVERY_DURATION: HistogramVec = register_histogram_vec!(
        "outbox_delivery_duration_seconds",
        "Notification delivery duration in seconds",
        &["kind"]
    )
    .unwrap();

    /// Entries waiting for delivery
    pub static ref OUTBOX_PENDING: IntGauge = register_int_gauge!(
        "outbox_pending",
        "Notifications waiting for delivery"
    )
    .unwrap();

    /// Duplicate deliveries dropped by idempotent receivers
    pub static ref DUPLICATE_RECEIPTS_TOTAL: CounterVec = register_counter_vec!(
        "notification_duplicate_receipts_total",
        "Duplicate notification deliveries dropped",
        &["kind"]
    )
    .unwrap();
}
