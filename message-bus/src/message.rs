//! Notification envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// What a notification announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Customer COD payout approved
    SettlementApproved,
    /// Driver withdrawal approved
    WithdrawalApproved,
    /// Payout request rejected
    PayoutRejected,
    /// Compensating adjustment written after a correction
    AdjustmentRecorded,
}

impl NotificationKind {
    /// Label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SettlementApproved => "settlement_approved",
            NotificationKind::WithdrawalApproved => "withdrawal_approved",
            NotificationKind::PayoutRejected => "payout_rejected",
            NotificationKind::AdjustmentRecorded => "adjustment_recorded",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification ID (UUIDv7 for ordering)
    pub id: Uuid,

    /// Idempotency key; the ledger transaction ID for ledger events
    pub dedupe_key: String,

    /// Notification kind
    pub kind: NotificationKind,

    /// Structured payload (JSON)
    pub payload: serde_json::Value,

    /// Rendered human-readable text
    pub text: String,

    /// Timestamp
    pub created_at: DateTime<Utc>,

    /// Headers (metadata)
    pub headers: HashMap<String, String>,
}

impl Notification {
    /// Create new notification
    pub fn new(
        kind: NotificationKind,
        dedupe_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            dedupe_key: dedupe_key.into(),
            kind,
            payload,
            text: String::new(),
            created_at: Utc::now(),
            headers: HashMap::new(),
        }
    }

    /// Set rendered text
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Add header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_creation() {
        let notification = Notification::new(
            NotificationKind::SettlementApproved,
            "0191d2a4-0000-7000-8000-000000000001",
            json!({"net_usd": "44.00"}),
        )
        .with_text("Payout approved")
        .with_header("actor_id", "cust-1");

        assert_eq!(notification.kind, NotificationKind::SettlementApproved);
        assert_eq!(notification.payload["net_usd"], "44.00");
        assert_eq!(notification.headers["actor_id"], "cust-1");
    }

    #[test]
    fn test_wire_shape() {
        let notification = Notification::new(
            NotificationKind::AdjustmentRecorded,
            "tx-1",
            json!({}),
        );

        let bytes = notification.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["kind"], "ADJUSTMENT_RECORDED");
        assert_eq!(value["dedupe_key"], "tx-1");

        let decoded = Notification::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.id, notification.id);
    }
}
