//! Notification dispatch seam
//!
//! The core never renders or sends notifications itself. A
//! [`NotificationDispatcher`] is handed each entry by the outbox; delivery is
//! at-least-once, so receivers that must not act twice wrap their dispatcher
//! in an [`IdempotentReceiver`].

use crate::{metrics::DUPLICATE_RECEIPTS_TOTAL, Notification, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Delivers notifications to their transport
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Deliver one notification
    async fn dispatch(&self, notification: &Notification) -> Result<()>;
}

/// Dispatcher that writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            notification_id = %notification.id,
            dedupe_key = %notification.dedupe_key,
            kind = notification.kind.as_str(),
            text = %notification.text,
            "Notification dispatched"
        );
        Ok(())
    }
}

/// Drops deliveries whose dedupe key was already received
#[derive(Debug)]
pub struct IdempotentReceiver<D> {
    inner: D,
    seen: DashMap<String, DateTime<Utc>>,
}

impl<D: NotificationDispatcher> IdempotentReceiver<D> {
    /// Wrap a dispatcher
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            seen: DashMap::new(),
        }
    }

    /// Check if a key was received
    pub fn has_seen(&self, dedupe_key: &str) -> bool {
        self.seen.contains_key(dedupe_key)
    }

    /// Number of distinct keys received
    pub fn received(&self) -> usize {
        self.seen.len()
    }

    /// Wrapped dispatcher
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: NotificationDispatcher> NotificationDispatcher for IdempotentReceiver<D> {
    async fn dispatch(&self, notification: &Notification) -> Result<()> {
        // Claim the key first so concurrent duplicates cannot both pass
        let claimed = match self.seen.entry(notification.dedupe_key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        };

        if !claimed {
            DUPLICATE_RECEIPTS_TOTAL
                .with_label_values(&[notification.kind.as_str()])
                .inc();
            tracing::debug!(
                dedupe_key = %notification.dedupe_key,
                "Duplicate notification dropped"
            );
            return Ok(());
        }

        if let Err(e) = self.inner.dispatch(notification).await {
            // Release the key so the redelivery is not mistaken for a duplicate
            self.seen.remove(&notification.dedupe_key);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, NotificationKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl NotificationDispatcher for Counting {
        async fn dispatch(&self, _notification: &Notification) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(Error::Dispatch("transport down".to_string()));
            }
            Ok(())
        }
    }

    fn notification(key: &str) -> Notification {
        Notification::new(NotificationKind::SettlementApproved, key, json!({}))
    }

    #[tokio::test]
    async fn test_duplicates_dropped() {
        let receiver = IdempotentReceiver::new(Counting::default());

        receiver.dispatch(&notification("tx-1")).await.unwrap();
        receiver.dispatch(&notification("tx-1")).await.unwrap();
        receiver.dispatch(&notification("tx-2")).await.unwrap();

        assert_eq!(receiver.inner().calls.load(Ordering::SeqCst), 2);
        assert_eq!(receiver.received(), 2);
        assert!(receiver.has_seen("tx-1"));
    }

    #[tokio::test]
    async fn test_failed_delivery_can_be_retried() {
        let receiver = IdempotentReceiver::new(Counting {
            fail_first: true,
            ..Default::default()
        });

        assert!(receiver.dispatch(&notification("tx-1")).await.is_err());
        assert!(!receiver.has_seen("tx-1"));

        receiver.dispatch(&notification("tx-1")).await.unwrap();
        assert_eq!(receiver.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_log_dispatcher_accepts_everything() {
        assert!(LogDispatcher.dispatch(&notification("tx-1")).await.is_ok());
    }
}
