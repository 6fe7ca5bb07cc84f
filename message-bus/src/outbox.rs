//! Notification outbox
//!
//! Ledger operations enqueue notifications here instead of calling a
//! transport. Entries are keyed by their dedupe key, so enqueueing the same
//! event twice is a no-op. [`Outbox::drain`] hands due entries to a
//! dispatcher; failures are retried with exponential backoff and moved to the
//! dead-letter state after `max_attempts`.
//!
//! Delivery is at-least-once: a dispatcher that succeeded but whose result
//! was lost will see the entry again. Receivers deduplicate on the key.
//!
//! Delivered entries are dropped by [`Outbox::sweep`] once they are older
//! than `delivered_retention`; only their dedupe keys are kept, so a late
//! duplicate enqueue is still refused. Dead letters stay until requeued.

use crate::{
    dispatcher::NotificationDispatcher,
    metrics::{OUTBOX_DELIVERY_DURATION, OUTBOX_DELIVERY_TOTAL, OUTBOX_ENQUEUE_TOTAL, OUTBOX_PENDING},
    Error, Notification, Result,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outbox configuration
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Delivery attempts before an entry is dead-lettered
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_retry_delay: Duration,

    /// Upper bound for the retry delay
    pub max_retry_delay: Duration,

    /// Entries delivered per drain
    pub batch_size: usize,

    /// Relay poll interval
    pub poll_interval: Duration,

    /// How long delivered entries are kept before only their key remains
    pub delivered_retention: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(60),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            delivered_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl OutboxConfig {
    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `OUTBOX_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_number("OUTBOX_MAX_ATTEMPTS")? {
            self.max_attempts = (v as u32).max(1);
        }
        if let Some(v) = env_number("OUTBOX_INITIAL_RETRY_MS")? {
            self.initial_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_number("OUTBOX_MAX_RETRY_MS")? {
            self.max_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_number("OUTBOX_BATCH_SIZE")? {
            self.batch_size = (v as usize).max(1);
        }
        if let Some(v) = env_number("OUTBOX_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(v.max(1));
        }
        if let Some(v) = env_number("OUTBOX_RETENTION_SECS")? {
            self.delivered_retention = Duration::from_secs(v);
        }
        Ok(())
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.initial_retry_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_delay)
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Delivery state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    /// Waiting for (re)delivery
    Pending,
    /// Accepted by the dispatcher
    Delivered,
    /// Gave up after `max_attempts`
    DeadLettered,
}

/// Outbox entry with delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Notification
    pub notification: Notification,
    /// Delivery state
    pub state: DeliveryState,
    /// Failed attempts so far
    pub attempts: u32,
    /// Earliest time of the next attempt
    pub next_attempt_at: DateTime<Utc>,
    /// Last dispatcher error
    pub last_error: Option<String>,
    /// Enqueue time
    pub enqueued_at: DateTime<Utc>,
    /// Delivery time
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries delivered
    pub delivered: usize,
    /// Entries that failed and will be retried
    pub retried: usize,
    /// Entries moved to the dead-letter state
    pub dead_lettered: usize,
}

impl DrainReport {
    /// Entries attempted
    pub fn attempted(&self) -> usize {
        self.delivered + self.retried + self.dead_lettered
    }
}

/// In-memory notification outbox
#[derive(Debug)]
pub struct Outbox {
    entries: DashMap<String, OutboxEntry>,
    /// Keys of delivered entries already swept
    swept: DashSet<String>,
    config: OutboxConfig,
    drain_lock: tokio::sync::Mutex<()>,
}

impl Outbox {
    /// Create new outbox
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            entries: DashMap::new(),
            swept: DashSet::new(),
            config,
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Configuration
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Add a notification; returns false if its dedupe key is already known
    pub fn enqueue(&self, notification: Notification) -> bool {
        let kind = notification.kind.as_str();
        let now = Utc::now();

        // `sweep` records the key before it removes the entry, so a vacant
        // slot plus a recorded key means the entry was delivered and swept
        match self.entries.entry(notification.dedupe_key.clone()) {
            Entry::Vacant(_) if self.swept.contains(&notification.dedupe_key) => {
                OUTBOX_ENQUEUE_TOTAL.with_label_values(&[kind, "duplicate"]).inc();
                debug!(
                    dedupe_key = %notification.dedupe_key,
                    kind,
                    "Notification already delivered"
                );
                false
            }
            Entry::Occupied(_) => {
                OUTBOX_ENQUEUE_TOTAL.with_label_values(&[kind, "duplicate"]).inc();
                debug!(
                    dedupe_key = %notification.dedupe_key,
                    kind,
                    "Notification already enqueued"
                );
                false
            }
            Entry::Vacant(slot) => {
                info!(
                    notification_id = %notification.id,
                    dedupe_key = %notification.dedupe_key,
                    kind,
                    "Notification enqueued"
                );
                slot.insert(OutboxEntry {
                    notification,
                    state: DeliveryState::Pending,
                    attempts: 0,
                    next_attempt_at: now,
                    last_error: None,
                    enqueued_at: now,
                    delivered_at: None,
                });
                OUTBOX_ENQUEUE_TOTAL.with_label_values(&[kind, "accepted"]).inc();
                OUTBOX_PENDING.inc();
                true
            }
        }
    }

    /// Deliver every entry that is due now
    pub async fn drain(&self, dispatcher: &dyn NotificationDispatcher) -> DrainReport {
        self.drain_due(dispatcher, Utc::now()).await
    }

    /// Deliver every entry due at `now`, oldest first, up to `batch_size`
    pub async fn drain_due(
        &self,
        dispatcher: &dyn NotificationDispatcher,
        now: DateTime<Utc>,
    ) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        for notification in self.due(now) {
            let kind = notification.kind.as_str();
            let start = Instant::now();
            let result = dispatcher.dispatch(&notification).await;
            OUTBOX_DELIVERY_DURATION
                .with_label_values(&[kind])
                .observe(start.elapsed().as_secs_f64());

            let status = if result.is_ok() { "success" } else { "error" };
            OUTBOX_DELIVERY_TOTAL.with_label_values(&[kind, status]).inc();

            let Some(mut entry) = self.entries.get_mut(&notification.dedupe_key) else {
                continue;
            };

            match result {
                Ok(()) => {
                    entry.state = DeliveryState::Delivered;
                    entry.delivered_at = Some(Utc::now());
                    entry.last_error = None;
                    OUTBOX_PENDING.dec();
                    report.delivered += 1;
                    if entry.attempts > 0 {
                        info!(
                            dedupe_key = %notification.dedupe_key,
                            attempts = entry.attempts + 1,
                            "Notification delivered after retry"
                        );
                    }
                }
                Err(e) => {
                    entry.attempts += 1;
                    entry.last_error = Some(e.to_string());

                    if entry.attempts >= self.config.max_attempts {
                        entry.state = DeliveryState::DeadLettered;
                        OUTBOX_PENDING.dec();
                        report.dead_lettered += 1;
                        error!(
                            dedupe_key = %notification.dedupe_key,
                            kind,
                            attempts = entry.attempts,
                            error = %e,
                            "Notification dead-lettered"
                        );
                    } else {
                        let delay = self.config.retry_delay(entry.attempts);
                        entry.next_attempt_at = now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        report.retried += 1;
                        warn!(
                            dedupe_key = %notification.dedupe_key,
                            kind,
                            attempt = entry.attempts,
                            retry_in = ?delay,
                            error = %e,
                            "Notification delivery failed"
                        );
                    }
                }
            }
        }

        report
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut due: Vec<(DateTime<Utc>, Notification)> = self
            .entries
            .iter()
            .filter(|e| e.state == DeliveryState::Pending && e.next_attempt_at <= now)
            .map(|e| (e.enqueued_at, e.notification.clone()))
            .collect();

        due.sort_by_key(|(enqueued_at, n)| (*enqueued_at, n.id));
        due.into_iter()
            .take(self.config.batch_size)
            .map(|(_, n)| n)
            .collect()
    }

    /// Drop delivered entries older than the retention, keeping their keys
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.delivered_retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = now - retention;

        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.state == DeliveryState::Delivered)
            .filter(|e| e.delivered_at.is_some_and(|at| at <= cutoff))
            .map(|e| e.key().clone())
            .collect();

        for key in &expired {
            self.swept.insert(key.clone());
            self.entries.remove(key);
        }

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Delivered notifications swept");
        }
        expired.len()
    }

    /// Put a dead-lettered entry back in the queue
    pub fn requeue(&self, dedupe_key: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(dedupe_key)
            .ok_or_else(|| Error::NotFound(format!("Outbox entry {}", dedupe_key)))?;

        if entry.state != DeliveryState::DeadLettered {
            return Err(Error::InvalidState(format!(
                "Outbox entry {} is not dead-lettered",
                dedupe_key
            )));
        }

        entry.state = DeliveryState::Pending;
        entry.attempts = 0;
        entry.next_attempt_at = Utc::now();
        OUTBOX_PENDING.inc();
        info!(dedupe_key, "Dead-lettered notification requeued");
        Ok(())
    }

    /// Entry by dedupe key
    pub fn get(&self, dedupe_key: &str) -> Option<OutboxEntry> {
        self.entries.get(dedupe_key).map(|e| e.clone())
    }

    /// Entries in a given state, oldest first
    pub fn entries_in(&self, state: DeliveryState) -> Vec<OutboxEntry> {
        let mut entries: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.clone())
            .collect();
        entries.sort_by_key(|e| e.enqueued_at);
        entries
    }

    /// Dead-lettered entries
    pub fn dead_letters(&self) -> Vec<OutboxEntry> {
        self.entries_in(DeliveryState::DeadLettered)
    }

    /// Number of entries waiting for delivery
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == DeliveryState::Pending)
            .count()
    }

    /// Number of entries still held (swept entries excluded)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(OutboxConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NotificationKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Fails the first `failures` calls, then records deliveries
    #[derive(Default)]
    struct Flaky {
        failures: Mutex<u32>,
        delivered: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn failing(times: u32) -> Self {
            Self {
                failures: Mutex::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl NotificationDispatcher for Flaky {
        async fn dispatch(&self, notification: &Notification) -> Result<()> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Dispatch("connection refused".to_string()));
            }
            self.delivered.lock().push(notification.dedupe_key.clone());
            Ok(())
        }
    }

    fn notification(key: &str) -> Notification {
        Notification::new(NotificationKind::SettlementApproved, key, json!({"key": key}))
    }

    fn config() -> OutboxConfig {
        OutboxConfig {
            max_attempts: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let outbox = Outbox::new(config());
        assert!(outbox.enqueue(notification("tx-1")));
        assert!(!outbox.enqueue(notification("tx-1")));
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pending_count(), 1);
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let config = config();
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(2));
        assert_eq!(config.retry_delay(3), Duration::from_secs(4));
        assert_eq!(config.retry_delay(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_drain_delivers_in_order() {
        let outbox = Outbox::new(config());
        outbox.enqueue(notification("tx-1"));
        outbox.enqueue(notification("tx-2"));

        let dispatcher = Flaky::default();
        let report = outbox.drain(&dispatcher).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(*dispatcher.delivered.lock(), vec!["tx-1", "tx-2"]);
        assert_eq!(outbox.get("tx-1").unwrap().state, DeliveryState::Delivered);

        // Nothing left to deliver
        assert_eq!(outbox.drain(&dispatcher).await.attempted(), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_backs_off() {
        let outbox = Outbox::new(config());
        outbox.enqueue(notification("tx-1"));
        let dispatcher = Flaky::failing(1);

        let now = Utc::now();
        let report = outbox.drain_due(&dispatcher, now).await;
        assert_eq!(report.retried, 1);

        let entry = outbox.get("tx-1").unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_attempt_at, now + chrono::Duration::seconds(1));
        assert!(entry.last_error.unwrap().contains("connection refused"));

        // Not due yet
        let report = outbox.drain_due(&dispatcher, now).await;
        assert_eq!(report.attempted(), 0);

        let report = outbox
            .drain_due(&dispatcher, now + chrono::Duration::seconds(1))
            .await;
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_old_deliveries_but_remembers_keys() {
        let outbox = Outbox::new(OutboxConfig {
            delivered_retention: Duration::from_secs(60),
            ..config()
        });
        outbox.enqueue(notification("tx-1"));
        outbox.enqueue(notification("tx-2"));

        let dispatcher = Flaky::default();
        assert_eq!(outbox.drain(&dispatcher).await.delivered, 2);
        let pending = Outbox::new(config());
        pending.enqueue(notification("tx-3"));

        let now = Utc::now();
        assert_eq!(outbox.sweep(now), 0);

        assert_eq!(outbox.sweep(now + chrono::Duration::seconds(61)), 2);
        assert!(outbox.is_empty());
        assert!(outbox.get("tx-1").is_none());

        // Swept keys still deduplicate
        assert!(!outbox.enqueue(notification("tx-1")));
        assert!(outbox.enqueue(notification("tx-4")));

        // Undelivered entries are never swept
        assert_eq!(pending.sweep(now + chrono::Duration::days(30)), 0);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let outbox = Outbox::new(config());
        outbox.enqueue(notification("tx-1"));
        let dispatcher = Flaky::failing(10);

        let mut now = Utc::now();
        for _ in 0..3 {
            outbox.drain_due(&dispatcher, now).await;
            now += chrono::Duration::seconds(60);
        }

        let dead = outbox.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(outbox.pending_count(), 0);

        // Dead letters are not retried until requeued
        assert_eq!(outbox.drain_due(&dispatcher, now).await.attempted(), 0);

        *dispatcher.failures.lock() = 0;
        outbox.requeue("tx-1").unwrap();
        assert_eq!(outbox.drain(&dispatcher).await.delivered, 1);
        assert!(matches!(outbox.requeue("tx-1"), Err(Error::InvalidState(_))));
        assert!(matches!(outbox.requeue("tx-9"), Err(Error::NotFound(_))));
    }
}
