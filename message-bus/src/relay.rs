//! Background outbox relay
//!
//! Drains the outbox on a fixed interval until shut down, sweeping old
//! deliveries after each pass.

use crate::{dispatcher::NotificationDispatcher, outbox::Outbox};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running relay
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop the relay after one final drain
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Outbox relay task failed: {}", e);
        }
    }
}

/// Start draining `outbox` into `dispatcher` every `interval`
pub fn spawn_relay(
    outbox: Arc<Outbox>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    interval: Duration,
) -> RelayHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        info!(interval = ?interval, "Starting outbox relay");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = outbox.drain(dispatcher.as_ref()).await;
                    if report.attempted() > 0 {
                        debug!(
                            delivered = report.delivered,
                            retried = report.retried,
                            dead_lettered = report.dead_lettered,
                            "Outbox drained"
                        );
                    }
                    outbox.sweep(chrono::Utc::now());
                }
                _ = &mut shutdown_rx => {
                    let report = outbox.drain(dispatcher.as_ref()).await;
                    info!(
                        delivered = report.delivered,
                        pending = outbox.pending_count(),
                        "Outbox relay stopped"
                    );
                    break;
                }
            }
        }
    });

    RelayHandle {
        shutdown: Some(shutdown_tx),
        task,
    }
}
