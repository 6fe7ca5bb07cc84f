//! Single-writer actor for the wallet ledger
//!
//! Every write (append or status decision) goes through one Tokio task, so
//! balance checks and the writes they guard can never interleave. Reads go
//! straight to [`Storage`].
//!
//! ```text
//!   WalletLedger / LedgerHandle (Clone)
//!                 │
//!                 │ mpsc::channel (bounded)
//!                 ▼
//!   LedgerActor (single task)
//!     ├─ Record  → funds check → Storage::append
//!     └─ Decide  → Storage::decide (PENDING → APPROVED | FAILED)
//! ```

use crate::types::{TransactionStatus, TransactionType, WalletTransaction};
use crate::{Error, Result, Storage};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Append a new row
    Record {
        transaction: WalletTransaction,
        /// Refuse the row if it would overdraw the actor's bucket
        require_funds: bool,
        response: oneshot::Sender<Result<WalletTransaction>>,
    },

    /// Move a PENDING row to a final status
    Decide {
        transaction_id: Uuid,
        status: TransactionStatus,
        reason: Option<String>,
        response: oneshot::Sender<Result<WalletTransaction>>,
    },

    /// Shutdown actor; answered once storage is released
    Shutdown { response: oneshot::Sender<()> },
}

/// Actor that owns all ledger writes
#[derive(Debug)]
pub struct LedgerActor {
    storage: Arc<Storage>,
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(storage: Arc<Storage>, mailbox: mpsc::Receiver<LedgerMessage>) -> Self {
        Self { storage, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut stopped = None;

        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Record {
                    transaction,
                    require_funds,
                    response,
                } => {
                    let result = self.record(transaction, require_funds);
                    if let Err(e) = &result {
                        tracing::warn!("Ledger write refused: {}", e);
                    }
                    let _ = response.send(result);
                }

                LedgerMessage::Decide {
                    transaction_id,
                    status,
                    reason,
                    response,
                } => {
                    let result = self.storage.decide(transaction_id, status, reason);
                    if let Ok(tx) = &result {
                        tracing::info!(
                            transaction_id = %tx.transaction_id,
                            actor_id = %tx.actor_id,
                            status = tx.status.as_str(),
                            "Transaction decided"
                        );
                    }
                    let _ = response.send(result);
                }

                LedgerMessage::Shutdown { response } => {
                    stopped = Some(response);
                    break;
                }
            }
        }

        drop(self);
        tracing::debug!("Ledger actor stopped");
        if let Some(response) = stopped {
            let _ = response.send(());
        }
    }

    fn record(
        &self,
        transaction: WalletTransaction,
        require_funds: bool,
    ) -> Result<WalletTransaction> {
        if require_funds && transaction.amount < Decimal::ZERO {
            let available = self.available(&transaction);
            let requested = -transaction.amount;
            if available < requested {
                return Err(Error::InsufficientFunds {
                    actor: transaction.actor_id.clone(),
                    currency: transaction.currency,
                    available,
                    requested,
                });
            }
        }

        self.storage.append(&transaction)?;
        Ok(transaction)
    }

    /// Approved balance minus withdrawals still awaiting approval
    fn available(&self, transaction: &WalletTransaction) -> Decimal {
        self.storage
            .fold_actor(&transaction.actor_id, Decimal::ZERO, |acc, row| {
                if row.currency != transaction.currency {
                    return acc;
                }
                match row.status {
                    TransactionStatus::Approved => acc + row.amount,
                    TransactionStatus::Pending
                        if row.transaction_type == TransactionType::Withdrawal =>
                    {
                        acc + row.amount
                    }
                    _ => acc,
                }
            })
    }
}

/// Handle to the ledger actor (cloneable)
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Append a row
    pub async fn record(
        &self,
        transaction: WalletTransaction,
        require_funds: bool,
    ) -> Result<WalletTransaction> {
        let (response, rx) = oneshot::channel();
        self.send(LedgerMessage::Record {
            transaction,
            require_funds,
            response,
        })
        .await?;
        Self::receive(rx).await
    }

    /// Decide a pending row
    pub async fn decide(
        &self,
        transaction_id: Uuid,
        status: TransactionStatus,
        reason: Option<String>,
    ) -> Result<WalletTransaction> {
        let (response, rx) = oneshot::channel();
        self.send(LedgerMessage::Decide {
            transaction_id,
            status,
            reason,
            response,
        })
        .await?;
        Self::receive(rx).await
    }

    /// Stop the actor and wait until it has released storage
    pub async fn shutdown(&self) -> Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(LedgerMessage::Shutdown { response }).await?;
        rx.await
            .map_err(|_| Error::Concurrency("Ledger actor dropped shutdown reply".to_string()))
    }

    async fn send(&self, msg: LedgerMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::Concurrency("Ledger actor mailbox closed".to_string()))
    }

    async fn receive(
        rx: oneshot::Receiver<Result<WalletTransaction>>,
    ) -> Result<WalletTransaction> {
        rx.await
            .map_err(|_| Error::Concurrency("Ledger actor dropped response".to_string()))?
    }
}

/// Spawn the ledger actor on the current runtime
pub fn spawn_ledger_actor(storage: Arc<Storage>, mailbox_capacity: usize) -> LedgerHandle {
    let (sender, mailbox) = mpsc::channel(mailbox_capacity.max(1));
    let actor = LedgerActor::new(storage, mailbox);
    tokio::spawn(actor.run());
    LedgerHandle { sender }
}
