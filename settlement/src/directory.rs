//! Customer → payable wallet links

use dashmap::DashMap;
use ledger_core::ActorId;
use parcel_engine::CustomerId;
use serde::{Deserialize, Serialize};

/// Payable wallet of a customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletLink {
    /// Customer
    pub customer_id: CustomerId,
    /// Wallet receiving COD payouts
    pub actor_id: ActorId,
    /// Name shown on payout rows
    pub display_name: String,
    /// Default payout channel (bank, e-wallet, cash)
    #[serde(default)]
    pub payout_channel: Option<String>,
}

/// Wallet directory
#[derive(Debug, Default)]
pub struct WalletDirectory {
    links: DashMap<CustomerId, WalletLink>,
}

impl WalletDirectory {
    /// Create empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Link a customer to a wallet, replacing any previous link
    pub fn link(&self, link: WalletLink) -> Option<WalletLink> {
        tracing::info!(
            customer_id = %link.customer_id,
            actor_id = %link.actor_id,
            "Customer linked to wallet"
        );
        self.links.insert(link.customer_id.clone(), link)
    }

    /// Remove a customer's link
    pub fn unlink(&self, customer_id: &CustomerId) -> Option<WalletLink> {
        self.links.remove(customer_id).map(|(_, link)| link)
    }

    /// Payable wallet of a customer
    pub fn resolve(&self, customer_id: &CustomerId) -> Option<WalletLink> {
        self.links.get(customer_id).map(|link| link.clone())
    }

    /// Number of linked customers
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl FromIterator<WalletLink> for WalletDirectory {
    fn from_iter<I: IntoIterator<Item = WalletLink>>(iter: I) -> Self {
        let directory = WalletDirectory::new();
        for link in iter {
            directory.links.insert(link.customer_id.clone(), link);
        }
        directory
    }
}
