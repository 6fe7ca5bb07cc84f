//! Configuration for the settlement service

use crate::{cashback::CashbackRule, directory::WalletLink, Error, Result};
use message_bus::OutboxConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settlement service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Wallet ledger
    pub ledger: ledger_core::Config,

    /// Tariffs, special rates and exchange rate
    pub parcel: parcel_engine::Config,

    /// Notification outbox
    pub outbox: OutboxSettings,

    /// Customer wallet links loaded at startup
    pub wallet_links: Vec<WalletLink>,

    /// Cashback rules loaded at startup
    pub cashback_rules: Vec<CashbackRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "cod-settlement".to_string(),
            ledger: ledger_core::Config::default(),
            parcel: parcel_engine::Config::default(),
            outbox: OutboxSettings::default(),
            wallet_links: Vec::new(),
            cashback_rules: Vec::new(),
        }
    }
}

/// Outbox section, durations in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Delivery attempts before dead-lettering
    pub max_attempts: u32,

    /// First retry delay
    pub initial_retry_ms: u64,

    /// Retry delay cap
    pub max_retry_ms: u64,

    /// Entries per drain
    pub batch_size: usize,

    /// Relay interval
    pub poll_interval_ms: u64,

    /// Retention of delivered entries
    pub retention_secs: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        OutboxSettings::from(&OutboxConfig::default())
    }
}

impl From<&OutboxConfig> for OutboxSettings {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_retry_ms: config.initial_retry_delay.as_millis() as u64,
            max_retry_ms: config.max_retry_delay.as_millis() as u64,
            batch_size: config.batch_size,
            poll_interval_ms: config.poll_interval.as_millis() as u64,
            retention_secs: config.delivered_retention.as_secs(),
        }
    }
}

impl OutboxSettings {
    /// Outbox configuration
    pub fn to_outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            max_attempts: self.max_attempts.max(1),
            initial_retry_delay: Duration::from_millis(self.initial_retry_ms),
            max_retry_delay: Duration::from_millis(self.max_retry_ms),
            batch_size: self.batch_size.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            delivered_retention: Duration::from_secs(self.retention_secs),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from `SETTLEMENT_CONFIG` if set, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("SETTLEMENT_CONFIG") {
            Ok(path) => Config::from_file(path)?,
            Err(_) => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `SETTLEMENT_*`, `WALLET_*`, `PARCEL_*` and
    /// `OUTBOX_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(name) = std::env::var("SETTLEMENT_SERVICE_NAME") {
            self.service_name = name;
        }

        self.ledger.apply_env()?;
        self.parcel.apply_env()?;

        let mut outbox = self.outbox.to_outbox_config();
        outbox.apply_env()?;
        self.outbox = OutboxSettings::from(&outbox);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "cod-settlement");
        assert!(config.ledger.data_dir.is_none());
        assert_eq!(config.outbox.max_attempts, 5);
        assert_eq!(config.outbox.to_outbox_config().poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            service_name = "cod-settlement-test"

            [ledger]
            data_dir = "/var/lib/wallet"

            [parcel.exchange_rate]
            khr_per_usd = "4000"

            [[parcel.tariffs]]
            service_id = "standard"
            name = "Standard"
            base_price = { usd = "1.50", khr = "6000" }
            price_per_km = { usd = "0", khr = "0" }

            [outbox]
            max_attempts = 3

            [[wallet_links]]
            customer_id = "cust-1"
            actor_id = "wallet-1"
            display_name = "Sokha Shop"

            [[cashback_rules]]
            customer_id = "cust-1"
            min_parcels_per_month = 100
            cashback_percent = "5"
            start_date = "2024-05-01"
            end_date = "2024-05-31"
            "#,
        )
        .unwrap();

        assert_eq!(config.service_name, "cod-settlement-test");
        assert_eq!(config.parcel.exchange_rate.khr_per_usd, dec!(4000));
        assert_eq!(config.parcel.tariffs.len(), 1);
        assert_eq!(config.outbox.max_attempts, 3);
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.outbox.retention_secs, 86_400);
        assert_eq!(config.wallet_links[0].payout_channel, None);
        assert!(config.cashback_rules[0].is_active);
    }
}
