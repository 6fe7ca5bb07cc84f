//! Configuration for the parcel engine

use crate::fees::{ExchangeRate, FeeResolver, ServiceTariff, SpecialRate};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Parcel engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Exchange rate used to fill a missing special-rate currency
    pub exchange_rate: ExchangeRate,

    /// Service tariffs
    pub tariffs: Vec<ServiceTariff>,

    /// Customer special rates
    pub special_rates: Vec<SpecialRate>,
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

    /// Override fields from `PARCEL_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(rate) = std::env::var("PARCEL_KHR_PER_USD") {
            let khr_per_usd = Decimal::from_str(rate.trim())
                .map_err(|e| Error::Config(format!("Invalid PARCEL_KHR_PER_USD: {}", e)))?;
            if khr_per_usd <= Decimal::ZERO {
                return Err(Error::Config(
                    "PARCEL_KHR_PER_USD must be positive".to_string(),
                ));
            }
            self.exchange_rate = ExchangeRate { khr_per_usd };
        }

        Ok(())
    }

    /// Build a fee resolver holding the configured tariffs and rates
    pub fn fee_resolver(&self) -> Result<FeeResolver> {
        let resolver = FeeResolver::new(self.exchange_rate);
        for tariff in &self.tariffs {
            resolver.upsert_tariff(tariff.clone());
        }
        for rate in &self.special_rates {
            resolver.upsert_special_rate(rate.clone())?;
        }
        Ok(resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CustomerId;
    use chrono::NaiveDate;
    use ledger_core::{Currency, Money};
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
[exchange_rate]
khr_per_usd = "4000"

[[tariffs]]
service_id = "standard"
name = "Standard"
base_price = { usd = "1.50", khr = "6000" }

[[special_rates]]
customer_id = "cust-9"
service_id = "standard"
price_usd = "1.00"
start_date = "2024-05-01"
end_date = "2024-05-31"
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.exchange_rate.khr_per_usd, dec!(4100));
        assert!(config.tariffs.is_empty());
    }

    #[test]
    fn test_toml_builds_resolver() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.exchange_rate.khr_per_usd, dec!(4000));

        let resolver = config.fee_resolver().unwrap();
        let quote = resolver.resolve_fee(
            "standard",
            &CustomerId::new("cust-9"),
            1,
            Currency::KHR,
            NaiveDate::from_ymd_opt(2024, 5, 15).unwrap(),
        );
        assert!(quote.used_special_rate);
        assert_eq!(quote.fee, Money::new(dec!(4000), Currency::KHR));
    }
}
