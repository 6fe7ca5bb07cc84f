//! Fee resolution
//!
//! Resolves the delivery fee for a booking from the service tariff and an
//! optional customer special rate. Resolution is pure: the same tariffs,
//! rates and request always give the same quote, and unknown inputs produce
//! warnings instead of errors so booking screens never hard-fail on a stale
//! service reference.

use crate::types::CustomerId;
use crate::{Error, Result};
use chrono::NaiveDate;
use ledger_core::{Currency, Money};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A price in both currencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prices {
    /// USD price
    pub usd: Decimal,
    /// KHR price
    pub khr: Decimal,
}

impl Prices {
    /// Create new prices
    pub fn new(usd: Decimal, khr: Decimal) -> Self {
        Self { usd, khr }
    }

    /// Price in one currency
    pub fn get(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::USD => self.usd,
            Currency::KHR => self.khr,
        }
    }
}

/// Default price list of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTariff {
    /// Service ID
    pub service_id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Price per item
    pub base_price: Prices,
    /// Price per kilometer, per item
    #[serde(default)]
    pub price_per_km: Prices,
}

/// Negotiated price for one customer and service within a date window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialRate {
    /// Rate ID
    #[serde(default = "Uuid::now_v7")]
    pub rate_id: Uuid,
    /// Customer
    pub customer_id: CustomerId,
    /// Service
    pub service_id: String,
    /// USD price per item
    #[serde(default)]
    pub price_usd: Option<Decimal>,
    /// KHR price per item
    #[serde(default)]
    pub price_khr: Option<Decimal>,
    /// First day the rate applies
    pub start_date: NaiveDate,
    /// Last day the rate applies (inclusive)
    pub end_date: NaiveDate,
}

impl SpecialRate {
    /// Check if the window contains a date
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    fn validate(&self) -> Result<()> {
        if self.end_date < self.start_date {
            return Err(Error::Validation(format!(
                "Special rate {} ends before it starts",
                self.rate_id
            )));
        }
        for price in [self.price_usd, self.price_khr].into_iter().flatten() {
            if price < Decimal::ZERO {
                return Err(Error::Validation(format!(
                    "Special rate {} has a negative price",
                    self.rate_id
                )));
            }
        }
        Ok(())
    }
}

/// Fixed KHR/USD exchange rate used to fill a missing currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    /// Riel per US dollar
    pub khr_per_usd: Decimal,
}

impl Default for ExchangeRate {
    fn default() -> Self {
        Self {
            khr_per_usd: Decimal::from(4100),
        }
    }
}

impl ExchangeRate {
    /// Convert USD to whole riel
    pub fn to_khr(&self, usd: Decimal) -> Decimal {
        Currency::KHR.round(usd * self.khr_per_usd)
    }

    /// Convert riel to USD cents
    pub fn to_usd(&self, khr: Decimal) -> Decimal {
        if self.khr_per_usd.is_zero() {
            return Decimal::ZERO;
        }
        Currency::USD.round(khr / self.khr_per_usd)
    }
}

/// Non-fatal conditions met while resolving a fee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeWarning {
    /// No tariff for the service; the fee is zero
    UnknownService {
        /// Requested service
        service_id: String,
    },
    /// Several special rates are active; the tariff price was used
    AmbiguousSpecialRate {
        /// Active rates
        rate_ids: Vec<Uuid>,
    },
    /// The active special rate has no price; the tariff price was used
    IncompleteSpecialRate {
        /// Rate without a price
        rate_id: Uuid,
    },
}

/// Fee resolution input
#[derive(Debug, Clone)]
pub struct FeeRequest {
    /// Service
    pub service_id: String,
    /// Customer (selects special rates)
    pub customer_id: CustomerId,
    /// Items charged; at least one is always charged
    pub item_count: usize,
    /// Fee currency, always the COD currency
    pub cod_currency: Currency,
    /// Date the special rate window is checked against
    pub as_of: NaiveDate,
    /// Distance for per-km pricing
    pub distance_km: Option<Decimal>,
}

/// Fee resolution result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    /// Total fee in the COD currency
    pub fee: Money,
    /// Price per item in USD
    pub fee_per_item_usd: Decimal,
    /// Price per item in KHR
    pub fee_per_item_khr: Decimal,
    /// Whether a special rate replaced the base price
    pub used_special_rate: bool,
    /// Non-fatal conditions
    pub warnings: Vec<FeeWarning>,
}

impl FeeQuote {
    fn zero(currency: Currency, warning: FeeWarning) -> Self {
        Self {
            fee: Money::zero(currency),
            fee_per_item_usd: Decimal::ZERO,
            fee_per_item_khr: Decimal::ZERO,
            used_special_rate: false,
            warnings: vec![warning],
        }
    }

    /// Price per item in one currency
    pub fn per_item(&self, currency: Currency) -> Money {
        match currency {
            Currency::USD => Money::new(self.fee_per_item_usd, Currency::USD),
            Currency::KHR => Money::new(self.fee_per_item_khr, Currency::KHR),
        }
    }
}

/// Tariffs and special rates, resolved on demand
#[derive(Debug, Default)]
pub struct FeeResolver {
    tariffs: RwLock<HashMap<String, ServiceTariff>>,
    special_rates: RwLock<Vec<SpecialRate>>,
    exchange_rate: ExchangeRate,
}

impl FeeResolver {
    /// Create an empty resolver
    pub fn new(exchange_rate: ExchangeRate) -> Self {
        Self {
            tariffs: RwLock::new(HashMap::new()),
            special_rates: RwLock::new(Vec::new()),
            exchange_rate,
        }
    }

    /// Add or replace a tariff
    pub fn upsert_tariff(&self, tariff: ServiceTariff) {
        tracing::debug!(service_id = %tariff.service_id, "Tariff updated");
        self.tariffs
            .write()
            .insert(tariff.service_id.clone(), tariff);
    }

    /// Add or replace a special rate
    pub fn upsert_special_rate(&self, rate: SpecialRate) -> Result<()> {
        rate.validate()?;
        tracing::debug!(
            rate_id = %rate.rate_id,
            customer_id = %rate.customer_id,
            service_id = %rate.service_id,
            "Special rate updated"
        );

        let mut rates = self.special_rates.write();
        match rates.iter_mut().find(|r| r.rate_id == rate.rate_id) {
            Some(existing) => *existing = rate,
            None => rates.push(rate),
        }
        Ok(())
    }

    /// Exchange rate used to fill missing currencies
    pub fn exchange_rate(&self) -> ExchangeRate {
        self.exchange_rate
    }

    /// Resolve a fee
    pub fn resolve(&self, request: &FeeRequest) -> FeeQuote {
        let tariffs = self.tariffs.read();
        let Some(tariff) = tariffs.get(&request.service_id) else {
            tracing::warn!(
                service_id = %request.service_id,
                "Unknown service, quoting zero fee"
            );
            return FeeQuote::zero(
                request.cod_currency,
                FeeWarning::UnknownService {
                    service_id: request.service_id.clone(),
                },
            );
        };

        let mut warnings = Vec::new();
        let (base, used_special_rate) = match self.special_price(request) {
            SpecialPrice::None => (tariff.base_price, false),
            SpecialPrice::One(prices) => (prices, true),
            SpecialPrice::Warn(warning) => {
                tracing::warn!(
                    customer_id = %request.customer_id,
                    service_id = %request.service_id,
                    ?warning,
                    "Special rate ignored"
                );
                warnings.push(warning);
                (tariff.base_price, false)
            }
        };

        let distance = request.distance_km.unwrap_or(Decimal::ZERO);
        let per_item_usd =
            Currency::USD.round(base.usd + tariff.price_per_km.usd * distance);
        let per_item_khr =
            Currency::KHR.round(base.khr + tariff.price_per_km.khr * distance);

        let per_item = match request.cod_currency {
            Currency::USD => per_item_usd,
            Currency::KHR => per_item_khr,
        };
        let count = Decimal::from(request.item_count.max(1) as u64);
        let fee = Money::new(per_item * count, request.cod_currency).rounded();

        FeeQuote {
            fee,
            fee_per_item_usd: per_item_usd,
            fee_per_item_khr: per_item_khr,
            used_special_rate,
            warnings,
        }
    }

    /// Resolve a fee from loose arguments
    pub fn resolve_fee(
        &self,
        service_id: &str,
        customer_id: &CustomerId,
        item_count: usize,
        cod_currency: Currency,
        as_of: NaiveDate,
    ) -> FeeQuote {
        self.resolve(&FeeRequest {
            service_id: service_id.to_string(),
            customer_id: customer_id.clone(),
            item_count,
            cod_currency,
            as_of,
            distance_km: None,
        })
    }

    fn special_price(&self, request: &FeeRequest) -> SpecialPrice {
        let rates = self.special_rates.read();
        let active: Vec<&SpecialRate> = rates
            .iter()
            .filter(|r| r.customer_id == request.customer_id)
            .filter(|r| r.service_id == request.service_id)
            .filter(|r| r.is_active_on(request.as_of))
            .collect();

        match active.as_slice() {
            [] => SpecialPrice::None,
            [rate] => match (rate.price_usd, rate.price_khr) {
                (Some(usd), Some(khr)) => SpecialPrice::One(Prices::new(usd, khr)),
                (Some(usd), None) => {
                    SpecialPrice::One(Prices::new(usd, self.exchange_rate.to_khr(usd)))
                }
                (None, Some(khr)) => {
                    SpecialPrice::One(Prices::new(self.exchange_rate.to_usd(khr), khr))
                }
                (None, None) => SpecialPrice::Warn(FeeWarning::IncompleteSpecialRate {
                    rate_id: rate.rate_id,
                }),
            },
            many => SpecialPrice::Warn(FeeWarning::AmbiguousSpecialRate {
                rate_ids: many.iter().map(|r| r.rate_id).collect(),
            }),
        }
    }
}

enum SpecialPrice {
    None,
    One(Prices),
    Warn(FeeWarning),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn resolver() -> FeeResolver {
        let resolver = FeeResolver::new(ExchangeRate::default());
        resolver.upsert_tariff(ServiceTariff {
            service_id: "standard".to_string(),
            name: "Standard".to_string(),
            base_price: Prices::new(dec!(1.50), dec!(6000)),
            price_per_km: Prices::new(dec!(0.10), dec!(400)),
        });
        resolver
    }

    fn special(usd: Option<Decimal>, khr: Option<Decimal>) -> SpecialRate {
        SpecialRate {
            rate_id: Uuid::now_v7(),
            customer_id: CustomerId::new("cust-1"),
            service_id: "standard".to_string(),
            price_usd: usd,
            price_khr: khr,
            start_date: date(1),
            end_date: date(31),
        }
    }

    #[test]
    fn test_tariff_price() {
        let quote = resolver().resolve_fee(
            "standard",
            &CustomerId::new("cust-1"),
            3,
            Currency::USD,
            date(10),
        );
        assert_eq!(quote.fee, Money::new(dec!(4.50), Currency::USD));
        assert_eq!(quote.fee_per_item_khr, dec!(6000));
        assert!(!quote.used_special_rate);
        assert!(quote.warnings.is_empty());
    }

    #[test]
    fn test_zero_items_charged_as_one() {
        let quote = resolver().resolve_fee(
            "standard",
            &CustomerId::new("cust-1"),
            0,
            Currency::KHR,
            date(10),
        );
        assert_eq!(quote.fee, Money::new(dec!(6000), Currency::KHR));
    }

    #[test]
    fn test_special_rate_overrides_tariff() {
        let resolver = resolver();
        resolver
            .upsert_special_rate(special(Some(dec!(1.00)), Some(dec!(4000))))
            .unwrap();

        let quote = resolver.resolve_fee(
            "standard",
            &CustomerId::new("cust-1"),
            2,
            Currency::USD,
            date(31),
        );
        assert!(quote.used_special_rate);
        assert_eq!(quote.fee, Money::new(dec!(2.00), Currency::USD));
        assert_eq!(quote.fee_per_item_khr, dec!(4000));

        // Outside the window and for other customers the tariff applies
        let quote = resolver.resolve_fee(
            "standard",
            &CustomerId::new("cust-1"),
            2,
            Currency::USD,
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        );
        assert!(!quote.used_special_rate);
        let quote = resolver.resolve_fee(
            "standard",
            &CustomerId::new("cust-2"),
            2,
            Currency::USD,
            date(10),
        );
        assert!(!quote.used_special_rate);
    }

    #[test]
    fn test_missing_currency_derived_from_exchange_rate() {
        let resolver = resolver();
        resolver
            .upsert_special_rate(special(Some(dec!(1.25)), None))
            .unwrap();

        let quote = resolver.resolve_fee(
            "standard",
            &CustomerId::new("cust-1"),
            1,
            Currency::KHR,
            date(10),
        );
        assert_eq!(quote.fee, Money::new(dec!(5125), Currency::KHR));
        assert_eq!(quote.fee_per_item_usd, dec!(1.25));
    }

    #[test]
    fn test_ambiguous_special_rate_falls_back() {
        let resolver = resolver();
        resolver
            .upsert_special_rate(special(Some(dec!(1.00)), None))
            .unwrap();
        resolver
            .upsert_special_rate(special(Some(dec!(0.80)), None))
            .unwrap();

        let quote = resolver.resolve_fee(
            "standard",
            &CustomerId::new("cust-1"),
            1,
            Currency::USD,
            date(10),
        );
        assert!(!quote.used_special_rate);
        assert_eq!(quote.fee, Money::new(dec!(1.50), Currency::USD));
        assert!(matches!(
            quote.warnings.as_slice(),
            [FeeWarning::AmbiguousSpecialRate { rate_ids }] if rate_ids.len() == 2
        ));
    }

    #[test]
    fn test_unknown_service_is_zero_with_warning() {
        let quote = resolver().resolve_fee(
            "express",
            &CustomerId::new("cust-1"),
            2,
            Currency::USD,
            date(10),
        );
        assert!(quote.fee.is_zero());
        assert_eq!(
            quote.warnings,
            vec![FeeWarning::UnknownService {
                service_id: "express".to_string()
            }]
        );
    }

    #[test]
    fn test_distance_pricing() {
        let quote = resolver().resolve(&FeeRequest {
            service_id: "standard".to_string(),
            customer_id: CustomerId::new("cust-1"),
            item_count: 2,
            cod_currency: Currency::USD,
            as_of: date(10),
            distance_km: Some(dec!(5)),
        });
        assert_eq!(quote.fee_per_item_usd, dec!(2.00));
        assert_eq!(quote.fee_per_item_khr, dec!(8000));
        assert_eq!(quote.fee, Money::new(dec!(4.00), Currency::USD));
    }

    #[test]
    fn test_invalid_special_rate_rejected() {
        let mut rate = special(Some(dec!(1)), None);
        rate.end_date = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        assert!(matches!(
            resolver().upsert_special_rate(rate),
            Err(Error::Validation(_))
        ));
    }
}
