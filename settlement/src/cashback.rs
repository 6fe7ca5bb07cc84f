//! Monthly volume cashback
//!
//! A customer earns cashback for a month when the number of items delivered
//! in that month reaches the threshold of the rule in effect. At most one
//! active rule per customer may be in effect on any day; overlapping rules
//! are refused when saved.

use crate::{Error, Result};
use chrono::NaiveDate;
use ledger_core::{CurrencyTotals, Money};
use parcel_engine::{BookingStore, BookingView, CustomerId, ItemStatus, ParcelItem};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Cashback rule of one customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashbackRule {
    /// Rule ID
    #[serde(default = "Uuid::now_v7")]
    pub rule_id: Uuid,
    /// Customer
    pub customer_id: CustomerId,
    /// Deliveries per month needed to qualify
    pub min_parcels_per_month: u32,
    /// Percent of the month's delivery fees paid back
    pub cashback_percent: Decimal,
    /// First day in effect
    pub start_date: NaiveDate,
    /// Last day in effect
    pub end_date: NaiveDate,
    /// Active flag
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl CashbackRule {
    /// Check if the rule applies on a day
    pub fn is_in_effect(&self, today: NaiveDate) -> bool {
        self.is_active && self.start_date <= today && today <= self.end_date
    }

    /// Check if two active rules of the same customer share a day
    pub fn overlaps(&self, other: &CashbackRule) -> bool {
        self.is_active
            && other.is_active
            && self.customer_id == other.customer_id
            && self.start_date <= other.end_date
            && other.start_date <= self.end_date
    }

    fn validate(&self) -> Result<()> {
        if self.start_date > self.end_date {
            return Err(Error::Validation(format!(
                "Cashback rule {} ends before it starts",
                self.rule_id
            )));
        }
        if self.cashback_percent < Decimal::ZERO || self.cashback_percent > Decimal::ONE_HUNDRED {
            return Err(Error::Validation(format!(
                "Cashback percent must be between 0 and 100, got {}",
                self.cashback_percent
            )));
        }
        Ok(())
    }
}

/// Rule storage with overlap checks
#[derive(Debug, Default)]
pub struct CashbackRuleBook {
    rules: RwLock<Vec<CashbackRule>>,
}

impl CashbackRuleBook {
    /// Create empty rule book
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule
    ///
    /// Fails with [`Error::OverlappingRule`] when another active rule of the
    /// same customer shares a day with it.
    pub fn save(&self, rule: CashbackRule) -> Result<()> {
        rule.validate()?;

        let mut rules = self.rules.write();
        if let Some(existing) = rules
            .iter()
            .find(|r| r.rule_id != rule.rule_id && r.overlaps(&rule))
        {
            tracing::warn!(
                rule_id = %rule.rule_id,
                existing = %existing.rule_id,
                customer_id = %rule.customer_id,
                "Overlapping cashback rule refused"
            );
            return Err(Error::OverlappingRule {
                rule_id: rule.rule_id,
                existing: existing.rule_id,
                customer_id: rule.customer_id.clone(),
            });
        }

        tracing::info!(
            rule_id = %rule.rule_id,
            customer_id = %rule.customer_id,
            min_parcels = rule.min_parcels_per_month,
            percent = %rule.cashback_percent,
            "Cashback rule saved"
        );

        match rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
            Some(slot) => *slot = rule,
            None => rules.push(rule),
        }
        Ok(())
    }

    /// Switch a rule off
    pub fn deactivate(&self, rule_id: Uuid) -> Result<()> {
        let mut rules = self.rules.write();
        let rule = rules
            .iter_mut()
            .find(|r| r.rule_id == rule_id)
            .ok_or(Error::RuleNotFound(rule_id))?;
        rule.is_active = false;
        Ok(())
    }

    /// Rule in effect for a customer on a day
    pub fn active_rule(&self, customer_id: &CustomerId, today: NaiveDate) -> Option<CashbackRule> {
        self.rules
            .read()
            .iter()
            .find(|r| &r.customer_id == customer_id && r.is_in_effect(today))
            .cloned()
    }

    /// All rules of a customer
    pub fn rules_for(&self, customer_id: &CustomerId) -> Vec<CashbackRule> {
        self.rules
            .read()
            .iter()
            .filter(|r| &r.customer_id == customer_id)
            .cloned()
            .collect()
    }
}

/// Outcome of an eligibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    /// Threshold reached
    pub eligible: bool,
    /// Cashback percent of the rule (zero without a rule)
    pub percent: Decimal,
    /// Items delivered in the month
    pub delivered_count: usize,
    /// Threshold of the rule
    pub threshold: Option<u32>,
    /// Rule applied
    pub rule_id: Option<Uuid>,
}

/// Cashback owed for a month
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CashbackAward {
    /// Eligibility used
    pub eligibility: Eligibility,
    /// Delivery fees charged in the month
    pub fees: CurrencyTotals,
    /// Cashback per currency
    pub award: CurrencyTotals,
}

/// Cashback evaluator
#[derive(Debug)]
pub struct CashbackEvaluator {
    rules: Arc<CashbackRuleBook>,
    store: Arc<BookingStore>,
}

impl CashbackEvaluator {
    /// Create new evaluator
    pub fn new(rules: Arc<CashbackRuleBook>, store: Arc<BookingStore>) -> Self {
        Self { rules, store }
    }

    /// Rule book
    pub fn rules(&self) -> &Arc<CashbackRuleBook> {
        &self.rules
    }

    /// Check whether a customer reached the threshold in a month
    ///
    /// Counts items delivered from `month_start` to `month_end`, both
    /// inclusive, against the rule in effect on `today`.
    pub fn is_eligible(
        &self,
        customer_id: &CustomerId,
        month_start: NaiveDate,
        month_end: NaiveDate,
        today: NaiveDate,
    ) -> Eligibility {
        let delivered_count = self.delivered_in(customer_id, month_start, month_end).len();

        let Some(rule) = self.rules.active_rule(customer_id, today) else {
            return Eligibility {
                eligible: false,
                percent: Decimal::ZERO,
                delivered_count,
                threshold: None,
                rule_id: None,
            };
        };

        let eligible = delivered_count >= rule.min_parcels_per_month as usize;
        tracing::debug!(
            customer_id = %customer_id,
            rule_id = %rule.rule_id,
            delivered_count,
            threshold = rule.min_parcels_per_month,
            eligible,
            "Cashback eligibility evaluated"
        );

        Eligibility {
            eligible,
            percent: rule.cashback_percent,
            delivered_count,
            threshold: Some(rule.min_parcels_per_month),
            rule_id: Some(rule.rule_id),
        }
    }

    /// Cashback owed for a month: percent × delivery fees, per currency
    pub fn cashback_award(
        &self,
        customer_id: &CustomerId,
        month_start: NaiveDate,
        month_end: NaiveDate,
        today: NaiveDate,
    ) -> CashbackAward {
        let eligibility = self.is_eligible(customer_id, month_start, month_end, today);
        let fees: CurrencyTotals = self
            .delivered_in(customer_id, month_start, month_end)
            .iter()
            .map(|(view, item)| view.effective_fee(item))
            .collect();

        let award = if eligibility.eligible {
            fees.non_zero()
                .into_iter()
                .map(|fee| {
                    Money::new(fee.amount() * eligibility.percent / Decimal::ONE_HUNDRED, fee.currency())
                        .rounded()
                })
                .collect()
        } else {
            CurrencyTotals::default()
        };

        CashbackAward {
            eligibility,
            fees,
            award,
        }
    }

    fn delivered_in(
        &self,
        customer_id: &CustomerId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<(Arc<BookingView>, ParcelItem)> {
        let mut delivered = Vec::new();
        for view in self.store.bookings_for_customer(customer_id) {
            let view = Arc::new(view);
            for item in &view.items {
                let in_month = item
                    .delivered_at
                    .map(|at| at.date_naive())
                    .is_some_and(|day| from <= day && day <= to);
                if item.status == ItemStatus::Delivered && in_month {
                    delivered.push((view.clone(), item.clone()));
                }
            }
        }
        delivered
    }
}
