//! Severity policy
//!
//! Severity is a pure function of `|difference|`. Bounds are inclusive:
//! with the defaults, 1.00 is low and 1.01 is medium.

use crate::types::Severity;
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use treasury::Currency;

/// Upper bounds of the low, medium and high bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    /// Largest low-severity difference
    pub low: Decimal,
    /// Largest medium-severity difference
    pub medium: Decimal,
    /// Largest high-severity difference
    pub high: Decimal,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: Decimal::ONE,
            medium: Decimal::new(100, 0),
            high: Decimal::new(1000, 0),
        }
    }
}

impl SeverityThresholds {
    /// Bands must be positive and strictly increasing
    pub fn validate(&self) -> Result<()> {
        if self.low <= Decimal::ZERO {
            return Err(Error::Config(format!(
                "low severity bound must be positive, got {}",
                self.low
            )));
        }
        if !(self.low < self.medium && self.medium < self.high) {
            return Err(Error::Config(format!(
                "severity bounds must increase: {} < {} < {}",
                self.low, self.medium, self.high
            )));
        }
        Ok(())
    }

    /// Classify a difference
    pub fn classify(&self, difference: Decimal) -> Severity {
        let magnitude = difference.abs();
        if magnitude <= self.low {
            Severity::Low
        } else if magnitude <= self.medium {
            Severity::Medium
        } else if magnitude <= self.high {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

/// Deployment default plus per-currency overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPolicy {
    /// Bands used when a currency has no override
    pub default: SeverityThresholds,
    /// Per-currency bands
    pub per_currency: HashMap<Currency, SeverityThresholds>,
}

impl SeverityPolicy {
    /// Bands for a currency
    pub fn thresholds_for(&self, currency: Currency) -> &SeverityThresholds {
        self.per_currency.get(&currency).unwrap_or(&self.default)
    }

    /// Validate every band set
    pub fn validate(&self) -> Result<()> {
        self.default.validate()?;
        for (currency, thresholds) in &self.per_currency {
            thresholds
                .validate()
                .map_err(|e| Error::Config(format!("{} severity: {}", currency, e)))?;
        }
        Ok(())
    }
}

/// Severity of a difference in `currency`
pub fn determine_severity(
    policy: &SeverityPolicy,
    difference: Decimal,
    currency: Currency,
) -> Severity {
    policy.thresholds_for(currency).classify(difference)
}
