//! Buffer threshold model
//!
//! Pure policy over a supplied balance. Thresholds are owned by
//! configuration; the engine only reads them.

use crate::types::{AccountId, BufferAccount};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Health classification of a buffer balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BufferHealth {
    /// Below min
    CriticalLow,
    /// Between min (inclusive) and target
    BelowTarget,
    /// Between target and max (both inclusive)
    Healthy,
    /// Above max
    OverCapitalized,
}

impl BufferHealth {
    /// Whether a conversion should top this buffer up
    pub fn needs_replenishment(&self) -> bool {
        matches!(self, BufferHealth::CriticalLow | BufferHealth::BelowTarget)
    }

    /// Log / metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferHealth::CriticalLow => "CRITICAL_LOW",
            BufferHealth::BelowTarget => "BELOW_TARGET",
            BufferHealth::Healthy => "HEALTHY",
            BufferHealth::OverCapitalized => "OVER_CAPITALIZED",
        }
    }
}

impl fmt::Display for BufferHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold configuration for one buffer account (USD equivalent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferThreshold {
    /// Record ID
    pub id: Uuid,
    /// Buffer this threshold applies to
    pub account: BufferAccount,
    /// Below this the buffer is critical
    pub min_threshold: Decimal,
    /// Replenishment aims for this level
    pub target_threshold: Decimal,
    /// Above this the buffer is over-capitalized
    pub max_threshold: Decimal,
    /// Replenishments are whole multiples of this
    pub conversion_batch_size: Decimal,
    /// Operator notes
    pub notes: Option<String>,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Updated at
    pub updated_at: DateTime<Utc>,
}

impl BufferThreshold {
    /// Create and validate a threshold
    pub fn new(
        account: BufferAccount,
        min_threshold: Decimal,
        target_threshold: Decimal,
        max_threshold: Decimal,
        conversion_batch_size: Decimal,
    ) -> Result<Self> {
        let now = Utc::now();
        let threshold = Self {
            id: Uuid::new_v4(),
            account,
            min_threshold,
            target_threshold,
            max_threshold,
            conversion_batch_size,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        threshold.validate()?;
        Ok(threshold)
    }

    /// Enforce `0 < min < target < max` and a positive batch size
    pub fn validate(&self) -> Result<()> {
        if self.min_threshold <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "{}: min threshold must be positive",
                self.account
            )));
        }
        if self.target_threshold <= self.min_threshold {
            return Err(Error::Validation(format!(
                "{}: target threshold must be greater than min threshold",
                self.account
            )));
        }
        if self.max_threshold <= self.target_threshold {
            return Err(Error::Validation(format!(
                "{}: max threshold must be greater than target threshold",
                self.account
            )));
        }
        if self.conversion_batch_size <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "{}: conversion batch size must be positive",
                self.account
            )));
        }
        Ok(())
    }

    /// Amount needed to reach target, rounded up to whole batches
    pub fn calculate_replenishment_amount(&self, current_balance: Decimal) -> Decimal {
        if current_balance >= self.target_threshold {
            return Decimal::ZERO;
        }
        let needed = self.target_threshold - current_balance;
        let batches = (needed / self.conversion_batch_size).ceil();
        batches * self.conversion_batch_size
    }

    /// Classify a balance against the thresholds
    pub fn check_health_status(&self, current_balance: Decimal) -> BufferHealth {
        if current_balance < self.min_threshold {
            BufferHealth::CriticalLow
        } else if current_balance < self.target_threshold {
            BufferHealth::BelowTarget
        } else if current_balance > self.max_threshold {
            BufferHealth::OverCapitalized
        } else {
            BufferHealth::Healthy
        }
    }

    /// Snapshot of this buffer at the given balance
    pub fn status(&self, ledger_account: AccountId, current_balance: Decimal) -> BufferStatus {
        BufferStatus {
            account: self.account,
            ledger_account,
            current_balance,
            min_threshold: self.min_threshold,
            target_threshold: self.target_threshold,
            max_threshold: self.max_threshold,
            health: self.check_health_status(current_balance),
            amount_to_target: self.calculate_replenishment_amount(current_balance),
        }
    }
}

/// Point-in-time view of a buffer account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    /// Buffer account
    pub account: BufferAccount,
    /// Ledger account holding the balance
    pub ledger_account: AccountId,
    /// Balance read from the ledger
    pub current_balance: Decimal,
    /// Min threshold
    pub min_threshold: Decimal,
    /// Target threshold
    pub target_threshold: Decimal,
    /// Max threshold
    pub max_threshold: Decimal,
    /// Health classification
    pub health: BufferHealth,
    /// Batch-rounded replenishment amount (zero when at or above target)
    pub amount_to_target: Decimal,
}

impl BufferStatus {
    /// Whether a replenishment conversion is warranted
    pub fn needs_replenishment(&self) -> bool {
        self.health.needs_replenishment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn threshold() -> BufferThreshold {
        BufferThreshold::new(
            BufferAccount::UsdcOnchain,
            dec!(10000),
            dec!(50000),
            dec!(100000),
            dec!(5000),
        )
        .unwrap()
    }

    #[test]
    fn test_critical_low_scenario() {
        let t = threshold();
        assert_eq!(t.check_health_status(dec!(5000)), BufferHealth::CriticalLow);
        // 45,000 short of target is exactly nine batches
        assert_eq!(t.calculate_replenishment_amount(dec!(5000)), dec!(45000));
    }

    #[test]
    fn test_replenishment_rounds_up_to_batch() {
        let t = threshold();
        assert_eq!(t.calculate_replenishment_amount(dec!(49999.99)), dec!(5000));
        assert_eq!(t.calculate_replenishment_amount(dec!(44000)), dec!(10000));
        assert_eq!(t.calculate_replenishment_amount(dec!(50000)), Decimal::ZERO);
        assert_eq!(t.calculate_replenishment_amount(dec!(75000)), Decimal::ZERO);
    }

    #[test]
    fn test_health_boundaries() {
        let t = threshold();
        assert_eq!(t.check_health_status(dec!(9999.99)), BufferHealth::CriticalLow);
        assert_eq!(t.check_health_status(dec!(10000)), BufferHealth::BelowTarget);
        assert_eq!(t.check_health_status(dec!(50000)), BufferHealth::Healthy);
        assert_eq!(t.check_health_status(dec!(100000)), BufferHealth::Healthy);
        assert_eq!(
            t.check_health_status(dec!(100000.01)),
            BufferHealth::OverCapitalized
        );
    }

    #[test]
    fn test_needs_replenishment_only_below_target() {
        assert!(BufferHealth::CriticalLow.needs_replenishment());
        assert!(BufferHealth::BelowTarget.needs_replenishment());
        assert!(!BufferHealth::Healthy.needs_replenishment());
        assert!(!BufferHealth::OverCapitalized.needs_replenishment());
    }

    #[test]
    fn test_validation_rejects_unordered_levels() {
        let make = |min, target, max, batch| {
            BufferThreshold::new(BufferAccount::FiatAtProvider, min, target, max, batch)
        };
        assert!(make(dec!(0), dec!(10), dec!(20), dec!(1)).is_err());
        assert!(make(dec!(10), dec!(10), dec!(20), dec!(1)).is_err());
        assert!(make(dec!(10), dec!(20), dec!(20), dec!(1)).is_err());
        assert!(make(dec!(10), dec!(20), dec!(30), dec!(0)).is_err());
        assert!(make(dec!(10), dec!(20), dec!(30), dec!(1)).is_ok());
    }
}
