//! Failure classification and retry backoff

use crate::Error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Whether a failure may succeed on a fresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, timeout, capacity; retried within budget
    Transient,
    /// Provider rejection or bad data; terminal
    Permanent,
}

impl FailureKind {
    /// Classify an error
    pub fn of(error: &Error) -> Self {
        match error {
            // Retryable errors
            Error::ProviderTransient { .. } => FailureKind::Transient,
            Error::NoProviderAvailable { .. } => FailureKind::Transient,
            Error::Ledger(_) => FailureKind::Transient,
            Error::Database(_) => FailureKind::Transient,
            Error::Io(_) => FailureKind::Transient,

            // Non-retryable errors
            Error::ProviderRejected { .. } => FailureKind::Permanent,
            Error::Validation(_) => FailureKind::Permanent,
            Error::RailNotRegistered(_) => FailureKind::Permanent,
            Error::Config(_) => FailureKind::Permanent,
            Error::Serialization(_) => FailureKind::Permanent,

            _ => FailureKind::Permanent,
        }
    }

    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl FromStr for FailureKind {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            other => Err(Error::Validation(format!("unknown failure kind '{}'", other))),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry budget and backoff shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed per job
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Delay cap
    pub max_delay_ms: u64,
    /// Growth per attempt
    pub backoff_multiplier: f64,
    /// Symmetric jitter as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 30_000,
            max_delay_ms: 900_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1` (0-based), exponential with jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// When a job that has used `retry_count` retries may run again
    pub fn next_retry_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay(retry_count);
        now + ChronoDuration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
    }

    /// Validate shape
    pub fn validate(&self) -> crate::Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry backoff multiplier must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::Config(
                "retry jitter factor must be within 0..=1".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::Config(
                "retry initial delay exceeds max delay".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0).as_millis(), 1000);
        assert_eq!(policy.delay(1).as_millis(), 2000);
        assert_eq!(policy.delay(2).as_millis(), 4000);
        // capped
        assert_eq!(policy.delay(10).as_millis(), 10000);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.1,
            ..no_jitter()
        };
        for _ in 0..100 {
            let ms = policy.delay(1).as_millis();
            assert!((1800..=2200).contains(&ms), "{} out of range", ms);
        }
    }

    #[test]
    fn test_classification() {
        let transient = Error::ProviderTransient {
            provider: "sim".into(),
            message: "timeout".into(),
        };
        let rejected = Error::ProviderRejected {
            provider: "sim".into(),
            code: "invalid_destination".into(),
            message: "bad".into(),
        };
        assert_eq!(FailureKind::of(&transient), FailureKind::Transient);
        assert_eq!(FailureKind::of(&rejected), FailureKind::Permanent);
        assert_eq!(
            FailureKind::of(&Error::Validation("x".into())),
            FailureKind::Permanent
        );
        assert_eq!(
            FailureKind::of(&Error::Ledger("down".into())),
            FailureKind::Transient
        );
        assert_eq!(
            FailureKind::of(&Error::NoProviderAvailable {
                direction: crate::types::ConversionDirection::UsdcToUsd,
                amount: Decimal::ONE,
            }),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            jitter_factor: 2.0,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
