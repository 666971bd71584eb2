//! Configuration for the reconciliation engine

use crate::severity::{SeverityPolicy, SeverityThresholds};
use crate::types::{CheckType, RunType};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use treasury::AccountId;

/// Ledger account that absorbs auto-corrections
pub const DEFAULT_SUSPENSE_ACCOUNT: &str = "system:reconciliation_suspense";

/// Reconciliation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Postgres URL; the in-memory repository is used when unset
    pub database_url: Option<String>,

    /// Loop intervals
    pub schedule: ScheduleConfig,

    /// Largest `|difference|` a check may show and still pass
    pub tolerance: Decimal,

    /// Per-check tolerance
    pub tolerance_overrides: HashMap<CheckType, Decimal>,

    /// Severity bands
    pub severity: SeverityPolicy,

    /// Counter-account for compensating postings
    pub suspense_account: AccountId,

    /// Post compensating entries for low-severity exceptions
    pub auto_correct: bool,

    /// Checks run by the hourly loop; daily and manual runs execute every check
    pub hourly_checks: Vec<CheckType>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            schedule: ScheduleConfig::default(),
            tolerance: Decimal::new(1, 2),
            tolerance_overrides: HashMap::new(),
            severity: SeverityPolicy::default(),
            suspense_account: AccountId::new(DEFAULT_SUSPENSE_ACCOUNT),
            auto_correct: true,
            hourly_checks: vec![
                CheckType::LedgerConsistency,
                CheckType::ProviderBalance,
                CheckType::ConversionJobTotals,
            ],
        }
    }
}

/// Loop intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Hourly run interval (default: 1 hour)
    pub hourly_interval_secs: u64,

    /// Daily run interval (default: 24 hours)
    pub daily_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hourly_interval_secs: 3600,
            daily_interval_secs: 86_400,
        }
    }
}

impl ScheduleConfig {
    /// Hourly interval
    pub fn hourly_interval(&self) -> Duration {
        Duration::from_secs(self.hourly_interval_secs)
    }

    /// Daily interval
    pub fn daily_interval(&self) -> Duration {
        Duration::from_secs(self.daily_interval_secs)
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("RECONCILIATION_DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(secs) = env_parse("RECONCILIATION_HOURLY_INTERVAL_SECS")? {
            config.schedule.hourly_interval_secs = secs;
        }
        if let Some(secs) = env_parse("RECONCILIATION_DAILY_INTERVAL_SECS")? {
            config.schedule.daily_interval_secs = secs;
        }
        if let Some(tolerance) = env_parse("RECONCILIATION_TOLERANCE")? {
            config.tolerance = tolerance;
        }
        if let Some(low) = env_parse("RECONCILIATION_SEVERITY_LOW")? {
            config.severity.default.low = low;
        }
        if let Some(medium) = env_parse("RECONCILIATION_SEVERITY_MEDIUM")? {
            config.severity.default.medium = medium;
        }
        if let Some(high) = env_parse("RECONCILIATION_SEVERITY_HIGH")? {
            config.severity.default.high = high;
        }
        if let Ok(account) = std::env::var("RECONCILIATION_SUSPENSE_ACCOUNT") {
            config.suspense_account = AccountId::new(account);
        }
        if let Some(enabled) = env_parse("RECONCILIATION_AUTO_CORRECT")? {
            config.auto_correct = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.schedule.hourly_interval_secs == 0 || self.schedule.daily_interval_secs == 0 {
            return Err(Error::Config("schedule intervals must be positive".to_string()));
        }
        if self.tolerance < Decimal::ZERO {
            return Err(Error::Config("tolerance must not be negative".to_string()));
        }
        if let Some((check, _)) = self
            .tolerance_overrides
            .iter()
            .find(|(_, tolerance)| **tolerance < Decimal::ZERO)
        {
            return Err(Error::Config(format!(
                "{} tolerance must not be negative",
                check
            )));
        }
        if self.suspense_account.as_str().is_empty() {
            return Err(Error::Config("suspense account is required".to_string()));
        }
        self.severity.validate()
    }

    /// Tolerance for a check type
    pub fn tolerance_for(&self, check_type: CheckType) -> Decimal {
        self.tolerance_overrides
            .get(&check_type)
            .copied()
            .unwrap_or(self.tolerance)
    }

    /// Whether a run of `run_type` executes `check_type`
    pub fn runs_check(&self, run_type: RunType, check_type: CheckType) -> bool {
        match run_type {
            RunType::Hourly => self.hourly_checks.contains(&check_type),
            RunType::Daily | RunType::Manual => true,
        }
    }

    /// Severity bands for the deployment default
    pub fn default_severity(&self) -> &SeverityThresholds {
        &self.severity.default
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, value))),
        Err(_) => Ok(None),
    }
}
