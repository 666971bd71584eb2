//! Configuration for the treasury engine

use crate::buffer::BufferThreshold;
use crate::provider::{ConversionProvider, ProviderStatus};
use crate::retry::RetryPolicy;
use crate::types::{AccountId, BufferAccount};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Treasury engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Postgres URL; the in-memory repository is used when unset
    pub database_url: Option<String>,

    /// Loop intervals
    pub scheduler: SchedulerConfig,

    /// Engine behaviour
    pub engine: EngineConfig,

    /// Retry budget and backoff for failed conversions
    pub retry: RetryPolicy,

    /// Buffer thresholds seeded into the repository at startup
    pub buffers: Vec<BufferConfig>,

    /// Conversion providers and their rails
    pub providers: Vec<ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "treasury-engine".to_string(),
            database_url: None,
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            retry: RetryPolicy::default(),
            buffers: BufferConfig::defaults(),
            providers: vec![ProviderConfig::sandbox()],
        }
    }
}

/// Loop intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Settlement cycle interval (default: 5 minutes)
    pub settlement_interval_secs: u64,

    /// Job monitor interval (default: 1 minute)
    pub monitor_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            settlement_interval_secs: 300,
            monitor_interval_secs: 60,
        }
    }
}

impl SchedulerConfig {
    /// Settlement interval
    pub fn settlement_interval(&self) -> Duration {
        Duration::from_secs(self.settlement_interval_secs)
    }

    /// Monitor interval
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Provider-side jobs older than this are reported stale (default: 1 hour)
    pub stale_after_secs: u64,

    /// Failed ledger posts before every further failure raises an alert
    pub ledger_alert_after: u32,

    /// Window used to build replenishment idempotency keys; defaults to
    /// the settlement interval when unset
    pub idempotency_window_secs: Option<u64>,

    /// Ledger account override per buffer (default `system:<buffer>`)
    pub ledger_accounts: HashMap<BufferAccount, AccountId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 3600,
            ledger_alert_after: 5,
            idempotency_window_secs: None,
            ledger_accounts: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Ledger account backing a buffer
    pub fn ledger_account(&self, buffer: BufferAccount) -> AccountId {
        self.ledger_accounts
            .get(&buffer)
            .cloned()
            .unwrap_or_else(|| buffer.default_ledger_account())
    }
}

/// Threshold levels for one buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Buffer account
    pub account: BufferAccount,
    /// Critical level
    pub min_threshold: Decimal,
    /// Replenishment target
    pub target_threshold: Decimal,
    /// Over-capitalized level
    pub max_threshold: Decimal,
    /// Replenishment batch size
    pub conversion_batch_size: Decimal,
    /// Operator notes
    #[serde(default)]
    pub notes: Option<String>,
}

impl BufferConfig {
    fn defaults() -> Vec<Self> {
        vec![
            BufferConfig {
                account: BufferAccount::UsdcOnchain,
                min_threshold: Decimal::new(10_000, 0),
                target_threshold: Decimal::new(50_000, 0),
                max_threshold: Decimal::new(100_000, 0),
                conversion_batch_size: Decimal::new(5_000, 0),
                notes: None,
            },
            BufferConfig {
                account: BufferAccount::FiatAtProvider,
                min_threshold: Decimal::new(25_000, 0),
                target_threshold: Decimal::new(100_000, 0),
                max_threshold: Decimal::new(250_000, 0),
                conversion_batch_size: Decimal::new(10_000, 0),
                notes: None,
            },
            BufferConfig {
                account: BufferAccount::BrokerOperational,
                min_threshold: Decimal::new(50_000, 0),
                target_threshold: Decimal::new(200_000, 0),
                max_threshold: Decimal::new(500_000, 0),
                conversion_batch_size: Decimal::new(25_000, 0),
                notes: None,
            },
        ]
    }

    /// Build the validated threshold record
    pub fn to_threshold(&self) -> Result<BufferThreshold> {
        let mut threshold = BufferThreshold::new(
            self.account,
            self.min_threshold,
            self.target_threshold,
            self.max_threshold,
            self.conversion_batch_size,
        )?;
        threshold.notes = self.notes.clone();
        Ok(threshold)
    }
}

/// One conversion provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable provider ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Lower = preferred
    pub priority: i32,
    /// Initial status
    #[serde(default = "default_provider_status")]
    pub status: ProviderStatus,
    /// Handles USDC -> USD
    #[serde(default = "default_true")]
    pub supports_usdc_to_usd: bool,
    /// Handles USD -> USDC
    #[serde(default = "default_true")]
    pub supports_usd_to_usdc: bool,
    /// Smallest accepted conversion
    pub min_conversion_amount: Decimal,
    /// Largest accepted conversion
    #[serde(default)]
    pub max_conversion_amount: Option<Decimal>,
    /// Daily volume cap
    #[serde(default)]
    pub daily_volume_limit: Option<Decimal>,
    /// Rail implementation and its settings
    pub rail: RailSettings,
}

fn default_provider_status() -> ProviderStatus {
    ProviderStatus::Active
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    /// Simulated provider with default limits
    pub fn simulated(name: &str, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            priority,
            status: ProviderStatus::Active,
            supports_usdc_to_usd: true,
            supports_usd_to_usdc: true,
            min_conversion_amount: Decimal::new(100, 0),
            max_conversion_amount: Some(Decimal::new(1_000_000, 0)),
            daily_volume_limit: Some(Decimal::new(10_000_000, 0)),
            rail: RailSettings::Simulated(SimulatedRailConfig::default()),
        }
    }

    fn sandbox() -> Self {
        Self {
            id: Uuid::from_u128(0x5a4d_b0c5_0000_4000_8000_0000_0000_0001),
            ..Self::simulated("sandbox-simulated", 1)
        }
    }
}

/// Rail implementation and its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RailSettings {
    /// In-process simulated rail
    Simulated(SimulatedRailConfig),
    /// Operator-driven OTC desk
    OtcDesk(OtcDeskConfig),
}

impl RailSettings {
    /// Rail kind
    pub fn kind(&self) -> crate::provider::ProviderKind {
        match self {
            RailSettings::Simulated(_) => crate::provider::ProviderKind::Simulated,
            RailSettings::OtcDesk(_) => crate::provider::ProviderKind::OtcDesk,
        }
    }
}

/// Simulated rail settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedRailConfig {
    /// Artificial latency per call
    pub latency_ms: u64,
    /// Probability (0.0 - 1.0) that an initiate call succeeds
    pub success_rate: f64,
    /// Conversions complete this long after initiation
    pub settle_after_secs: u64,
    /// Fee charged in basis points of the source amount
    pub fee_bps: u32,
    /// Destination units per source unit
    pub exchange_rate: Decimal,
    /// Fiat the rail can deliver into USDC to USD conversions
    pub usd_liquidity: Decimal,
    /// USDC the rail can deliver into USD to USDC conversions
    pub usdc_liquidity: Decimal,
    /// Ledger account mirroring the fiat the rail holds for us
    pub custody_account: AccountId,
    /// Fiat held for us on startup
    pub opening_custody_usd: Decimal,
}

impl Default for SimulatedRailConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            success_rate: 1.0,
            settle_after_secs: 0,
            fee_bps: 10, // 0.1%
            exchange_rate: Decimal::ONE,
            usd_liquidity: Decimal::new(1_000_000, 0),
            usdc_liquidity: Decimal::new(1_000_000, 0),
            custody_account: BufferAccount::FiatAtProvider.default_ledger_account(),
            opening_custody_usd: Decimal::new(100_000, 0),
        }
    }
}

/// OTC desk settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtcDeskConfig {
    /// Desk name shown in payloads
    pub desk_name: String,
    /// Fee charged in basis points
    pub fee_bps: u32,
}

impl Default for OtcDeskConfig {
    fn default() -> Self {
        Self {
            desk_name: "otc-desk".to_string(),
            fee_bps: 5,
        }
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

        if let Ok(url) = std::env::var("TREASURY_DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(secs) = env_parse("TREASURY_SETTLEMENT_INTERVAL_SECS")? {
            config.scheduler.settlement_interval_secs = secs;
        }
        if let Some(secs) = env_parse("TREASURY_MONITOR_INTERVAL_SECS")? {
            config.scheduler.monitor_interval_secs = secs;
        }
        if let Some(secs) = env_parse("TREASURY_STALE_AFTER_SECS")? {
            config.engine.stale_after_secs = secs;
        }
        if let Some(attempts) = env_parse("TREASURY_LEDGER_ALERT_AFTER")? {
            config.engine.ledger_alert_after = attempts;
        }
        if let Some(retries) = env_parse("TREASURY_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.settlement_interval_secs == 0 || self.scheduler.monitor_interval_secs == 0 {
            return Err(Error::Config("scheduler intervals must be positive".to_string()));
        }
        if self.engine.idempotency_window_secs == Some(0) {
            return Err(Error::Config("idempotency window must be positive".to_string()));
        }
        self.retry.validate()?;

        let mut buffers = HashSet::new();
        for buffer in &self.buffers {
            if !buffers.insert(buffer.account) {
                return Err(Error::Config(format!("buffer {} configured twice", buffer.account)));
            }
            buffer.to_threshold()?;
        }

        let mut providers = HashSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.id) {
                return Err(Error::Config(format!("provider {} configured twice", provider.id)));
            }
            ConversionProvider::from_config(provider)?;
            if let RailSettings::Simulated(sim) = &provider.rail {
                if !(0.0..=1.0).contains(&sim.success_rate) {
                    return Err(Error::Config(format!(
                        "provider {}: success rate must be within 0..=1",
                        provider.name
                    )));
                }
                if sim.exchange_rate <= Decimal::ZERO {
                    return Err(Error::Config(format!(
                        "provider {}: exchange rate must be positive",
                        provider.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Window for replenishment idempotency keys
    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(
            self.engine
                .idempotency_window_secs
                .unwrap_or(self.scheduler.settlement_interval_secs),
        )
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.settlement_interval_secs, 300);
        assert_eq!(config.scheduler.monitor_interval_secs, 60);
        assert_eq!(config.buffers.len(), 3);
        assert_eq!(config.idempotency_window(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            service_name = "treasury-test"

            [scheduler]
            settlement_interval_secs = 120

            [engine]
            ledger_alert_after = 2

            [engine.ledger_accounts]
            broker_operational = "broker:prefund:usd"

            [[buffers]]
            account = "usdc_onchain"
            min_threshold = "10000"
            target_threshold = "50000"
            max_threshold = "100000"
            conversion_batch_size = "5000"

            [[providers]]
            id = "6b1f8a52-2f51-4a0e-9d8f-3f1f3c0a1b11"
            name = "desk"
            priority = 2
            min_conversion_amount = "1000"

            [providers.rail]
            kind = "otc_desk"
            desk_name = "north"
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.scheduler.settlement_interval_secs, 120);
        assert_eq!(config.scheduler.monitor_interval_secs, 60);
        assert_eq!(config.engine.ledger_alert_after, 2);
        assert_eq!(
            config.engine.ledger_account(BufferAccount::BrokerOperational).as_str(),
            "broker:prefund:usd"
        );
        assert_eq!(
            config.engine.ledger_account(BufferAccount::UsdcOnchain).as_str(),
            "system:usdc_onchain"
        );
        assert_eq!(config.providers.len(), 1);
        assert_eq!(
            config.providers[0].rail.kind(),
            crate::provider::ProviderKind::OtcDesk
        );
        assert!(config.providers[0].supports_usd_to_usdc);
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.buffers[0].target_threshold = config.buffers[0].max_threshold;
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_duplicate_buffers() {
        let mut config = Config::default();
        let dup = config.buffers[0].clone();
        config.buffers.push(dup);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
