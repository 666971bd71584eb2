//! Conversion providers
//!
//! A provider has two halves:
//! - [`ConversionProvider`]: the durable record (priority, limits, health
//!   counters) the selector ranks on
//! - [`ConversionRail`]: the live connection that initiates and polls
//!   conversions
//!
//! Rails are built from a fixed set of [`ProviderKind`]s when the process
//! starts. A provider whose rail cannot be built fails startup instead of
//! failing the first conversion routed to it.

pub mod otc_desk;
pub mod simulated;

use crate::config::{ProviderConfig, RailSettings};
use crate::types::{AccountId, ConversionDirection, Currency};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub use otc_desk::OtcDeskRail;
pub use simulated::SimulatedRail;

/// Attempts required before the success rate counts against health
pub const MIN_ATTEMPTS_FOR_HEALTH: u64 = 10;

/// Minimum success rate (percent) for a provider to stay healthy
pub const MIN_HEALTHY_SUCCESS_RATE: f64 = 80.0;

/// Operational status of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Accepting conversions
    Active,
    /// Switched off by operators
    Inactive,
    /// Known to be impaired
    Degraded,
}

impl ProviderStatus {
    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Inactive => "inactive",
            ProviderStatus::Degraded => "degraded",
        }
    }
}

impl FromStr for ProviderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ProviderStatus::Active),
            "inactive" => Ok(ProviderStatus::Inactive),
            "degraded" => Ok(ProviderStatus::Degraded),
            other => Err(Error::Validation(format!("unknown provider status '{}'", other))),
        }
    }
}

/// Rail implementations known to this build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process simulated rail
    Simulated,
    /// Operator-driven OTC desk
    OtcDesk,
}

impl ProviderKind {
    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Simulated => "simulated",
            ProviderKind::OtcDesk => "otc_desk",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simulated" => Ok(ProviderKind::Simulated),
            "otc_desk" => Ok(ProviderKind::OtcDesk),
            other => Err(Error::Validation(format!("unknown provider kind '{}'", other))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable provider record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionProvider {
    /// Provider ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Rail implementation
    pub kind: ProviderKind,
    /// Lower = preferred
    pub priority: i32,
    /// Operational status
    pub status: ProviderStatus,
    /// Handles USDC -> USD
    pub supports_usdc_to_usd: bool,
    /// Handles USD -> USDC
    pub supports_usd_to_usdc: bool,
    /// Smallest accepted conversion
    pub min_conversion_amount: Decimal,
    /// Largest accepted conversion
    pub max_conversion_amount: Option<Decimal>,
    /// Daily volume cap
    pub daily_volume_limit: Option<Decimal>,
    /// Volume converted today
    pub daily_volume_used: Decimal,
    /// Completed conversions
    pub success_count: u64,
    /// Failed conversions
    pub failure_count: u64,
    /// Last completed conversion
    pub last_success_at: Option<DateTime<Utc>>,
    /// Last failed conversion
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Updated at
    pub updated_at: DateTime<Utc>,
}

impl ConversionProvider {
    /// Check record consistency
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("provider name is required".to_string()));
        }
        if self.priority < 1 {
            return Err(Error::Validation(format!(
                "provider {}: priority must be at least 1",
                self.name
            )));
        }
        if self.min_conversion_amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "provider {}: min conversion amount must be positive",
                self.name
            )));
        }
        if let Some(max) = self.max_conversion_amount {
            if max <= self.min_conversion_amount {
                return Err(Error::Validation(format!(
                    "provider {}: max conversion amount must be greater than min",
                    self.name
                )));
            }
        }
        if !self.supports_usdc_to_usd && !self.supports_usd_to_usdc {
            return Err(Error::Validation(format!(
                "provider {}: must support at least one direction",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether the provider handles this direction
    pub fn supports(&self, direction: ConversionDirection) -> bool {
        match direction {
            ConversionDirection::UsdcToUsd => self.supports_usdc_to_usd,
            ConversionDirection::UsdToUsdc => self.supports_usd_to_usdc,
        }
    }

    /// Total recorded attempts
    pub fn total_attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Success rate in percent (0 with no attempts)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_attempts();
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64 * 100.0
    }

    /// Active, and not failing too often once there is enough history
    pub fn is_healthy(&self) -> bool {
        if self.status != ProviderStatus::Active {
            return false;
        }
        if self.total_attempts() >= MIN_ATTEMPTS_FOR_HEALTH
            && self.success_rate() < MIN_HEALTHY_SUCCESS_RATE
        {
            return false;
        }
        true
    }

    /// Volume left under the daily limit (`None` when unlimited)
    pub fn remaining_daily_volume(&self) -> Option<Decimal> {
        self.daily_volume_limit
            .map(|limit| limit - self.daily_volume_used)
    }

    /// Within min/max bounds and remaining daily volume
    pub fn has_capacity(&self, amount: Decimal) -> bool {
        if amount < self.min_conversion_amount {
            return false;
        }
        if let Some(max) = self.max_conversion_amount {
            if amount > max {
                return false;
            }
        }
        if let Some(remaining) = self.remaining_daily_volume() {
            if amount > remaining {
                return false;
            }
        }
        true
    }

    /// Build a record from configuration
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let now = Utc::now();
        let provider = Self {
            id: config.id,
            name: config.name.clone(),
            kind: config.rail.kind(),
            priority: config.priority,
            status: config.status,
            supports_usdc_to_usd: config.supports_usdc_to_usd,
            supports_usd_to_usdc: config.supports_usd_to_usdc,
            min_conversion_amount: config.min_conversion_amount,
            max_conversion_amount: config.max_conversion_amount,
            daily_volume_limit: config.daily_volume_limit,
            daily_volume_used: Decimal::ZERO,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        };
        provider.validate()?;
        Ok(provider)
    }
}

/// Instruction sent to a rail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    /// Job the conversion belongs to
    pub job_id: Uuid,
    /// Direction
    pub direction: ConversionDirection,
    /// Source amount
    pub amount: Decimal,
    /// Source funds reference
    pub source_ref: AccountId,
    /// Destination funds reference
    pub destination_ref: AccountId,
    /// Forwarded so the rail can dedupe resubmissions
    pub idempotency_key: String,
}

/// Rail-side conversion status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RailStatus {
    /// Accepted, not yet started
    Pending,
    /// Being converted
    Processing,
    /// Funds delivered
    Completed,
    /// Conversion failed
    Failed,
}

/// Response to a successful initiate call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailReceipt {
    /// Provider transaction ID
    pub external_tx_id: String,
    /// Status reported at submission
    pub status: RailStatus,
    /// Raw provider payload
    pub raw_response: serde_json::Value,
}

/// Failure reported by a rail for an accepted conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailFailure {
    /// Provider error code
    pub code: String,
    /// Provider error message, verbatim
    pub message: String,
    /// Whether a fresh attempt may succeed
    pub retryable: bool,
}

/// Response to a status poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailStatusReport {
    /// Current status
    pub status: RailStatus,
    /// Destination amount delivered
    pub converted_amount: Option<Decimal>,
    /// Applied exchange rate
    pub exchange_rate: Option<Decimal>,
    /// Fees charged
    pub fees: Option<Decimal>,
    /// Set when `status` is `Failed`
    pub failure: Option<RailFailure>,
    /// Raw provider payload
    pub raw_response: serde_json::Value,
}

/// Live connection to a conversion provider
#[async_trait]
pub trait ConversionRail: Send + Sync {
    /// Rail implementation
    fn kind(&self) -> ProviderKind;

    /// Submit a conversion
    async fn initiate_conversion(&self, request: &ConversionRequest) -> Result<RailReceipt>;

    /// Poll a submitted conversion
    async fn get_conversion_status(&self, external_tx_id: &str) -> Result<RailStatusReport>;

    /// Funds the provider holds for us in a currency
    async fn get_balance(&self, currency: Currency) -> Result<Decimal>;
}

/// Rails by provider ID
#[derive(Default)]
pub struct RailRegistry {
    rails: HashMap<Uuid, Arc<dyn ConversionRail>>,
    otc_desks: HashMap<Uuid, Arc<OtcDeskRail>>,
}

impl RailRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one rail per configured provider
    pub fn build(providers: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();

        for provider in providers {
            if registry.rails.contains_key(&provider.id) {
                return Err(Error::Config(format!(
                    "provider {} configured twice",
                    provider.id
                )));
            }

            match &provider.rail {
                RailSettings::Simulated(settings) => {
                    let rail = Arc::new(SimulatedRail::new(settings.clone()));
                    registry.rails.insert(provider.id, rail);
                }
                RailSettings::OtcDesk(settings) => {
                    let desk = Arc::new(OtcDeskRail::new(settings.clone()));
                    registry.otc_desks.insert(provider.id, desk.clone());
                    registry.rails.insert(provider.id, desk);
                }
            }

            info!(
                "Registered {} rail for provider {} ({})",
                provider.rail.kind(),
                provider.name,
                provider.id
            );
        }

        Ok(registry)
    }

    /// Register a rail built elsewhere; its kind must match the record
    pub fn register(
        &mut self,
        provider: &ConversionProvider,
        rail: Arc<dyn ConversionRail>,
    ) -> Result<()> {
        if rail.kind() != provider.kind {
            return Err(Error::Config(format!(
                "provider {} is {} but rail is {}",
                provider.name,
                provider.kind,
                rail.kind()
            )));
        }
        self.rails.insert(provider.id, rail);
        Ok(())
    }

    /// Fail unless every provider record has a rail of the right kind
    pub fn verify(&self, providers: &[ConversionProvider]) -> Result<()> {
        for provider in providers {
            let rail = self
                .rails
                .get(&provider.id)
                .ok_or(Error::RailNotRegistered(provider.id))?;
            if rail.kind() != provider.kind {
                return Err(Error::Config(format!(
                    "provider {} is {} but rail is {}",
                    provider.name,
                    provider.kind,
                    rail.kind()
                )));
            }
        }
        Ok(())
    }

    /// Rail for a provider
    pub fn rail(&self, provider_id: Uuid) -> Result<Arc<dyn ConversionRail>> {
        self.rails
            .get(&provider_id)
            .cloned()
            .ok_or(Error::RailNotRegistered(provider_id))
    }

    /// Operator handle for an OTC desk provider
    pub fn otc_desk(&self, provider_id: Uuid) -> Option<Arc<OtcDeskRail>> {
        self.otc_desks.get(&provider_id).cloned()
    }

    /// Number of registered rails
    pub fn len(&self) -> usize {
        self.rails.len()
    }

    /// Whether no rail is registered
    pub fn is_empty(&self) -> bool {
        self.rails.is_empty()
    }
}

impl fmt::Debug for RailRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RailRegistry")
            .field("providers", &self.rails.keys().collect::<Vec<_>>())
            .finish()
    }
}
