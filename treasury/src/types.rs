//! Core treasury types
//!
//! Money is always `rust_decimal::Decimal`. Enums persist as their
//! snake_case string form (`as_str` / `FromStr`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger account identifier (`system:usdc_onchain`, `user:<uuid>:usdc`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currencies moved by the treasury
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// US Dollar (fiat)
    Usd,
    /// USD Coin (on-chain stablecoin)
    Usdc,
}

impl Currency {
    /// Currency code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Usdc => "USDC",
        }
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "USD" => Ok(Currency::Usd),
            "USDC" => Ok(Currency::Usdc),
            other => Err(Error::Validation(format!("unknown currency '{}'", other))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Direction of a currency conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionDirection {
    /// Off-ramp: USDC -> USD
    UsdcToUsd,
    /// On-ramp: USD -> USDC
    UsdToUsdc,
}

impl ConversionDirection {
    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionDirection::UsdcToUsd => "usdc_to_usd",
            ConversionDirection::UsdToUsdc => "usd_to_usdc",
        }
    }

    /// Currency debited at the source
    pub fn source_currency(&self) -> Currency {
        match self {
            ConversionDirection::UsdcToUsd => Currency::Usdc,
            ConversionDirection::UsdToUsdc => Currency::Usd,
        }
    }

    /// Currency credited at the destination
    pub fn destination_currency(&self) -> Currency {
        match self {
            ConversionDirection::UsdcToUsd => Currency::Usd,
            ConversionDirection::UsdToUsdc => Currency::Usdc,
        }
    }
}

impl FromStr for ConversionDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "usdc_to_usd" => Ok(ConversionDirection::UsdcToUsd),
            "usd_to_usdc" => Ok(ConversionDirection::UsdToUsdc),
            other => Err(Error::Validation(format!(
                "unknown conversion direction '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ConversionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a conversion job was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionTrigger {
    /// Buffer fell below target
    BufferReplenishment,
    /// Periodic rebalance between buffers
    ScheduledRebalance,
    /// Operator request
    Manual,
    /// Incident response
    Emergency,
}

impl ConversionTrigger {
    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionTrigger::BufferReplenishment => "buffer_replenishment",
            ConversionTrigger::ScheduledRebalance => "scheduled_rebalance",
            ConversionTrigger::Manual => "manual",
            ConversionTrigger::Emergency => "emergency",
        }
    }
}

impl FromStr for ConversionTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "buffer_replenishment" => Ok(ConversionTrigger::BufferReplenishment),
            "scheduled_rebalance" => Ok(ConversionTrigger::ScheduledRebalance),
            "manual" => Ok(ConversionTrigger::Manual),
            "emergency" => Ok(ConversionTrigger::Emergency),
            other => Err(Error::Validation(format!(
                "unknown conversion trigger '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ConversionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System buffer accounts holding pooled operational funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferAccount {
    /// On-chain USDC reserve
    UsdcOnchain,
    /// Fiat held at the conversion provider
    FiatAtProvider,
    /// Cash prefunded at the broker
    BrokerOperational,
}

/// How a buffer is topped up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplenishmentRoute {
    /// Conversion direction
    pub direction: ConversionDirection,
    /// Buffer the funds are taken from
    pub source: BufferAccount,
}

impl BufferAccount {
    /// All buffer accounts
    pub const ALL: [BufferAccount; 3] = [
        BufferAccount::UsdcOnchain,
        BufferAccount::FiatAtProvider,
        BufferAccount::BrokerOperational,
    ];

    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferAccount::UsdcOnchain => "usdc_onchain",
            BufferAccount::FiatAtProvider => "fiat_at_provider",
            BufferAccount::BrokerOperational => "broker_operational",
        }
    }

    /// Currency the buffer is denominated in
    pub fn currency(&self) -> Currency {
        match self {
            BufferAccount::UsdcOnchain => Currency::Usdc,
            BufferAccount::FiatAtProvider | BufferAccount::BrokerOperational => Currency::Usd,
        }
    }

    /// Source buffer and direction used to replenish this buffer
    pub fn replenishment_route(&self) -> ReplenishmentRoute {
        match self {
            BufferAccount::UsdcOnchain => ReplenishmentRoute {
                direction: ConversionDirection::UsdToUsdc,
                source: BufferAccount::FiatAtProvider,
            },
            BufferAccount::FiatAtProvider | BufferAccount::BrokerOperational => {
                ReplenishmentRoute {
                    direction: ConversionDirection::UsdcToUsd,
                    source: BufferAccount::UsdcOnchain,
                }
            }
        }
    }

    /// Default ledger account backing this buffer
    pub fn default_ledger_account(&self) -> AccountId {
        AccountId::new(format!("system:{}", self.as_str()))
    }
}

impl FromStr for BufferAccount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "usdc_onchain" => Ok(BufferAccount::UsdcOnchain),
            "fiat_at_provider" => Ok(BufferAccount::FiatAtProvider),
            "broker_operational" => Ok(BufferAccount::BrokerOperational),
            other => Err(Error::Validation(format!("unknown buffer account '{}'", other))),
        }
    }
}

impl fmt::Display for BufferAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
