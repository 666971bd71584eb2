//! Simulated conversion rail
//!
//! Converts in-process out of its own liquidity and keeps a custody balance
//! for the fiat it holds on our behalf. Useful for the sandbox node and for
//! exercising the engine end to end.
//!
//! Custody moves when the instruction is accepted: conversions sourced from
//! the custody account draw it down by the full amount, and conversions
//! delivered into it add the converted amount.

use super::{
    ConversionRail, ConversionRequest, ProviderKind, RailFailure, RailReceipt, RailStatus,
    RailStatusReport,
};
use crate::config::SimulatedRailConfig;
use crate::types::Currency;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const PROVIDER: &str = "simulated";

#[derive(Debug, Clone)]
struct SimulatedConversion {
    request: ConversionRequest,
    converted_amount: Decimal,
    fees: Decimal,
    settles_at: DateTime<Utc>,
    failure: Option<RailFailure>,
}

#[derive(Debug, Default)]
struct SimulatedState {
    by_key: HashMap<String, String>,
    conversions: HashMap<String, SimulatedConversion>,
    liquidity: HashMap<Currency, Decimal>,
    custody_usd: Decimal,
}

/// In-process rail with configurable latency, success rate and fees
#[derive(Debug)]
pub struct SimulatedRail {
    config: SimulatedRailConfig,
    state: Mutex<SimulatedState>,
}

impl SimulatedRail {
    /// Create a rail holding the configured liquidity and custody
    pub fn new(config: SimulatedRailConfig) -> Self {
        let mut state = SimulatedState {
            custody_usd: config.opening_custody_usd,
            ..SimulatedState::default()
        };
        state.liquidity.insert(Currency::Usd, config.usd_liquidity);
        state.liquidity.insert(Currency::Usdc, config.usdc_liquidity);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Force a submitted conversion to fail on its next poll
    pub fn fail_conversion(&self, external_tx_id: &str, code: &str, message: &str, retryable: bool) -> Result<()> {
        let mut state = self.state.lock();
        let conversion = state
            .conversions
            .get_mut(external_tx_id)
            .ok_or_else(|| unknown_transaction(external_tx_id))?;
        conversion.failure = Some(RailFailure {
            code: code.to_string(),
            message: message.to_string(),
            retryable,
        });
        Ok(())
    }

    /// Number of distinct conversions accepted
    pub fn conversion_count(&self) -> usize {
        self.state.lock().conversions.len()
    }

    /// What the rail itself can still deliver in a currency
    pub fn liquidity(&self, currency: Currency) -> Decimal {
        self.state
            .lock()
            .liquidity
            .get(&currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn quote(&self, amount: Decimal) -> (Decimal, Decimal) {
        let fees = (amount * Decimal::from(self.config.fee_bps) / Decimal::from(10_000)).round_dp(2);
        let converted = ((amount - fees) * self.config.exchange_rate).round_dp(2);
        (converted, fees)
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }
}

fn unknown_transaction(external_tx_id: &str) -> Error {
    Error::ProviderRejected {
        provider: PROVIDER.to_string(),
        code: "unknown_transaction".to_string(),
        message: format!("no conversion {}", external_tx_id),
    }
}

#[async_trait]
impl ConversionRail for SimulatedRail {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Simulated
    }

    async fn initiate_conversion(&self, request: &ConversionRequest) -> Result<RailReceipt> {
        self.simulate_latency().await;

        if rand::random::<f64>() >= self.config.success_rate {
            return Err(Error::ProviderTransient {
                provider: PROVIDER.to_string(),
                message: "simulated upstream timeout".to_string(),
            });
        }

        let mut state = self.state.lock();

        if let Some(existing) = state.by_key.get(&request.idempotency_key) {
            debug!("Simulated rail replaying {} for {}", existing, request.idempotency_key);
            return Ok(RailReceipt {
                external_tx_id: existing.clone(),
                status: RailStatus::Pending,
                raw_response: json!({ "id": existing, "replayed": true }),
            });
        }

        let (converted_amount, fees) = self.quote(request.amount);
        let source = request.direction.source_currency();
        let destination = request.direction.destination_currency();

        let available = state.liquidity.get(&destination).copied().unwrap_or(Decimal::ZERO);
        if available < converted_amount {
            return Err(Error::ProviderRejected {
                provider: PROVIDER.to_string(),
                code: "insufficient_liquidity".to_string(),
                message: format!(
                    "{} {} requested, {} available",
                    converted_amount, destination, available
                ),
            });
        }

        *state.liquidity.entry(source).or_insert(Decimal::ZERO) += request.amount;
        *state.liquidity.entry(destination).or_insert(Decimal::ZERO) -= converted_amount;

        if request.source_ref == self.config.custody_account {
            state.custody_usd -= request.amount;
        }
        if request.destination_ref == self.config.custody_account {
            state.custody_usd += converted_amount;
        }

        let external_tx_id = format!("sim_{}", Uuid::new_v4().simple());
        let settles_at = Utc::now() + ChronoDuration::seconds(self.config.settle_after_secs as i64);

        state
            .by_key
            .insert(request.idempotency_key.clone(), external_tx_id.clone());
        state.conversions.insert(
            external_tx_id.clone(),
            SimulatedConversion {
                request: request.clone(),
                converted_amount,
                fees,
                settles_at,
                failure: None,
            },
        );

        Ok(RailReceipt {
            external_tx_id: external_tx_id.clone(),
            status: RailStatus::Pending,
            raw_response: json!({
                "id": external_tx_id,
                "status": "pending",
                "quote": { "converted_amount": converted_amount, "fees": fees },
            }),
        })
    }

    async fn get_conversion_status(&self, external_tx_id: &str) -> Result<RailStatusReport> {
        self.simulate_latency().await;

        let state = self.state.lock();
        let conversion = state
            .conversions
            .get(external_tx_id)
            .ok_or_else(|| unknown_transaction(external_tx_id))?;

        if let Some(failure) = &conversion.failure {
            return Ok(RailStatusReport {
                status: RailStatus::Failed,
                converted_amount: None,
                exchange_rate: None,
                fees: None,
                failure: Some(failure.clone()),
                raw_response: json!({
                    "id": external_tx_id,
                    "status": "failed",
                    "error": { "code": failure.code, "message": failure.message },
                }),
            });
        }

        if Utc::now() < conversion.settles_at {
            return Ok(RailStatusReport {
                status: RailStatus::Processing,
                converted_amount: None,
                exchange_rate: None,
                fees: None,
                failure: None,
                raw_response: json!({ "id": external_tx_id, "status": "processing" }),
            });
        }

        Ok(RailStatusReport {
            status: RailStatus::Completed,
            converted_amount: Some(conversion.converted_amount),
            exchange_rate: Some(self.config.exchange_rate),
            fees: Some(conversion.fees),
            failure: None,
            raw_response: json!({
                "id": external_tx_id,
                "status": "completed",
                "job_id": conversion.request.job_id,
                "converted_amount": conversion.converted_amount,
                "fees": conversion.fees,
            }),
        })
    }

    async fn get_balance(&self, currency: Currency) -> Result<Decimal> {
        match currency {
            Currency::Usd => Ok(self.state.lock().custody_usd),
            // USDC is delivered on-chain, never held here
            Currency::Usdc => Ok(Decimal::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, ConversionDirection};
    use rust_decimal_macros::dec;

    fn request(key: &str, amount: Decimal) -> ConversionRequest {
        ConversionRequest {
            job_id: Uuid::new_v4(),
            direction: ConversionDirection::UsdToUsdc,
            amount,
            source_ref: AccountId::new("system:fiat_at_provider"),
            destination_ref: AccountId::new("system:usdc_onchain"),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_converts_with_fee() {
        let rail = SimulatedRail::new(SimulatedRailConfig::default());
        let receipt = rail.initiate_conversion(&request("k1", dec!(10000))).await.unwrap();
        let report = rail.get_conversion_status(&receipt.external_tx_id).await.unwrap();

        assert_eq!(report.status, RailStatus::Completed);
        // 10 bps
        assert_eq!(report.fees, Some(dec!(10)));
        assert_eq!(report.converted_amount, Some(dec!(9990)));
        assert_eq!(rail.liquidity(Currency::Usd), dec!(1010000));
        assert_eq!(rail.liquidity(Currency::Usdc), dec!(990010));
    }

    #[tokio::test]
    async fn test_custody_follows_our_conversions() {
        let rail = SimulatedRail::new(SimulatedRailConfig::default());
        assert_eq!(rail.get_balance(Currency::Usd).await.unwrap(), dec!(100000));

        // paid out of custody in full, fee included
        rail.initiate_conversion(&request("out", dec!(10000))).await.unwrap();
        assert_eq!(rail.get_balance(Currency::Usd).await.unwrap(), dec!(90000));

        // delivered into custody net of fees
        let inbound = ConversionRequest {
            direction: ConversionDirection::UsdcToUsd,
            source_ref: AccountId::new("system:usdc_onchain"),
            destination_ref: AccountId::new("system:fiat_at_provider"),
            ..request("in", dec!(5000))
        };
        rail.initiate_conversion(&inbound).await.unwrap();
        assert_eq!(rail.get_balance(Currency::Usd).await.unwrap(), dec!(94995));

        // other destinations leave custody alone
        let to_broker = ConversionRequest {
            direction: ConversionDirection::UsdcToUsd,
            source_ref: AccountId::new("system:usdc_onchain"),
            destination_ref: AccountId::new("system:broker_operational"),
            ..request("broker", dec!(5000))
        };
        rail.initiate_conversion(&to_broker).await.unwrap();
        assert_eq!(rail.get_balance(Currency::Usd).await.unwrap(), dec!(94995));
        assert_eq!(rail.get_balance(Currency::Usdc).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_idempotent_on_key() {
        let rail = SimulatedRail::new(SimulatedRailConfig::default());
        let first = rail.initiate_conversion(&request("k1", dec!(500))).await.unwrap();
        let second = rail.initiate_conversion(&request("k1", dec!(500))).await.unwrap();

        assert_eq!(first.external_tx_id, second.external_tx_id);
        assert_eq!(rail.conversion_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_success_rate_is_transient() {
        let rail = SimulatedRail::new(SimulatedRailConfig {
            success_rate: 0.0,
            ..SimulatedRailConfig::default()
        });
        let err = rail.initiate_conversion(&request("k1", dec!(500))).await.unwrap_err();
        assert!(matches!(err, Error::ProviderTransient { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_liquidity_is_rejected() {
        let rail = SimulatedRail::new(SimulatedRailConfig {
            usdc_liquidity: dec!(100),
            ..SimulatedRailConfig::default()
        });
        let err = rail.initiate_conversion(&request("k1", dec!(500))).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_liquidity");
    }

    #[tokio::test]
    async fn test_pending_until_settlement_delay() {
        let rail = SimulatedRail::new(SimulatedRailConfig {
            settle_after_secs: 3600,
            ..SimulatedRailConfig::default()
        });
        let receipt = rail.initiate_conversion(&request("k1", dec!(500))).await.unwrap();
        let report = rail.get_conversion_status(&receipt.external_tx_id).await.unwrap();
        assert_eq!(report.status, RailStatus::Processing);

        rail.fail_conversion(&receipt.external_tx_id, "aml_hold", "held", false)
            .unwrap();
        let report = rail.get_conversion_status(&receipt.external_tx_id).await.unwrap();
        assert_eq!(report.status, RailStatus::Failed);
        assert_eq!(report.failure.unwrap().code, "aml_hold");
    }
}
