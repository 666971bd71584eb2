//! Operator-driven OTC desk rail
//!
//! Instructions queue as pending until an operator confirms the fill or
//! rejects it. The desk keeps a net position per currency from confirmed
//! fills.

use super::{
    ConversionRail, ConversionRequest, ProviderKind, RailFailure, RailReceipt, RailStatus,
    RailStatusReport,
};
use crate::config::OtcDeskConfig;
use crate::types::Currency;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// Desk decision on an instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeskDecision {
    /// Waiting for an operator
    Open,
    /// Filled
    Confirmed {
        /// Destination amount delivered
        converted_amount: Decimal,
        /// Fill rate
        exchange_rate: Decimal,
        /// Desk fee
        fees: Decimal,
    },
    /// Refused
    Rejected {
        /// Desk reason code
        code: String,
        /// Desk reason
        message: String,
    },
}

/// An instruction sent to the desk
#[derive(Debug, Clone, Serialize)]
pub struct DeskInstruction {
    /// Desk reference
    pub external_tx_id: String,
    /// Original request
    pub request: ConversionRequest,
    /// Current decision
    pub decision: DeskDecision,
    /// Received at
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DeskState {
    by_key: HashMap<String, String>,
    instructions: HashMap<String, DeskInstruction>,
    positions: HashMap<Currency, Decimal>,
}

/// OTC desk rail
#[derive(Debug)]
pub struct OtcDeskRail {
    config: OtcDeskConfig,
    state: RwLock<DeskState>,
}

impl OtcDeskRail {
    /// Create a desk with no open instructions
    pub fn new(config: OtcDeskConfig) -> Self {
        Self {
            config,
            state: RwLock::new(DeskState::default()),
        }
    }

    /// Instructions waiting for an operator
    pub fn open_instructions(&self) -> Vec<DeskInstruction> {
        let mut open: Vec<_> = self
            .state
            .read()
            .instructions
            .values()
            .filter(|i| i.decision == DeskDecision::Open)
            .cloned()
            .collect();
        open.sort_by_key(|i| i.received_at);
        open
    }

    /// Fill an open instruction at `exchange_rate`, net of the desk fee
    pub fn confirm(&self, external_tx_id: &str, exchange_rate: Decimal) -> Result<Decimal> {
        if exchange_rate <= Decimal::ZERO {
            return Err(Error::Validation("exchange rate must be positive".to_string()));
        }

        let mut state = self.state.write();
        let instruction = open_instruction(&mut state, external_tx_id)?;

        let amount = instruction.request.amount;
        let fees = (amount * Decimal::from(self.config.fee_bps) / Decimal::from(10_000)).round_dp(2);
        let converted_amount = ((amount - fees) * exchange_rate).round_dp(2);
        let direction = instruction.request.direction;

        instruction.decision = DeskDecision::Confirmed {
            converted_amount,
            exchange_rate,
            fees,
        };

        *state
            .positions
            .entry(direction.source_currency())
            .or_insert(Decimal::ZERO) += amount;
        *state
            .positions
            .entry(direction.destination_currency())
            .or_insert(Decimal::ZERO) -= converted_amount;

        info!(
            "{} confirmed {} at {}: {} delivered",
            self.config.desk_name, external_tx_id, exchange_rate, converted_amount
        );
        Ok(converted_amount)
    }

    /// Refuse an open instruction
    pub fn reject(&self, external_tx_id: &str, code: &str, message: &str) -> Result<()> {
        let mut state = self.state.write();
        let instruction = open_instruction(&mut state, external_tx_id)?;
        instruction.decision = DeskDecision::Rejected {
            code: code.to_string(),
            message: message.to_string(),
        };
        info!("{} rejected {}: [{}] {}", self.config.desk_name, external_tx_id, code, message);
        Ok(())
    }

    fn not_found(&self, external_tx_id: &str) -> Error {
        Error::ProviderRejected {
            provider: self.config.desk_name.clone(),
            code: "unknown_instruction".to_string(),
            message: format!("no instruction {}", external_tx_id),
        }
    }
}

fn open_instruction<'a>(state: &'a mut DeskState, external_tx_id: &str) -> Result<&'a mut DeskInstruction> {
    let instruction = state
        .instructions
        .get_mut(external_tx_id)
        .ok_or_else(|| Error::Validation(format!("no desk instruction {}", external_tx_id)))?;
    if instruction.decision != DeskDecision::Open {
        return Err(Error::Validation(format!(
            "desk instruction {} already decided",
            external_tx_id
        )));
    }
    Ok(instruction)
}

#[async_trait]
impl ConversionRail for OtcDeskRail {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OtcDesk
    }

    async fn initiate_conversion(&self, request: &ConversionRequest) -> Result<RailReceipt> {
        let mut state = self.state.write();

        let external_tx_id = match state.by_key.get(&request.idempotency_key) {
            Some(existing) => existing.clone(),
            None => {
                let id = format!("otc_{}", Uuid::new_v4().simple());
                state.by_key.insert(request.idempotency_key.clone(), id.clone());
                state.instructions.insert(
                    id.clone(),
                    DeskInstruction {
                        external_tx_id: id.clone(),
                        request: request.clone(),
                        decision: DeskDecision::Open,
                        received_at: Utc::now(),
                    },
                );
                info!(
                    "{} queued {} {} as {}",
                    self.config.desk_name, request.direction, request.amount, id
                );
                id
            }
        };

        Ok(RailReceipt {
            external_tx_id: external_tx_id.clone(),
            status: RailStatus::Pending,
            raw_response: json!({ "desk": self.config.desk_name, "reference": external_tx_id }),
        })
    }

    async fn get_conversion_status(&self, external_tx_id: &str) -> Result<RailStatusReport> {
        let state = self.state.read();
        let instruction = state
            .instructions
            .get(external_tx_id)
            .ok_or_else(|| self.not_found(external_tx_id))?;

        let raw_response = json!({
            "desk": self.config.desk_name,
            "reference": external_tx_id,
            "decision": instruction.decision,
        });

        let report = match &instruction.decision {
            DeskDecision::Open => RailStatusReport {
                status: RailStatus::Pending,
                converted_amount: None,
                exchange_rate: None,
                fees: None,
                failure: None,
                raw_response,
            },
            DeskDecision::Confirmed {
                converted_amount,
                exchange_rate,
                fees,
            } => RailStatusReport {
                status: RailStatus::Completed,
                converted_amount: Some(*converted_amount),
                exchange_rate: Some(*exchange_rate),
                fees: Some(*fees),
                failure: None,
                raw_response,
            },
            DeskDecision::Rejected { code, message } => RailStatusReport {
                status: RailStatus::Failed,
                converted_amount: None,
                exchange_rate: None,
                fees: None,
                failure: Some(RailFailure {
                    code: code.clone(),
                    message: message.clone(),
                    retryable: false,
                }),
                raw_response,
            },
        };

        Ok(report)
    }

    async fn get_balance(&self, currency: Currency) -> Result<Decimal> {
        Ok(self
            .state
            .read()
            .positions
            .get(&currency)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}
