//! Conversion job state machine
//!
//! ```text
//! pending -> provider_submitted -> provider_processing -> provider_completed -> ledger_updating -> completed
//!    |              |                      |
//!    +--------------+----------------------+-> failed -> pending (retry) | cancelled
//! ```
//!
//! Every mutator checks the transition table first and leaves the job
//! untouched on an illegal move. Persisting the result is the caller's job.

use crate::ledger::{conversion_clearing_account, conversion_fees_account, LedgerEntry};
use crate::provider::ConversionProvider;
use crate::retry::FailureKind;
use crate::types::{AccountId, ConversionDirection, ConversionTrigger};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Conversion job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet sent to a provider
    Pending,
    /// Provider accepted the instruction
    ProviderSubmitted,
    /// Provider is converting
    ProviderProcessing,
    /// Provider delivered the funds
    ProviderCompleted,
    /// Posting the ledger entry
    LedgerUpdating,
    /// Ledger entry posted
    Completed,
    /// Provider or validation failure
    Failed,
    /// Cancelled by an operator
    Cancelled,
}

impl JobStatus {
    /// All statuses
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::ProviderSubmitted,
        JobStatus::ProviderProcessing,
        JobStatus::ProviderCompleted,
        JobStatus::LedgerUpdating,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::ProviderSubmitted => "provider_submitted",
            JobStatus::ProviderProcessing => "provider_processing",
            JobStatus::ProviderCompleted => "provider_completed",
            JobStatus::LedgerUpdating => "ledger_updating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the transition table has an edge `self -> to`
    ///
    /// `failed -> pending` is additionally gated on
    /// [`ConversionJob::can_retry`].
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, ProviderSubmitted)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (ProviderSubmitted, ProviderProcessing)
                | (ProviderSubmitted, ProviderCompleted)
                | (ProviderSubmitted, Failed)
                | (ProviderProcessing, ProviderCompleted)
                | (ProviderProcessing, Failed)
                | (ProviderCompleted, LedgerUpdating)
                | (LedgerUpdating, Completed)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }

    /// Waiting on the provider
    pub fn is_with_provider(&self) -> bool {
        matches!(self, JobStatus::ProviderSubmitted | JobStatus::ProviderProcessing)
    }

    /// Provider is done, ledger is not
    pub fn awaits_ledger(&self) -> bool {
        matches!(self, JobStatus::ProviderCompleted | JobStatus::LedgerUpdating)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown job status '{}'", s)))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a new conversion job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversionJob {
    /// Direction
    pub direction: ConversionDirection,
    /// Source amount
    pub amount: Decimal,
    /// Why the job exists
    pub trigger: ConversionTrigger,
    /// Ledger account debited on completion
    pub source_account: AccountId,
    /// Ledger account credited on completion
    pub destination_account: AccountId,
    /// Unique key; a second job with the same key is never created
    pub idempotency_key: String,
    /// Free-form notes
    pub notes: Option<String>,
}

impl NewConversionJob {
    /// Reject malformed requests before anything is persisted
    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "conversion amount must be positive, got {}",
                self.amount
            )));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(Error::Validation("idempotency key is required".to_string()));
        }
        if self.source_account == self.destination_account {
            return Err(Error::Validation(format!(
                "source and destination are both {}",
                self.source_account
            )));
        }
        Ok(())
    }
}

/// A durable conversion between buffer accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    /// Job ID
    pub id: Uuid,
    /// Direction
    pub direction: ConversionDirection,
    /// Source amount
    pub amount: Decimal,
    /// Current status
    pub status: JobStatus,
    /// Why the job exists
    pub trigger: ConversionTrigger,

    /// Selected provider
    pub provider_id: Option<Uuid>,
    /// Selected provider name
    pub provider_name: Option<String>,
    /// Provider transaction ID
    pub external_tx_id: Option<String>,
    /// Last raw provider payload
    pub provider_response: Option<serde_json::Value>,

    /// Ledger transaction written on completion
    pub ledger_transaction_id: Option<Uuid>,
    /// Ledger account debited
    pub source_account: AccountId,
    /// Ledger account credited
    pub destination_account: AccountId,

    /// Destination amount delivered by the provider
    pub converted_amount: Option<Decimal>,
    /// Applied rate
    pub exchange_rate: Option<Decimal>,
    /// Provider fees
    pub fees: Option<Decimal>,

    /// Created for execution at
    pub scheduled_at: DateTime<Utc>,
    /// Accepted by provider at
    pub submitted_at: Option<DateTime<Utc>>,
    /// Provider finished at
    pub provider_completed_at: Option<DateTime<Utc>>,
    /// Ledger posted at
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure at
    pub failed_at: Option<DateTime<Utc>>,

    /// Last error message
    pub error_message: Option<String>,
    /// Last error code
    pub error_code: Option<String>,
    /// Classification of the last failure
    pub failure_kind: Option<FailureKind>,
    /// Retries consumed
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Earliest time the retry pass may pick the job up
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Failed ledger posts while in `ledger_updating`
    pub ledger_attempts: u32,
    /// When the job was first reported stale
    pub stale_flagged_at: Option<DateTime<Utc>>,

    /// Unique idempotency key
    pub idempotency_key: String,
    /// Free-form notes
    pub notes: Option<String>,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Updated at
    pub updated_at: DateTime<Utc>,
}

impl ConversionJob {
    /// Build a pending job
    pub fn new(request: NewConversionJob, max_retries: u32, now: DateTime<Utc>) -> Result<Self> {
        request.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            direction: request.direction,
            amount: request.amount,
            status: JobStatus::Pending,
            trigger: request.trigger,
            provider_id: None,
            provider_name: None,
            external_tx_id: None,
            provider_response: None,
            ledger_transaction_id: None,
            source_account: request.source_account,
            destination_account: request.destination_account,
            converted_amount: None,
            exchange_rate: None,
            fees: None,
            scheduled_at: now,
            submitted_at: None,
            provider_completed_at: None,
            completed_at: None,
            failed_at: None,
            error_message: None,
            error_code: None,
            failure_kind: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            ledger_attempts: 0,
            stale_flagged_at: None,
            idempotency_key: request.idempotency_key,
            notes: request.notes,
            created_at: now,
            updated_at: now,
        })
    }

    /// Failed transiently with retry budget left
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed
            && self.failure_kind == Some(FailureKind::Transient)
            && self.retry_count < self.max_retries
    }

    /// No further transition will happen without an operator
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// Failed and due for the retry pass
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.can_retry() && self.next_retry_at.map_or(true, |at| at <= now)
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<JobStatus> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        if from == JobStatus::Failed && to == JobStatus::Pending && !self.can_retry() {
            return Err(Error::InvalidTransition { from, to });
        }
        self.status = to;
        self.updated_at = now;
        Ok(from)
    }

    /// Record the provider picked by the selector
    pub fn assign_provider(&mut self, provider: &ConversionProvider) {
        self.provider_id = Some(provider.id);
        self.provider_name = Some(provider.name.clone());
    }

    /// `pending -> provider_submitted`
    pub fn mark_submitted(
        &mut self,
        external_tx_id: String,
        raw_response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let from = self.transition(JobStatus::ProviderSubmitted, now)?;
        self.external_tx_id = Some(external_tx_id);
        self.provider_response = Some(raw_response);
        self.submitted_at = Some(now);
        Ok(from)
    }

    /// `provider_submitted -> provider_processing`
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<JobStatus> {
        self.transition(JobStatus::ProviderProcessing, now)
    }

    /// Provider delivered: capture amounts
    pub fn mark_provider_completed(
        &mut self,
        converted_amount: Decimal,
        exchange_rate: Option<Decimal>,
        fees: Option<Decimal>,
        raw_response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let from = self.transition(JobStatus::ProviderCompleted, now)?;
        self.converted_amount = Some(converted_amount);
        self.exchange_rate = exchange_rate;
        self.fees = fees;
        self.provider_response = Some(raw_response);
        self.provider_completed_at = Some(now);
        Ok(from)
    }

    /// `provider_completed -> ledger_updating`
    pub fn begin_ledger_update(&mut self, now: DateTime<Utc>) -> Result<JobStatus> {
        self.transition(JobStatus::LedgerUpdating, now)
    }

    /// A ledger post failed; the job stays in `ledger_updating`
    pub fn record_ledger_failure(&mut self, message: String, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::LedgerUpdating {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: JobStatus::LedgerUpdating,
            });
        }
        self.ledger_attempts += 1;
        self.error_code = Some("ledger".to_string());
        self.error_message = Some(message);
        self.updated_at = now;
        Ok(())
    }

    /// `ledger_updating -> completed`
    pub fn mark_completed(&mut self, ledger_transaction_id: Uuid, now: DateTime<Utc>) -> Result<JobStatus> {
        let from = self.transition(JobStatus::Completed, now)?;
        self.ledger_transaction_id = Some(ledger_transaction_id);
        self.completed_at = Some(now);
        self.error_code = None;
        self.error_message = None;
        Ok(from)
    }

    /// Move to `failed`
    ///
    /// `next_retry_at` is only kept for transient failures.
    pub fn mark_failed(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        kind: FailureKind,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let from = self.transition(JobStatus::Failed, now)?;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.failure_kind = Some(kind);
        self.failed_at = Some(now);
        self.next_retry_at = match kind {
            FailureKind::Transient => next_retry_at,
            FailureKind::Permanent => None,
        };
        Ok(from)
    }

    /// `failed -> pending`, consuming one retry
    ///
    /// Provider fields are cleared so the selector runs again.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<JobStatus> {
        let from = self.transition(JobStatus::Pending, now)?;
        self.retry_count += 1;
        self.next_retry_at = None;
        self.provider_id = None;
        self.provider_name = None;
        self.external_tx_id = None;
        self.stale_flagged_at = None;
        Ok(from)
    }

    /// Key sent to the provider for the current attempt
    ///
    /// The first attempt uses the job's own key. Each retry gets a fresh key
    /// so a provider replaying by key cannot hand back the failed conversion.
    pub fn provider_idempotency_key(&self) -> String {
        if self.retry_count == 0 {
            self.idempotency_key.clone()
        } else {
            format!("{}:retry:{}", self.idempotency_key, self.retry_count)
        }
    }

    /// Reference of the leg debiting the source buffer
    pub fn source_leg_reference(&self) -> String {
        format!("{}:source", self.id)
    }

    /// Reference of the leg booking provider fees
    pub fn fee_leg_reference(&self) -> String {
        format!("{}:fee", self.id)
    }

    /// Reference of the leg crediting the destination buffer
    pub fn destination_leg_reference(&self) -> String {
        format!("{}:destination", self.id)
    }

    /// Balanced entries settling a provider-completed conversion
    ///
    /// The source buffer gives up the full source amount and the destination
    /// buffer receives the converted amount, each through the clearing
    /// account of its own currency. Fees move from source clearing to the
    /// fees account.
    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let converted = self.converted_amount.ok_or_else(|| {
            Error::Validation(format!("job {} has no converted amount", self.id))
        })?;
        let source = self.direction.source_currency();
        let destination = self.direction.destination_currency();
        let via = self.provider_name.as_deref().unwrap_or("provider");

        let mut entries = vec![LedgerEntry {
            debit_account: self.source_account.clone(),
            credit_account: conversion_clearing_account(source),
            amount: self.amount,
            currency: source,
            reference: self.source_leg_reference(),
            description: Some(format!("{} conversion via {}: source leg", self.direction, via)),
        }];

        if let Some(fees) = self.fees.filter(|fees| *fees > Decimal::ZERO) {
            entries.push(LedgerEntry {
                debit_account: conversion_clearing_account(source),
                credit_account: conversion_fees_account(source),
                amount: fees,
                currency: source,
                reference: self.fee_leg_reference(),
                description: Some(format!("{} fee charged by {}", self.direction, via)),
            });
        }

        entries.push(LedgerEntry {
            debit_account: conversion_clearing_account(destination),
            credit_account: self.destination_account.clone(),
            amount: converted,
            currency: destination,
            reference: self.destination_leg_reference(),
            description: Some(format!(
                "{} conversion via {}: destination leg",
                self.direction, via
            )),
        });

        Ok(entries)
    }

    /// Operator cancellation (`pending` or `failed` only)
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<JobStatus> {
        let from = self.transition(JobStatus::Cancelled, now)?;
        self.notes = Some(reason.into());
        self.next_retry_at = None;
        Ok(from)
    }
}

/// Append-only audit record of a job transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    /// Entry ID
    pub id: Uuid,
    /// Job ID
    pub job_id: Uuid,
    /// Status before (`None` on creation)
    pub previous_status: Option<JobStatus>,
    /// Status after
    pub new_status: JobStatus,
    /// Human-readable note
    pub notes: Option<String>,
    /// Provider, amounts and error at the time of the transition
    pub metadata: serde_json::Value,
    /// Recorded at
    pub created_at: DateTime<Utc>,
}

impl JobHistoryEntry {
    /// Snapshot the job after a transition from `previous_status`
    pub fn record(
        job: &ConversionJob,
        previous_status: Option<JobStatus>,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            previous_status,
            new_status: job.status,
            notes: Some(notes.into()),
            metadata: json!({
                "provider_id": job.provider_id,
                "provider_name": job.provider_name,
                "external_tx_id": job.external_tx_id,
                "amount": job.amount,
                "converted_amount": job.converted_amount,
                "retry_count": job.retry_count,
                "ledger_attempts": job.ledger_attempts,
                "error_code": job.error_code,
                "error_message": job.error_message,
            }),
            created_at: job.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Currency;
    use rust_decimal_macros::dec;

    fn pending_job(max_retries: u32) -> ConversionJob {
        ConversionJob::new(
            NewConversionJob {
                direction: ConversionDirection::UsdToUsdc,
                amount: dec!(45000),
                trigger: ConversionTrigger::BufferReplenishment,
                source_account: AccountId::new("system:fiat_at_provider"),
                destination_account: AccountId::new("system:usdc_onchain"),
                idempotency_key: "buffer_replenishment:usdc_onchain:usd_to_usdc:0".to_string(),
                notes: None,
            },
            max_retries,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_happy_path() {
        let now = Utc::now();
        let mut job = pending_job(3);
        job.mark_submitted("ext-1".into(), json!({}), now).unwrap();
        job.mark_processing(now).unwrap();
        job.mark_provider_completed(dec!(44955), Some(dec!(0.999)), Some(dec!(45)), json!({}), now)
            .unwrap();
        job.begin_ledger_update(now).unwrap();
        let ledger_tx = Uuid::new_v4();
        job.mark_completed(ledger_tx, now).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.ledger_transaction_id, Some(ledger_tx));
        assert!(job.is_terminal());
    }

    #[test]
    fn test_ledger_entries_book_source_fee_and_destination() {
        let now = Utc::now();
        let mut job = pending_job(3);
        assert!(job.ledger_entries().is_err());

        job.mark_submitted("ext-1".into(), json!({}), now).unwrap();
        job.mark_provider_completed(dec!(44955), Some(Decimal::ONE), Some(dec!(45)), json!({}), now)
            .unwrap();
        let entries = job.ledger_entries().unwrap();
        assert_eq!(entries.len(), 3);

        let source = &entries[0];
        assert_eq!(source.debit_account, AccountId::new("system:fiat_at_provider"));
        assert_eq!(source.amount, dec!(45000));
        assert_eq!(source.currency, Currency::Usd);

        let fee = &entries[1];
        assert_eq!(fee.credit_account, conversion_fees_account(Currency::Usd));
        assert_eq!(fee.amount, dec!(45));

        let destination = &entries[2];
        assert_eq!(destination.credit_account, AccountId::new("system:usdc_onchain"));
        assert_eq!(destination.amount, dec!(44955));
        assert_eq!(destination.currency, Currency::Usdc);
        assert_eq!(destination.reference, job.destination_leg_reference());

        job.fees = Some(Decimal::ZERO);
        assert_eq!(job.ledger_entries().unwrap().len(), 2);
    }

    #[test]
    fn test_each_retry_gets_a_fresh_provider_key() {
        let now = Utc::now();
        let mut job = pending_job(3);
        assert_eq!(job.provider_idempotency_key(), job.idempotency_key);

        job.mark_failed("timeout", "upstream timeout", FailureKind::Transient, None, now)
            .unwrap();
        job.reset_for_retry(now).unwrap();
        assert_eq!(
            job.provider_idempotency_key(),
            format!("{}:retry:1", job.idempotency_key)
        );
    }

    #[test]
    fn test_completed_requires_ledger_updating() {
        let now = Utc::now();
        let mut job = pending_job(3);
        job.mark_submitted("ext-1".into(), json!({}), now).unwrap();
        job.mark_provider_completed(dec!(1), None, None, json!({}), now).unwrap();

        let err = job.mark_completed(Uuid::new_v4(), now).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: JobStatus::ProviderCompleted,
                to: JobStatus::Completed
            }
        ));
        assert_eq!(job.status, JobStatus::ProviderCompleted);
    }

    #[test]
    fn test_permanent_failure_is_terminal() {
        let now = Utc::now();
        let mut job = pending_job(3);
        job.mark_failed("invalid_destination", "bad account", FailureKind::Permanent, Some(now), now)
            .unwrap();

        assert!(!job.can_retry());
        assert!(job.is_terminal());
        assert_eq!(job.retry_count, 0);
        assert!(job.next_retry_at.is_none());
        assert!(job.reset_for_retry(now).is_err());
    }

    #[test]
    fn test_transient_failure_retries_until_budget_spent() {
        let now = Utc::now();
        let mut job = pending_job(2);

        for attempt in 1..=2 {
            job.mark_failed("provider_unavailable", "timeout", FailureKind::Transient, None, now)
                .unwrap();
            assert!(job.can_retry());
            job.reset_for_retry(now).unwrap();
            assert_eq!(job.retry_count, attempt);
        }

        job.mark_failed("provider_unavailable", "timeout", FailureKind::Transient, None, now)
            .unwrap();
        assert!(!job.can_retry());
        assert!(job.is_terminal());
    }

    #[test]
    fn test_cancel_only_from_pending_or_failed() {
        let now = Utc::now();
        let mut job = pending_job(3);
        job.mark_submitted("ext-1".into(), json!({}), now).unwrap();
        assert!(job.cancel("operator", now).is_err());

        let mut job = pending_job(3);
        job.cancel("operator", now).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let mut job = pending_job(3);
        job.mark_failed("x", "y", FailureKind::Permanent, None, now).unwrap();
        job.cancel("operator", now).unwrap();
        assert!(job.is_terminal());
    }

    #[test]
    fn test_transition_table_rejects_skips() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::ProviderCompleted.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::LedgerUpdating.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Pending));
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_monitor_phases_do_not_overlap() {
        let with_provider: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|s| s.is_with_provider())
            .collect();
        let awaiting_ledger: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|s| s.awaits_ledger())
            .collect();
        assert_eq!(
            with_provider,
            vec![JobStatus::ProviderSubmitted, JobStatus::ProviderProcessing]
        );
        assert_eq!(
            awaiting_ledger,
            vec![JobStatus::ProviderCompleted, JobStatus::LedgerUpdating]
        );
    }

    #[test]
    fn test_new_job_validation() {
        let base = NewConversionJob {
            direction: ConversionDirection::UsdcToUsd,
            amount: dec!(0),
            trigger: ConversionTrigger::Manual,
            source_account: AccountId::new("system:usdc_onchain"),
            destination_account: AccountId::new("system:broker_operational"),
            idempotency_key: "manual-1".to_string(),
            notes: None,
        };
        assert!(ConversionJob::new(base.clone(), 3, Utc::now()).is_err());

        let mut blank_key = base.clone();
        blank_key.amount = dec!(10);
        blank_key.idempotency_key = " ".to_string();
        assert!(ConversionJob::new(blank_key, 3, Utc::now()).is_err());
    }
}
