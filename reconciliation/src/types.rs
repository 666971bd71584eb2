//! Reconciliation records
//!
//! A run produces one [`ReconciliationReport`], one [`ReconciliationCheck`]
//! per probe, and one [`ReconciliationException`] per failed comparison.
//! Enums persist as their snake_case string form.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use treasury::Currency;
use uuid::Uuid;

/// Resolver recorded on auto-corrected exceptions
pub const SYSTEM_RESOLVER: &str = "system";

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stored string form
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Hourly loop
    Hourly,
    /// Daily loop
    Daily,
    /// Operator request
    Manual,
}

string_enum!(RunType {
    Hourly => "hourly",
    Daily => "daily",
    Manual => "manual",
});

/// Report lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Created, not started
    Pending,
    /// Checks running
    InProgress,
    /// All checks ran (some may have failed)
    Completed,
    /// The run itself could not finish
    Failed,
}

string_enum!(ReportStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

/// Kind of comparison a check performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    /// Ledger debits vs credits
    LedgerConsistency,
    /// Ledger vs conversion provider custody
    ProviderBalance,
    /// Ledger vs on-chain custody
    ChainCustodyBalance,
    /// Ledger vs deposit totals
    DepositTotals,
    /// Ledger postings vs completed conversion jobs
    ConversionJobTotals,
    /// Ledger vs withdrawal totals
    WithdrawalTotals,
}

impl CheckType {
    /// Every check type
    pub const ALL: [CheckType; 6] = [
        CheckType::LedgerConsistency,
        CheckType::ProviderBalance,
        CheckType::ChainCustodyBalance,
        CheckType::DepositTotals,
        CheckType::ConversionJobTotals,
        CheckType::WithdrawalTotals,
    ];
}

string_enum!(CheckType {
    LedgerConsistency => "ledger_consistency",
    ProviderBalance => "provider_balance",
    ChainCustodyBalance => "chain_custody_balance",
    DepositTotals => "deposit_totals",
    ConversionJobTotals => "conversion_job_totals",
    WithdrawalTotals => "withdrawal_totals",
});

/// Exception severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Auto-correctable
    Low,
    /// Needs monitoring
    Medium,
    /// Needs immediate attention
    High,
    /// System integrity at risk
    Critical,
}

string_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Where an exception is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionState {
    /// Waiting for correction or an operator
    Open,
    /// Closed by a compensating posting
    AutoCorrected,
    /// Closed by an operator
    Resolved,
}

string_enum!(ExceptionState {
    Open => "open",
    AutoCorrected => "auto_corrected",
    Resolved => "resolved",
});

/// One reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Report ID
    pub id: Uuid,
    /// What started the run
    pub run_type: RunType,
    /// Lifecycle status
    pub status: ReportStatus,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub completed_at: Option<DateTime<Utc>>,
    /// Checks executed
    pub total_checks: u32,
    /// Checks within tolerance
    pub passed_checks: u32,
    /// Checks outside tolerance or errored
    pub failed_checks: u32,
    /// Exceptions raised
    pub exceptions_count: u32,
    /// Exceptions closed by a compensating posting
    pub auto_corrected_count: u32,
    /// Why the run failed
    pub error_message: Option<String>,
    /// Created at
    pub created_at: DateTime<Utc>,
}

impl ReconciliationReport {
    /// Pending report
    pub fn new(run_type: RunType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_type,
            status: ReportStatus::Pending,
            started_at: now,
            completed_at: None,
            total_checks: 0,
            passed_checks: 0,
            failed_checks: 0,
            exceptions_count: 0,
            auto_corrected_count: 0,
            error_message: None,
            created_at: now,
        }
    }

    /// `pending -> in_progress`
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != ReportStatus::Pending {
            return Err(Error::Validation(format!(
                "report {} is {}, not pending",
                self.id, self.status
            )));
        }
        self.status = ReportStatus::InProgress;
        self.started_at = now;
        Ok(())
    }

    /// Count a finished check
    pub fn record_check(&mut self, check: &ReconciliationCheck) {
        self.total_checks += 1;
        if check.passed {
            self.passed_checks += 1;
        } else {
            self.failed_checks += 1;
        }
    }

    /// Count a raised exception
    pub fn record_exception(&mut self, exception: &ReconciliationException) {
        self.exceptions_count += 1;
        if exception.auto_corrected {
            self.auto_corrected_count += 1;
        }
    }

    /// `in_progress -> completed`
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = ReportStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Mark the run failed
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = ReportStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
    }

    /// Completed or failed
    pub fn is_finished(&self) -> bool {
        matches!(self.status, ReportStatus::Completed | ReportStatus::Failed)
    }
}

/// One comparison within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationCheck {
    /// Check ID
    pub id: Uuid,
    /// Owning report
    pub report_id: Uuid,
    /// Kind of comparison
    pub check_type: CheckType,
    /// Currency compared
    pub currency: Currency,
    /// Source-of-truth side
    pub expected: Decimal,
    /// Observed side
    pub actual: Decimal,
    /// `actual - expected`
    pub difference: Decimal,
    /// Within tolerance
    pub passed: bool,
    /// What was compared (account, feed, ...)
    pub subject: Option<String>,
    /// Probe error, if the comparison could not be made
    pub error_message: Option<String>,
    /// Probe latency
    pub execution_time_ms: u64,
    /// Created at
    pub created_at: DateTime<Utc>,
}

impl ReconciliationCheck {
    /// Check from two readings
    #[allow(clippy::too_many_arguments)]
    pub fn compared(
        report_id: Uuid,
        check_type: CheckType,
        currency: Currency,
        subject: Option<String>,
        expected: Decimal,
        actual: Decimal,
        tolerance: Decimal,
        execution_time_ms: u64,
    ) -> Self {
        let difference = actual - expected;
        Self {
            id: Uuid::new_v4(),
            report_id,
            check_type,
            currency,
            expected,
            actual,
            difference,
            passed: difference.abs() <= tolerance,
            subject,
            error_message: None,
            execution_time_ms,
            created_at: Utc::now(),
        }
    }

    /// Check whose probe failed
    pub fn errored(
        report_id: Uuid,
        check_type: CheckType,
        currency: Currency,
        subject: Option<String>,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            report_id,
            check_type,
            currency,
            expected: Decimal::ZERO,
            actual: Decimal::ZERO,
            difference: Decimal::ZERO,
            passed: false,
            subject,
            error_message: Some(message.into()),
            execution_time_ms,
            created_at: Utc::now(),
        }
    }

    /// Compared but outside tolerance
    pub fn is_discrepancy(&self) -> bool {
        !self.passed && self.error_message.is_none()
    }
}

/// A discrepancy raised by a failed check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationException {
    /// Exception ID
    pub id: Uuid,
    /// Owning report
    pub report_id: Uuid,
    /// Check that raised it
    pub check_id: Uuid,
    /// Kind of comparison
    pub check_type: CheckType,
    /// Severity from the configured thresholds
    pub severity: Severity,
    /// Human-readable summary
    pub description: String,
    /// Source-of-truth side
    pub expected: Decimal,
    /// Observed side
    pub actual: Decimal,
    /// `actual - expected`
    pub difference: Decimal,
    /// Currency
    pub currency: Currency,
    /// User the discrepancy belongs to, if any
    pub affected_user_id: Option<Uuid>,
    /// Account or entity the discrepancy belongs to
    pub affected_entity: Option<String>,
    /// Closed by a compensating posting
    pub auto_corrected: bool,
    /// What the correction did
    pub correction_action: Option<String>,
    /// Closed at
    pub resolved_at: Option<DateTime<Utc>>,
    /// Closed by (`system` for auto-corrections)
    pub resolved_by: Option<String>,
    /// Operator notes
    pub resolution_notes: Option<String>,
    /// Created at
    pub created_at: DateTime<Utc>,
}

impl ReconciliationException {
    /// Open exception for a failed check
    pub fn from_check(
        check: &ReconciliationCheck,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Self {
        let description = format!(
            "{}{}: expected {} {}, found {} (difference {})",
            check.check_type,
            check
                .subject
                .as_deref()
                .map(|s| format!(" for {}", s))
                .unwrap_or_default(),
            check.expected,
            check.currency,
            check.actual,
            check.difference
        );

        Self {
            id: Uuid::new_v4(),
            report_id: check.report_id,
            check_id: check.id,
            check_type: check.check_type,
            severity,
            description,
            expected: check.expected,
            actual: check.actual,
            difference: check.difference,
            currency: check.currency,
            affected_user_id: None,
            affected_entity: check.subject.clone(),
            auto_corrected: false,
            correction_action: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: now,
        }
    }

    /// Lifecycle state
    pub fn state(&self) -> ExceptionState {
        if self.auto_corrected {
            ExceptionState::AutoCorrected
        } else if self.resolved_at.is_some() {
            ExceptionState::Resolved
        } else {
            ExceptionState::Open
        }
    }

    /// Neither corrected nor resolved
    pub fn is_open(&self) -> bool {
        self.state() == ExceptionState::Open
    }

    /// Open and low severity
    pub fn can_auto_correct(&self) -> bool {
        self.severity == Severity::Low && self.is_open()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ExceptionState::Open => Ok(()),
            state => Err(Error::AlreadyClosed { id: self.id, state }),
        }
    }

    /// Close after a compensating posting
    pub fn mark_auto_corrected(
        &mut self,
        action: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.severity != Severity::Low {
            return Err(Error::NotAutoCorrectable {
                id: self.id,
                severity: self.severity,
            });
        }
        self.auto_corrected = true;
        self.correction_action = Some(action.into());
        self.resolved_at = Some(now);
        self.resolved_by = Some(SYSTEM_RESOLVER.to_string());
        Ok(())
    }

    /// Close by an operator
    pub fn resolve(
        &mut self,
        resolver: &str,
        notes: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if resolver.trim().is_empty() {
            return Err(Error::Validation("resolver is required".to_string()));
        }
        self.ensure_open()?;
        self.resolved_at = Some(now);
        self.resolved_by = Some(resolver.to_string());
        self.resolution_notes = Some(notes.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn check(expected: Decimal, actual: Decimal) -> ReconciliationCheck {
        ReconciliationCheck::compared(
            Uuid::new_v4(),
            CheckType::ProviderBalance,
            Currency::Usd,
            Some("system:fiat_at_provider".to_string()),
            expected,
            actual,
            dec!(0.01),
            3,
        )
    }

    #[test]
    fn test_difference_is_actual_minus_expected() {
        let c = check(dec!(100000.00), dec!(99999.50));
        assert_eq!(c.difference, dec!(-0.50));
        assert!(!c.passed);
        assert!(c.is_discrepancy());

        let within = check(dec!(100.00), dec!(100.01));
        assert!(within.passed);
    }

    #[test]
    fn test_errored_check_is_not_a_discrepancy() {
        let c = ReconciliationCheck::errored(
            Uuid::new_v4(),
            CheckType::ChainCustodyBalance,
            Currency::Usdc,
            None,
            "rpc timeout",
            12,
        );
        assert!(!c.passed);
        assert!(!c.is_discrepancy());
    }

    #[test]
    fn test_auto_correct_only_low_and_once() {
        let c = check(dec!(100), dec!(99.5));
        let mut low = ReconciliationException::from_check(&c, Severity::Low, Utc::now());
        assert!(low.can_auto_correct());
        low.mark_auto_corrected("posted 0.50 to suspense", Utc::now()).unwrap();
        assert_eq!(low.state(), ExceptionState::AutoCorrected);
        assert_eq!(low.resolved_by.as_deref(), Some(SYSTEM_RESOLVER));

        assert!(matches!(
            low.mark_auto_corrected("again", Utc::now()),
            Err(Error::AlreadyClosed { .. })
        ));
        assert!(low.resolve("ops", "late", Utc::now()).is_err());

        for severity in [Severity::Medium, Severity::High, Severity::Critical] {
            let mut e = ReconciliationException::from_check(&c, severity, Utc::now());
            assert!(!e.can_auto_correct());
            assert!(matches!(
                e.mark_auto_corrected("nope", Utc::now()),
                Err(Error::NotAutoCorrectable { .. })
            ));
            assert!(e.is_open());
        }
    }

    #[test]
    fn test_manual_resolution_closes_once() {
        let c = check(dec!(5000), dec!(4000));
        let mut e = ReconciliationException::from_check(&c, Severity::High, Utc::now());
        assert!(e.resolve("", "notes", Utc::now()).is_err());

        e.resolve("ops@example.com", "provider statement late", Utc::now())
            .unwrap();
        assert_eq!(e.state(), ExceptionState::Resolved);
        assert!(!e.auto_corrected);
        assert!(matches!(
            e.resolve("someone-else", "again", Utc::now()),
            Err(Error::AlreadyClosed { state: ExceptionState::Resolved, .. })
        ));
    }

    #[test]
    fn test_report_totals() {
        let mut report = ReconciliationReport::new(RunType::Hourly, Utc::now());
        report.start(Utc::now()).unwrap();
        assert!(report.start(Utc::now()).is_err());

        let ok = check(dec!(10), dec!(10));
        let bad = check(dec!(10), dec!(9.5));
        report.record_check(&ok);
        report.record_check(&bad);

        let mut e = ReconciliationException::from_check(&bad, Severity::Low, Utc::now());
        e.mark_auto_corrected("fixed", Utc::now()).unwrap();
        report.record_exception(&e);
        report.complete(Utc::now());

        assert_eq!(report.total_checks, 2);
        assert_eq!(report.passed_checks, 1);
        assert_eq!(report.failed_checks, 1);
        assert_eq!(report.exceptions_count, 1);
        assert_eq!(report.auto_corrected_count, 1);
        assert!(report.is_finished());
    }

    #[test]
    fn test_string_forms_parse_back() {
        for check_type in CheckType::ALL {
            assert_eq!(check_type.as_str().parse::<CheckType>().unwrap(), check_type);
        }
        assert_eq!("in_progress".parse::<ReportStatus>().unwrap(), ReportStatus::InProgress);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("weekly".parse::<RunType>().is_err());
    }
}
