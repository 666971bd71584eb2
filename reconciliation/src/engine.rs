//! Reconciliation engine
//!
//! A run walks every registered probe that applies to its run type, records
//! one check per probe and one exception per comparison outside tolerance.
//! Low-severity exceptions on an account probe are closed by a compensating
//! posting against the suspense account; anything above low stays open for
//! an operator.
//!
//! A probe that cannot read fails its own check only. A repository failure
//! fails the whole report.

use crate::config::Config;
use crate::metrics::Metrics;
use crate::probes::ReconciliationProbe;
use crate::repository::ReconciliationRepository;
use crate::severity::determine_severity;
use crate::types::{
    ReconciliationCheck, ReconciliationException, ReconciliationReport, RunType, Severity,
};
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use treasury::{AccountId, LedgerEntry, LedgerService};
use uuid::Uuid;

/// Reference prefix of compensating postings
pub const CORRECTION_REFERENCE_PREFIX: &str = "reconciliation:";

/// Entry that moves the ledger account onto the observed figure
///
/// A positive difference (more observed than booked) credits the account
/// from suspense; a negative one debits it into suspense. `None` when there
/// is nothing to move.
pub fn compensating_entry(
    exception: &ReconciliationException,
    account: &AccountId,
    suspense: &AccountId,
) -> Option<LedgerEntry> {
    let (debit_account, credit_account) = if exception.difference > Decimal::ZERO {
        (suspense.clone(), account.clone())
    } else if exception.difference < Decimal::ZERO {
        (account.clone(), suspense.clone())
    } else {
        return None;
    };

    Some(LedgerEntry {
        debit_account,
        credit_account,
        amount: exception.difference.abs(),
        currency: exception.currency,
        reference: format!("{}{}", CORRECTION_REFERENCE_PREFIX, exception.id),
        description: Some(format!(
            "{} auto-correction for report {}",
            exception.check_type, exception.report_id
        )),
    })
}

/// Reconciliation engine
pub struct ReconciliationEngine {
    repository: Arc<dyn ReconciliationRepository>,
    ledger: Arc<dyn LedgerService>,
    probes: Vec<Arc<dyn ReconciliationProbe>>,
    metrics: Metrics,
    config: Config,
}

impl ReconciliationEngine {
    /// Engine with no probes
    pub fn new(
        config: &Config,
        repository: Arc<dyn ReconciliationRepository>,
        ledger: Arc<dyn LedgerService>,
        metrics: Metrics,
    ) -> Self {
        Self {
            repository,
            ledger,
            probes: Vec::new(),
            metrics,
            config: config.clone(),
        }
    }

    /// Add a probe; probes run in registration order
    pub fn with_probe(mut self, probe: Arc<dyn ReconciliationProbe>) -> Self {
        self.register_probe(probe);
        self
    }

    /// Add a probe
    pub fn register_probe(&mut self, probe: Arc<dyn ReconciliationProbe>) {
        debug!(
            "Registered {} probe ({})",
            probe.check_type(),
            probe.subject().unwrap_or_default()
        );
        self.probes.push(probe);
    }

    /// Number of registered probes
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Metrics handle
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run every probe that applies to `run_type`
    ///
    /// Returns the finished report. Its status is `failed` when the
    /// repository broke mid-run; `Err` only when the report itself cannot be
    /// persisted.
    pub async fn run_reconciliation_checks(
        &self,
        run_type: RunType,
    ) -> Result<ReconciliationReport> {
        let started = Instant::now();
        let mut report = ReconciliationReport::new(run_type, Utc::now());
        self.repository.save_report(&report).await?;
        report.start(Utc::now())?;
        self.repository.save_report(&report).await?;

        info!("Starting {} reconciliation run {}", run_type, report.id);
        let in_progress = self
            .metrics
            .runs_in_progress
            .with_label_values(&[run_type.as_str()]);
        in_progress.inc();

        let outcome = self.run_probes(&mut report).await;
        in_progress.dec();

        match outcome {
            Ok(()) => report.complete(Utc::now()),
            Err(e) => {
                error!("Reconciliation run {} failed: {}", report.id, e);
                report.fail(e.to_string(), Utc::now());
            }
        }
        self.repository.save_report(&report).await?;

        self.metrics
            .runs
            .with_label_values(&[run_type.as_str(), report.status.as_str()])
            .inc();
        self.metrics
            .run_duration
            .with_label_values(&[run_type.as_str()])
            .observe(started.elapsed().as_secs_f64());

        info!(
            "Reconciliation run {} {}: {} checks, {} passed, {} failed, {} exceptions ({} auto-corrected)",
            report.id,
            report.status,
            report.total_checks,
            report.passed_checks,
            report.failed_checks,
            report.exceptions_count,
            report.auto_corrected_count
        );

        Ok(report)
    }

    async fn run_probes(&self, report: &mut ReconciliationReport) -> Result<()> {
        for probe in &self.probes {
            if !self.config.runs_check(report.run_type, probe.check_type()) {
                continue;
            }
            self.run_check(report, probe.as_ref()).await?;
        }
        Ok(())
    }

    async fn run_check(
        &self,
        report: &mut ReconciliationReport,
        probe: &dyn ReconciliationProbe,
    ) -> Result<()> {
        let check_type = probe.check_type();
        let currency = probe.currency();

        let started = Instant::now();
        let reading = probe.read().await;
        let elapsed = started.elapsed();
        self.metrics
            .check_duration
            .with_label_values(&[check_type.as_str()])
            .observe(elapsed.as_secs_f64());
        let elapsed_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;

        let check = match reading {
            Ok(reading) => ReconciliationCheck::compared(
                report.id,
                check_type,
                currency,
                probe.subject(),
                reading.expected,
                reading.actual,
                self.config.tolerance_for(check_type),
                elapsed_ms,
            ),
            Err(e) => {
                warn!("{} check could not read its sources: {}", check_type, e);
                ReconciliationCheck::errored(
                    report.id,
                    check_type,
                    currency,
                    probe.subject(),
                    e.to_string(),
                    elapsed_ms,
                )
            }
        };

        self.repository.insert_check(&check).await?;
        report.record_check(&check);

        let result = if check.passed {
            "passed"
        } else if check.error_message.is_some() {
            "error"
        } else {
            "failed"
        };
        self.metrics
            .checks
            .with_label_values(&[check_type.as_str(), result])
            .inc();

        if check.error_message.is_none() {
            self.metrics
                .discrepancy
                .with_label_values(&[check_type.as_str(), currency.code()])
                .set(check.difference.to_f64().unwrap_or_default());
        }

        if !check.is_discrepancy() {
            debug!("{} check {}", check_type, result);
            return Ok(());
        }

        let severity = determine_severity(&self.config.severity, check.difference, currency);
        let mut exception = ReconciliationException::from_check(&check, severity, Utc::now());

        // recorded open before any ledger write
        self.repository.insert_exception(&exception).await?;
        if exception.can_auto_correct() && self.auto_correct(&mut exception, probe).await {
            self.repository.update_exception(&exception).await?;
        }
        report.record_exception(&exception);
        self.metrics
            .exceptions
            .with_label_values(&[check_type.as_str(), severity.as_str()])
            .inc();

        match severity {
            _ if exception.auto_corrected => info!(
                "Exception {} auto-corrected: {}",
                exception.id, exception.description
            ),
            Severity::Low | Severity::Medium => warn!(
                "{} exception {}: {}",
                severity, exception.id, exception.description
            ),
            Severity::High | Severity::Critical => error!(
                "ALERT: {} exception {}: {}",
                severity, exception.id, exception.description
            ),
        }

        Ok(())
    }

    /// Post a compensating entry and close the exception
    ///
    /// Returns whether the exception was closed. A failed posting leaves it
    /// open.
    async fn auto_correct(
        &self,
        exception: &mut ReconciliationException,
        probe: &dyn ReconciliationProbe,
    ) -> bool {
        if !self.config.auto_correct {
            return false;
        }
        let Some(account) = probe.correction_account() else {
            debug!(
                "{} exception {} has no correction account",
                exception.check_type, exception.id
            );
            return false;
        };
        let Some(entry) =
            compensating_entry(exception, &account, &self.config.suspense_account)
        else {
            return false;
        };

        match self.ledger.post_balanced_entry(&entry).await {
            Ok(transaction_id) => {
                let action = format!(
                    "moved {} {} from {} to {} (ledger transaction {})",
                    entry.amount,
                    entry.currency,
                    entry.debit_account,
                    entry.credit_account,
                    transaction_id
                );
                match exception.mark_auto_corrected(action, Utc::now()) {
                    Ok(()) => {
                        self.metrics
                            .auto_corrections
                            .with_label_values(&[exception.check_type.as_str()])
                            .inc();
                        true
                    }
                    Err(e) => {
                        warn!("Could not close exception {}: {}", exception.id, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Auto-correction for exception {} not posted: {}",
                    exception.id, e
                );
                false
            }
        }
    }

    /// Close an exception by an operator
    pub async fn resolve_exception(
        &self,
        exception_id: Uuid,
        resolver: &str,
        notes: &str,
    ) -> Result<ReconciliationException> {
        let mut exception = self
            .repository
            .get_exception(exception_id)
            .await?
            .ok_or(Error::ExceptionNotFound(exception_id))?;
        exception.resolve(resolver, notes, Utc::now())?;
        self.repository.update_exception(&exception).await?;
        info!("Exception {} resolved by {}", exception.id, resolver);
        Ok(exception)
    }

    /// Exceptions neither corrected nor resolved
    pub async fn open_exceptions(&self) -> Result<Vec<ReconciliationException>> {
        self.repository.list_open_exceptions().await
    }

    /// Most recent report
    pub async fn latest_report(&self) -> Result<Option<ReconciliationReport>> {
        self.repository.latest_report().await
    }

    /// Load a report
    pub async fn get_report(&self, report_id: Uuid) -> Result<ReconciliationReport> {
        self.repository
            .get_report(report_id)
            .await?
            .ok_or(Error::ReportNotFound(report_id))
    }

    /// Checks of a report
    pub async fn report_checks(&self, report_id: Uuid) -> Result<Vec<ReconciliationCheck>> {
        self.repository.list_checks(report_id).await
    }

    /// Exceptions of a report
    pub async fn report_exceptions(
        &self,
        report_id: Uuid,
    ) -> Result<Vec<ReconciliationException>> {
        self.repository.list_exceptions(report_id).await
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("probes", &self.probes.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
