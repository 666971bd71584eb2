//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `reconciliation_runs_total` - Runs, by run type and final status
//! - `reconciliation_runs_in_progress` - Runs currently executing, by run type
//! - `reconciliation_run_duration_seconds` - Run latency
//! - `reconciliation_checks_total` - Checks, by type and result (passed / failed / error)
//! - `reconciliation_check_duration_seconds` - Probe latency
//! - `reconciliation_exceptions_total` - Exceptions, by check type and severity
//! - `reconciliation_auto_corrections_total` - Exceptions closed by a compensating posting
//! - `reconciliation_discrepancy_amount` - Last observed difference per check and currency

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Runs by type and status
    pub runs: IntCounterVec,

    /// Runs in progress
    pub runs_in_progress: IntGaugeVec,

    /// Run duration histogram
    pub run_duration: HistogramVec,

    /// Checks by type and result
    pub checks: IntCounterVec,

    /// Check duration histogram
    pub check_duration: HistogramVec,

    /// Exceptions by type and severity
    pub exceptions: IntCounterVec,

    /// Auto-corrections by type
    pub auto_corrections: IntCounterVec,

    /// Last difference per check
    pub discrepancy: GaugeVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Register into a shared registry
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let runs = IntCounterVec::new(
            Opts::new("reconciliation_runs_total", "Reconciliation runs"),
            &["run_type", "status"],
        )?;
        registry.register(Box::new(runs.clone()))?;

        let runs_in_progress = IntGaugeVec::new(
            Opts::new(
                "reconciliation_runs_in_progress",
                "Reconciliation runs currently executing",
            ),
            &["run_type"],
        )?;
        registry.register(Box::new(runs_in_progress.clone()))?;

        let run_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconciliation_run_duration_seconds",
                "Reconciliation run latency",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["run_type"],
        )?;
        registry.register(Box::new(run_duration.clone()))?;

        let checks = IntCounterVec::new(
            Opts::new("reconciliation_checks_total", "Reconciliation checks executed"),
            &["check_type", "result"],
        )?;
        registry.register(Box::new(checks.clone()))?;

        let check_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconciliation_check_duration_seconds",
                "Reconciliation probe latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
            &["check_type"],
        )?;
        registry.register(Box::new(check_duration.clone()))?;

        let exceptions = IntCounterVec::new(
            Opts::new(
                "reconciliation_exceptions_total",
                "Reconciliation exceptions raised",
            ),
            &["check_type", "severity"],
        )?;
        registry.register(Box::new(exceptions.clone()))?;

        let auto_corrections = IntCounterVec::new(
            Opts::new(
                "reconciliation_auto_corrections_total",
                "Exceptions closed by a compensating posting",
            ),
            &["check_type"],
        )?;
        registry.register(Box::new(auto_corrections.clone()))?;

        let discrepancy = GaugeVec::new(
            Opts::new(
                "reconciliation_discrepancy_amount",
                "Last observed difference (actual - expected)",
            ),
            &["check_type", "currency"],
        )?;
        registry.register(Box::new(discrepancy.clone()))?;

        Ok(Self {
            runs,
            runs_in_progress,
            run_duration,
            checks,
            check_duration,
            exceptions,
            auto_corrections,
            discrepancy,
            registry,
        })
    }

    /// Text exposition of every collector in the registry
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
