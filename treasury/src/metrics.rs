//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `treasury_conversion_jobs_created_total` - Jobs created, by trigger
//! - `treasury_job_transitions_total` - Transitions, by new status
//! - `treasury_job_failures_total` - Failures, by failure kind
//! - `treasury_ledger_post_failures_total` - Failed ledger posts
//! - `treasury_ledger_alerts_total` - Ledger posts failing past the alert threshold
//! - `treasury_stale_jobs_total` - Jobs flagged stale
//! - `treasury_cycle_duration_seconds` - Settlement / monitor cycle latency
//! - `treasury_buffer_balance` - Last observed balance per buffer

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Jobs created
    pub jobs_created: IntCounterVec,

    /// Job transitions
    pub job_transitions: IntCounterVec,

    /// Job failures
    pub job_failures: IntCounterVec,

    /// Failed ledger posts
    pub ledger_post_failures: IntCounter,

    /// Ledger alerts
    pub ledger_alerts: IntCounter,

    /// Stale jobs flagged
    pub stale_jobs: IntCounter,

    /// Cycle duration histogram
    pub cycle_duration: HistogramVec,

    /// Buffer balances
    pub buffer_balance: GaugeVec,

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
        let jobs_created = IntCounterVec::new(
            Opts::new(
                "treasury_conversion_jobs_created_total",
                "Conversion jobs created",
            ),
            &["trigger"],
        )?;
        registry.register(Box::new(jobs_created.clone()))?;

        let job_transitions = IntCounterVec::new(
            Opts::new(
                "treasury_job_transitions_total",
                "Conversion job transitions by new status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(job_transitions.clone()))?;

        let job_failures = IntCounterVec::new(
            Opts::new("treasury_job_failures_total", "Conversion job failures"),
            &["kind"],
        )?;
        registry.register(Box::new(job_failures.clone()))?;

        let ledger_post_failures = IntCounter::new(
            "treasury_ledger_post_failures_total",
            "Failed ledger posts for provider-completed jobs",
        )?;
        registry.register(Box::new(ledger_post_failures.clone()))?;

        let ledger_alerts = IntCounter::new(
            "treasury_ledger_alerts_total",
            "Ledger posts failing past the alert threshold",
        )?;
        registry.register(Box::new(ledger_alerts.clone()))?;

        let stale_jobs = IntCounter::new(
            "treasury_stale_jobs_total",
            "Conversion jobs flagged stale",
        )?;
        registry.register(Box::new(stale_jobs.clone()))?;

        let cycle_duration = HistogramVec::new(
            HistogramOpts::new(
                "treasury_cycle_duration_seconds",
                "Settlement and monitor cycle latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["cycle"],
        )?;
        registry.register(Box::new(cycle_duration.clone()))?;

        let buffer_balance = GaugeVec::new(
            Opts::new("treasury_buffer_balance", "Last observed buffer balance"),
            &["buffer"],
        )?;
        registry.register(Box::new(buffer_balance.clone()))?;

        Ok(Self {
            jobs_created,
            job_transitions,
            job_failures,
            ledger_post_failures,
            ledger_alerts,
            stale_jobs,
            cycle_duration,
            buffer_balance,
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
