//! Reconciliation Engine
//!
//! Re-derives what the ledger should hold and compares it with what the
//! ledger and external systems actually report.
//!
//! # Architecture
//!
//! 1. **Probes**: each probe reads an expected and an actual figure
//!    (trial balance, ledger account vs provider / chain / deposit /
//!    withdrawal feed, conversion job totals vs ledger postings)
//! 2. **Checks**: one row per probe per run, passed when
//!    `|actual - expected|` is within tolerance
//! 3. **Exceptions**: one per failed comparison, classified by
//!    configurable severity bands
//! 4. **Auto-correction**: low-severity drift on a ledger account is closed
//!    by a compensating posting against the suspense account
//!
//! Hourly and daily loops run on the same single-flight runner as the
//! treasury scheduler.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod probes;
pub mod repository;
pub mod scheduler;
pub mod severity;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::{compensating_entry, ReconciliationEngine};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use probes::{
    BalanceFeed, ConversionJobTotalsProbe, LedgerAccountProbe, LedgerConsistencyProbe,
    ProbeReading, RailBalanceFeed, ReconciliationProbe, ReportedBalanceFeed,
};
pub use repository::{
    InMemoryReconciliationRepository, PgReconciliationRepository, ReconciliationRepository,
};
pub use scheduler::ReconciliationScheduler;
pub use severity::{determine_severity, SeverityPolicy, SeverityThresholds};
pub use types::{
    CheckType, ExceptionState, ReconciliationCheck, ReconciliationException,
    ReconciliationReport, ReportStatus, RunType, Severity,
};
