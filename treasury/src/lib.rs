//! Treasury Engine
//!
//! Keeps the operational buffer accounts of a USD / USDC money stack funded.
//!
//! # Architecture
//!
//! 1. **Buffers**: each buffer account has min / target / max thresholds;
//!    balances come from the ledger
//! 2. **Selection**: when a buffer falls below target, the best eligible
//!    conversion provider is picked by priority and success rate
//! 3. **Conversion**: a durable job walks
//!    `pending -> provider_submitted -> provider_processing -> provider_completed -> ledger_updating -> completed`,
//!    persisted with compare-and-set at every step
//! 4. **Ledger**: one balanced entry per job, deduplicated by job ID
//!
//! Two single-flight loops drive the engine: a settlement cycle that
//! retries, submits and replenishes, and a monitor that polls providers and
//! posts ledger entries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treasury::{
//!     Config, InMemoryLedger, InMemoryTreasuryRepository, Metrics, RailRegistry,
//!     TreasuryEngine, TreasuryScheduler,
//! };
//!
//! #[tokio::main]
//! async fn main() -> treasury::Result<()> {
//!     let config = Config::default();
//!     let rails = Arc::new(RailRegistry::build(&config.providers)?);
//!     let engine = Arc::new(TreasuryEngine::new(
//!         &config,
//!         Arc::new(InMemoryTreasuryRepository::new()),
//!         Arc::new(InMemoryLedger::new()),
//!         rails,
//!         Metrics::new()?,
//!     ));
//!     engine.seed_from_config(&config).await?;
//!
//!     let scheduler = TreasuryScheduler::new(engine, config.scheduler.clone());
//!     scheduler.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     scheduler.stop().await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod ledger;
pub mod metrics;
pub mod provider;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod types;

// Re-exports
pub use buffer::{BufferHealth, BufferStatus, BufferThreshold};
pub use config::Config;
pub use engine::{MonitorSummary, SettlementCycleSummary, TreasuryEngine};
pub use error::{Error, Result};
pub use job::{ConversionJob, JobHistoryEntry, JobStatus, NewConversionJob};
pub use ledger::{
    conversion_clearing_account, conversion_fees_account, InMemoryLedger, LedgerEntry,
    LedgerPosting, LedgerService, TrialBalance,
};
pub use metrics::Metrics;
pub use provider::{
    ConversionProvider, ConversionRail, ProviderKind, ProviderStatus, RailRegistry,
};
pub use repository::{InMemoryTreasuryRepository, PgTreasuryRepository, TreasuryRepository};
pub use retry::{FailureKind, RetryPolicy};
pub use scheduler::{spawn_periodic, LoopHandle, SingleFlight, TreasuryScheduler};
pub use types::{AccountId, BufferAccount, ConversionDirection, ConversionTrigger, Currency};
