//! Error types for the treasury engine

use crate::job::JobStatus;
use crate::types::ConversionDirection;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for treasury operations
pub type Result<T> = std::result::Result<T, Error>;

/// Treasury errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed threshold, provider or job data. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network, timeout or 5xx-class provider failure
    #[error("Provider {provider} unavailable: {message}")]
    ProviderTransient {
        /// Provider name
        provider: String,
        /// Provider message
        message: String,
    },

    /// Provider refused the request (bad destination, no liquidity, ...)
    #[error("Provider {provider} rejected request [{code}]: {message}")]
    ProviderRejected {
        /// Provider name
        provider: String,
        /// Provider error code
        code: String,
        /// Provider message
        message: String,
    },

    /// No configured provider is eligible for the conversion
    #[error("No provider available for {direction} {amount}")]
    NoProviderAvailable {
        /// Requested direction
        direction: ConversionDirection,
        /// Requested amount
        amount: Decimal,
    },

    /// Provider is configured but has no rail registered
    #[error("No rail registered for provider {0}")]
    RailNotRegistered(Uuid),

    /// Ledger posting or query failed
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Conversion job not found
    #[error("Conversion job not found: {0}")]
    JobNotFound(Uuid),

    /// Job status changed underneath us (another engine instance won)
    #[error("Conversion job {job_id} is no longer {expected}")]
    ConcurrentModification {
        /// Job ID
        job_id: Uuid,
        /// Status the update expected
        expected: JobStatus,
    },

    /// State machine violation
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// A single-flight loop is already running a cycle
    #[error("{0} already in progress")]
    CycleInProgress(&'static str),

    /// Scheduler lifecycle error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Stable short code stored on failed jobs
    pub fn code(&self) -> &str {
        match self {
            Error::Validation(_) => "validation",
            Error::ProviderTransient { .. } => "provider_unavailable",
            Error::ProviderRejected { code, .. } => code,
            Error::NoProviderAvailable { .. } => "no_provider",
            Error::RailNotRegistered(_) => "rail_not_registered",
            Error::Ledger(_) => "ledger",
            Error::JobNotFound(_) => "job_not_found",
            Error::ConcurrentModification { .. } => "concurrent_modification",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::CycleInProgress(_) => "cycle_in_progress",
            Error::Scheduler(_) => "scheduler",
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Metrics(_) => "metrics",
        }
    }
}
