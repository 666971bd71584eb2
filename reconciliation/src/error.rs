//! Error types for the reconciliation engine

use crate::types::{ExceptionState, Severity};
use thiserror::Error;
use uuid::Uuid;

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed record or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// A probe could not read one side of a comparison
    #[error("Probe error: {0}")]
    Probe(String),

    /// Exception not found
    #[error("Reconciliation exception not found: {0}")]
    ExceptionNotFound(Uuid),

    /// Report not found
    #[error("Reconciliation report not found: {0}")]
    ReportNotFound(Uuid),

    /// Only low-severity exceptions may be corrected without an operator
    #[error("Exception {id} is {severity} and cannot be auto-corrected")]
    NotAutoCorrectable {
        /// Exception ID
        id: Uuid,
        /// Its severity
        severity: Severity,
    },

    /// Exception was already auto-corrected or resolved
    #[error("Exception {id} is already {state}")]
    AlreadyClosed {
        /// Exception ID
        id: Uuid,
        /// How it was closed
        state: ExceptionState,
    },

    /// A single-flight run is already in progress
    #[error("{0} already in progress")]
    RunInProgress(&'static str),

    /// Scheduler lifecycle error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Treasury collaborator (ledger, repository, rail) failed
    #[error(transparent)]
    Treasury(#[from] treasury::Error),

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
