//! Reconciliation persistence

pub mod memory;
pub mod postgres;

use crate::types::{ReconciliationCheck, ReconciliationException, ReconciliationReport};
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub use memory::InMemoryReconciliationRepository;
pub use postgres::PgReconciliationRepository;

/// Reports, checks and exceptions
#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    /// Insert or overwrite a report
    async fn save_report(&self, report: &ReconciliationReport) -> Result<()>;

    /// Load a report
    async fn get_report(&self, id: Uuid) -> Result<Option<ReconciliationReport>>;

    /// Most recently started report
    async fn latest_report(&self) -> Result<Option<ReconciliationReport>>;

    /// Append a check
    async fn insert_check(&self, check: &ReconciliationCheck) -> Result<()>;

    /// Checks of a report, in execution order
    async fn list_checks(&self, report_id: Uuid) -> Result<Vec<ReconciliationCheck>>;

    /// Append an exception
    async fn insert_exception(&self, exception: &ReconciliationException) -> Result<()>;

    /// Overwrite a stored exception
    async fn update_exception(&self, exception: &ReconciliationException) -> Result<()>;

    /// Load an exception
    async fn get_exception(&self, id: Uuid) -> Result<Option<ReconciliationException>>;

    /// Exceptions of a report
    async fn list_exceptions(&self, report_id: Uuid) -> Result<Vec<ReconciliationException>>;

    /// Exceptions neither corrected nor resolved, oldest first
    async fn list_open_exceptions(&self) -> Result<Vec<ReconciliationException>>;
}
