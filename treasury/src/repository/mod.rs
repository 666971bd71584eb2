//! Treasury persistence
//!
//! The repository is the source of truth for job state, provider counters
//! and idempotency. Every job write is a compare-and-set on the status the
//! caller last read, so two engine instances cannot both advance a job.

pub mod memory;
pub mod postgres;

use crate::buffer::BufferThreshold;
use crate::job::{ConversionJob, JobHistoryEntry, JobStatus};
use crate::provider::ConversionProvider;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub use memory::InMemoryTreasuryRepository;
pub use postgres::PgTreasuryRepository;

/// Outcome of a conditional job insert
#[derive(Debug, Clone)]
pub enum JobInsert {
    /// The job was stored
    Inserted(ConversionJob),
    /// A job with the same idempotency key already existed
    Existing(ConversionJob),
}

impl JobInsert {
    /// The stored job either way
    pub fn into_job(self) -> ConversionJob {
        match self {
            JobInsert::Inserted(job) | JobInsert::Existing(job) => job,
        }
    }

    /// Whether this call created the job
    pub fn is_inserted(&self) -> bool {
        matches!(self, JobInsert::Inserted(_))
    }
}

/// Treasury repository
#[async_trait]
pub trait TreasuryRepository: Send + Sync {
    /// Store `job` with its creation history unless its idempotency key exists
    async fn insert_job_if_absent(
        &self,
        job: &ConversionJob,
        history: &JobHistoryEntry,
    ) -> Result<JobInsert>;

    /// Load a job
    async fn get_job(&self, id: Uuid) -> Result<Option<ConversionJob>>;

    /// Load a job by idempotency key
    async fn find_job_by_idempotency_key(&self, key: &str) -> Result<Option<ConversionJob>>;

    /// Jobs in any of `statuses`, oldest first
    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<ConversionJob>>;

    /// Overwrite `job` if its stored status is still `expected`, appending
    /// `history` in the same unit of work
    ///
    /// Fails with `ConcurrentModification` when the status moved.
    async fn save_job(
        &self,
        job: &ConversionJob,
        expected: JobStatus,
        history: Option<&JobHistoryEntry>,
    ) -> Result<()>;

    /// History for a job, oldest first
    async fn list_job_history(&self, job_id: Uuid) -> Result<Vec<JobHistoryEntry>>;

    /// All buffer thresholds
    async fn list_buffer_thresholds(&self) -> Result<Vec<BufferThreshold>>;

    /// Insert or replace the threshold for its buffer account
    async fn upsert_buffer_threshold(&self, threshold: &BufferThreshold) -> Result<()>;

    /// All provider records
    async fn list_providers(&self) -> Result<Vec<ConversionProvider>>;

    /// Insert or update a provider's configuration, keeping its counters
    async fn upsert_provider(&self, provider: &ConversionProvider) -> Result<()>;

    /// Atomically count a completed conversion and add to daily volume
    async fn record_provider_success(
        &self,
        provider_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomically count a failed conversion
    async fn record_provider_failure(&self, provider_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}
