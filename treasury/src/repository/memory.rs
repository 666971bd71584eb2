//! In-memory treasury repository

use super::{JobInsert, TreasuryRepository};
use crate::buffer::BufferThreshold;
use crate::job::{ConversionJob, JobHistoryEntry, JobStatus};
use crate::provider::ConversionProvider;
use crate::types::BufferAccount;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

/// `dashmap`-backed repository for tests and the sandbox node
#[derive(Debug, Default)]
pub struct InMemoryTreasuryRepository {
    jobs: DashMap<Uuid, ConversionJob>,
    idempotency_keys: DashMap<String, Uuid>,
    history: DashMap<Uuid, Vec<JobHistoryEntry>>,
    thresholds: DashMap<BufferAccount, BufferThreshold>,
    providers: DashMap<Uuid, ConversionProvider>,
}

impl InMemoryTreasuryRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn append_history(&self, entry: &JobHistoryEntry) {
        self.history
            .entry(entry.job_id)
            .or_default()
            .push(entry.clone());
    }
}

#[async_trait]
impl TreasuryRepository for InMemoryTreasuryRepository {
    async fn insert_job_if_absent(
        &self,
        job: &ConversionJob,
        history: &JobHistoryEntry,
    ) -> Result<JobInsert> {
        match self.idempotency_keys.entry(job.idempotency_key.clone()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let stored = self
                    .jobs
                    .get(&id)
                    .map(|j| j.clone())
                    .ok_or(Error::JobNotFound(id))?;
                Ok(JobInsert::Existing(stored))
            }
            Entry::Vacant(slot) => {
                self.jobs.insert(job.id, job.clone());
                self.append_history(history);
                slot.insert(job.id);
                Ok(JobInsert::Inserted(job.clone()))
            }
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ConversionJob>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn find_job_by_idempotency_key(&self, key: &str) -> Result<Option<ConversionJob>> {
        let id = match self.idempotency_keys.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_job(id).await
    }

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<ConversionJob>> {
        let mut jobs: Vec<ConversionJob> = self
            .jobs
            .iter()
            .filter(|j| statuses.contains(&j.status))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn save_job(
        &self,
        job: &ConversionJob,
        expected: JobStatus,
        history: Option<&JobHistoryEntry>,
    ) -> Result<()> {
        {
            let mut stored = self.jobs.get_mut(&job.id).ok_or(Error::JobNotFound(job.id))?;
            if stored.status != expected {
                return Err(Error::ConcurrentModification {
                    job_id: job.id,
                    expected,
                });
            }
            *stored = job.clone();
        }
        if let Some(entry) = history {
            self.append_history(entry);
        }
        Ok(())
    }

    async fn list_job_history(&self, job_id: Uuid) -> Result<Vec<JobHistoryEntry>> {
        Ok(self
            .history
            .get(&job_id)
            .map(|h| h.clone())
            .unwrap_or_default())
    }

    async fn list_buffer_thresholds(&self) -> Result<Vec<BufferThreshold>> {
        let mut thresholds: Vec<BufferThreshold> =
            self.thresholds.iter().map(|t| t.clone()).collect();
        thresholds.sort_by_key(|t| t.account);
        Ok(thresholds)
    }

    async fn upsert_buffer_threshold(&self, threshold: &BufferThreshold) -> Result<()> {
        threshold.validate()?;
        self.thresholds.insert(threshold.account, threshold.clone());
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<ConversionProvider>> {
        let mut providers: Vec<ConversionProvider> =
            self.providers.iter().map(|p| p.clone()).collect();
        providers.sort_by_key(|p| (p.priority, p.name.clone()));
        Ok(providers)
    }

    async fn upsert_provider(&self, provider: &ConversionProvider) -> Result<()> {
        provider.validate()?;
        match self.providers.entry(provider.id) {
            Entry::Occupied(mut existing) => {
                let stored = existing.get_mut();
                let counters = (
                    stored.daily_volume_used,
                    stored.success_count,
                    stored.failure_count,
                    stored.last_success_at,
                    stored.last_failure_at,
                    stored.created_at,
                );
                *stored = provider.clone();
                stored.daily_volume_used = counters.0;
                stored.success_count = counters.1;
                stored.failure_count = counters.2;
                stored.last_success_at = counters.3;
                stored.last_failure_at = counters.4;
                stored.created_at = counters.5;
                stored.updated_at = Utc::now();
            }
            Entry::Vacant(slot) => {
                slot.insert(provider.clone());
            }
        }
        Ok(())
    }

    async fn record_provider_success(
        &self,
        provider_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut provider = self
            .providers
            .get_mut(&provider_id)
            .ok_or_else(|| Error::Validation(format!("unknown provider {}", provider_id)))?;
        provider.success_count += 1;
        provider.daily_volume_used += amount;
        provider.last_success_at = Some(at);
        provider.updated_at = at;
        Ok(())
    }

    async fn record_provider_failure(&self, provider_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut provider = self
            .providers
            .get_mut(&provider_id)
            .ok_or_else(|| Error::Validation(format!("unknown provider {}", provider_id)))?;
        provider.failure_count += 1;
        provider.last_failure_at = Some(at);
        provider.updated_at = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewConversionJob;
    use crate::types::{AccountId, ConversionDirection, ConversionTrigger};
    use rust_decimal_macros::dec;

    fn job(key: &str) -> ConversionJob {
        ConversionJob::new(
            NewConversionJob {
                direction: ConversionDirection::UsdcToUsd,
                amount: dec!(1000),
                trigger: ConversionTrigger::Manual,
                source_account: AccountId::new("system:usdc_onchain"),
                destination_account: AccountId::new("system:broker_operational"),
                idempotency_key: key.to_string(),
                notes: None,
            },
            3,
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_existing() {
        let repo = InMemoryTreasuryRepository::new();
        let first = job("k1");
        let second = job("k1");

        let a = repo
            .insert_job_if_absent(&first, &JobHistoryEntry::record(&first, None, "created"))
            .await
            .unwrap();
        let b = repo
            .insert_job_if_absent(&second, &JobHistoryEntry::record(&second, None, "created"))
            .await
            .unwrap();

        assert!(a.is_inserted());
        assert!(!b.is_inserted());
        assert_eq!(b.into_job().id, first.id);
        assert_eq!(repo.list_jobs_by_status(&JobStatus::ALL).await.unwrap().len(), 1);
        assert!(repo.list_job_history(second.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_is_compare_and_set() {
        let repo = InMemoryTreasuryRepository::new();
        let mut j = job("k1");
        repo.insert_job_if_absent(&j, &JobHistoryEntry::record(&j, None, "created"))
            .await
            .unwrap();

        let from = j.cancel("operator", Utc::now()).unwrap();
        repo.save_job(&j, from, Some(&JobHistoryEntry::record(&j, Some(from), "cancelled")))
            .await
            .unwrap();

        let err = repo.save_job(&j, JobStatus::Pending, None).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification { .. }));
        assert_eq!(repo.list_job_history(j.id).await.unwrap().len(), 2);
    }
}
