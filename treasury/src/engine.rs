//! Treasury engine
//!
//! Watches buffer balances, opens conversion jobs when a buffer falls below
//! target, and drives each job through the provider and into the ledger.
//!
//! Every transition is persisted with a compare-and-set on the prior status
//! before the next step starts, so a crash or a competing instance leaves
//! the job in a state the next pass can pick up:
//! - `pending` jobs are (re)submitted with their original idempotency key
//! - provider-side jobs are polled
//! - `provider_completed` / `ledger_updating` jobs are posted; the ledger
//!   dedupes by job ID

use crate::buffer::{BufferStatus, BufferThreshold};
use crate::config::{Config, EngineConfig};
use crate::job::{ConversionJob, JobHistoryEntry, JobStatus, NewConversionJob};
use crate::ledger::LedgerService;
use crate::metrics::Metrics;
use crate::provider::{
    ConversionProvider, ConversionRequest, RailFailure, RailRegistry, RailStatus,
};
use crate::repository::{JobInsert, TreasuryRepository};
use crate::retry::{FailureKind, RetryPolicy};
use crate::selector;
use crate::types::{AccountId, BufferAccount, ConversionTrigger};
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Statuses a job can sit in while it still needs engine work
const IN_FLIGHT: [JobStatus; 6] = [
    JobStatus::Pending,
    JobStatus::ProviderSubmitted,
    JobStatus::ProviderProcessing,
    JobStatus::ProviderCompleted,
    JobStatus::LedgerUpdating,
    JobStatus::Failed,
];

/// Outcome of one settlement cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct SettlementCycleSummary {
    /// Cycle start
    pub started_at: Option<DateTime<Utc>>,
    /// Failed jobs moved back to pending
    pub jobs_retried: usize,
    /// Jobs accepted by a provider this cycle
    pub jobs_submitted: usize,
    /// Submissions that ended in `failed`
    pub submission_failures: usize,
    /// Buffers whose balance was read
    pub buffers_checked: usize,
    /// Buffers below target
    pub buffers_below_target: usize,
    /// Replenishment jobs created
    pub jobs_created: usize,
    /// Buffers skipped because a job already targets them
    pub skipped_in_flight: usize,
    /// Buffers skipped because no provider was eligible
    pub skipped_no_provider: usize,
    /// Per-item errors that did not abort the cycle
    pub errors: Vec<String>,
}

/// Outcome of one monitor pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSummary {
    /// Provider-side jobs polled
    pub jobs_polled: usize,
    /// `provider_submitted -> provider_processing`
    pub advanced_to_processing: usize,
    /// Jobs the provider completed
    pub provider_completed: usize,
    /// Jobs the provider failed
    pub provider_failed: usize,
    /// Jobs completed with a ledger entry
    pub completed: usize,
    /// Failed ledger posts
    pub ledger_failures: usize,
    /// Jobs newly flagged stale
    pub stale_flagged: usize,
    /// Status polls that errored
    pub poll_errors: usize,
    /// Per-job errors that did not abort the pass
    pub errors: Vec<String>,
}

/// Treasury engine
pub struct TreasuryEngine {
    /// Job, threshold and provider store
    repository: Arc<dyn TreasuryRepository>,

    /// Ledger port
    ledger: Arc<dyn LedgerService>,

    /// Rails by provider
    rails: Arc<RailRegistry>,

    /// Metrics
    metrics: Metrics,

    /// Backoff for failed jobs
    retry: RetryPolicy,

    /// Engine behaviour
    settings: EngineConfig,

    /// Replenishment idempotency window in seconds
    idempotency_window_secs: i64,
}

impl TreasuryEngine {
    /// Create new treasury engine
    pub fn new(
        config: &Config,
        repository: Arc<dyn TreasuryRepository>,
        ledger: Arc<dyn LedgerService>,
        rails: Arc<RailRegistry>,
        metrics: Metrics,
    ) -> Self {
        Self {
            repository,
            ledger,
            rails,
            metrics,
            retry: config.retry.clone(),
            settings: config.engine.clone(),
            idempotency_window_secs: config.idempotency_window().as_secs().max(1) as i64,
        }
    }

    /// Upsert configured thresholds and providers, then check every
    /// provider record resolves to a rail
    pub async fn seed_from_config(&self, config: &Config) -> Result<()> {
        for buffer in &config.buffers {
            self.repository
                .upsert_buffer_threshold(&buffer.to_threshold()?)
                .await?;
        }
        for provider in &config.providers {
            self.repository
                .upsert_provider(&ConversionProvider::from_config(provider)?)
                .await?;
        }

        let providers = self.repository.list_providers().await?;
        self.rails.verify(&providers)?;

        info!(
            "Seeded {} buffer thresholds and {} providers",
            config.buffers.len(),
            providers.len()
        );
        Ok(())
    }

    /// Metrics handle
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Rail registry
    pub fn rails(&self) -> &Arc<RailRegistry> {
        &self.rails
    }

    fn ledger_account(&self, buffer: BufferAccount) -> AccountId {
        self.settings.ledger_account(buffer)
    }

    async fn buffer_status(&self, threshold: &BufferThreshold) -> Result<BufferStatus> {
        let account = self.ledger_account(threshold.account);
        let balance = self.ledger.get_balance(&account).await?;
        self.metrics
            .buffer_balance
            .with_label_values(&[threshold.account.as_str()])
            .set(balance.to_f64().unwrap_or_default());
        Ok(threshold.status(account, balance))
    }

    /// Current status of every configured buffer
    pub async fn check_buffer_levels(&self) -> Result<Vec<BufferStatus>> {
        let thresholds = self.repository.list_buffer_thresholds().await?;
        let mut statuses = Vec::with_capacity(thresholds.len());

        for threshold in &thresholds {
            let status = self.buffer_status(threshold).await?;
            debug!(
                "Buffer {} at {} ({})",
                status.account, status.current_balance, status.health
            );
            statuses.push(status);
        }

        Ok(statuses)
    }

    /// Retry due failed jobs, submit pending jobs, then open replenishment
    /// jobs for buffers below target
    pub async fn run_settlement_cycle(&self) -> Result<SettlementCycleSummary> {
        let started = Instant::now();
        let now = Utc::now();
        let mut summary = SettlementCycleSummary {
            started_at: Some(now),
            ..Default::default()
        };

        self.retry_due_jobs(now, &mut summary).await?;

        for job in self.repository.list_jobs_by_status(&[JobStatus::Pending]).await? {
            let job_id = job.id;
            match self.submit_job(job).await {
                Ok(job) => record_submission(&job, &mut summary),
                Err(e) => {
                    warn!("Submission of job {} not persisted: {}", job_id, e);
                    summary.errors.push(format!("submit {}: {}", job_id, e));
                }
            }
        }

        let thresholds = self.repository.list_buffer_thresholds().await?;
        let in_flight = self.repository.list_jobs_by_status(&IN_FLIGHT).await?;

        for threshold in &thresholds {
            let status = match self.buffer_status(threshold).await {
                Ok(status) => status,
                Err(e) => {
                    error!("Could not read balance of buffer {}: {}", threshold.account, e);
                    summary
                        .errors
                        .push(format!("balance {}: {}", threshold.account, e));
                    continue;
                }
            };
            summary.buffers_checked += 1;

            if !status.needs_replenishment() {
                debug!("Buffer {} is {}", status.account, status.health);
                continue;
            }
            summary.buffers_below_target += 1;

            if in_flight
                .iter()
                .any(|job| !job.is_terminal() && job.destination_account == status.ledger_account)
            {
                debug!(
                    "Buffer {} is {} but a conversion is already in flight",
                    status.account, status.health
                );
                summary.skipped_in_flight += 1;
                continue;
            }

            match self.create_replenishment_job(threshold, &status, now).await {
                Ok(Some(job)) => {
                    summary.jobs_created += 1;
                    let job_id = job.id;
                    match self.submit_job(job).await {
                        Ok(job) => record_submission(&job, &mut summary),
                        Err(e) => {
                            warn!("Submission of job {} not persisted: {}", job_id, e);
                            summary.errors.push(format!("submit {}: {}", job_id, e));
                        }
                    }
                }
                Ok(None) => summary.skipped_in_flight += 1,
                Err(Error::NoProviderAvailable { direction, amount }) => {
                    warn!(
                        "Buffer {} needs {} but no provider can convert {} {}",
                        status.account, status.amount_to_target, direction, amount
                    );
                    summary.skipped_no_provider += 1;
                }
                Err(e) => {
                    error!("Could not create replenishment for {}: {}", status.account, e);
                    summary.errors.push(format!("replenish {}: {}", status.account, e));
                }
            }
        }

        self.metrics
            .cycle_duration
            .with_label_values(&["settlement"])
            .observe(started.elapsed().as_secs_f64());

        info!(
            "Settlement cycle: {} buffers checked, {} below target, {} jobs created, {} submitted, {} retried, {} failed",
            summary.buffers_checked,
            summary.buffers_below_target,
            summary.jobs_created,
            summary.jobs_submitted,
            summary.jobs_retried,
            summary.submission_failures
        );

        Ok(summary)
    }

    async fn retry_due_jobs(
        &self,
        now: DateTime<Utc>,
        summary: &mut SettlementCycleSummary,
    ) -> Result<()> {
        for mut job in self.repository.list_jobs_by_status(&[JobStatus::Failed]).await? {
            if !job.is_due_for_retry(now) {
                continue;
            }
            let from = job.reset_for_retry(now)?;
            let note = format!("retry {}/{}", job.retry_count, job.max_retries);
            match self.persist(&job, from, note).await {
                Ok(()) => summary.jobs_retried += 1,
                Err(e) => {
                    warn!("Could not requeue job {}: {}", job.id, e);
                    summary.errors.push(format!("retry {}: {}", job.id, e));
                }
            }
        }
        Ok(())
    }

    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.idempotency_window_secs) * self.idempotency_window_secs
    }

    async fn create_replenishment_job(
        &self,
        threshold: &BufferThreshold,
        status: &BufferStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversionJob>> {
        let route = threshold.account.replenishment_route();
        let request = NewConversionJob {
            direction: route.direction,
            amount: status.amount_to_target,
            trigger: ConversionTrigger::BufferReplenishment,
            source_account: self.ledger_account(route.source),
            destination_account: status.ledger_account.clone(),
            idempotency_key: format!(
                "buffer_replenishment:{}:{}:{}",
                threshold.account,
                route.direction,
                self.window_start(now)
            ),
            notes: Some(format!(
                "{} at {} ({}), target {}",
                threshold.account, status.current_balance, status.health, status.target_threshold
            )),
        };

        match self.create_job(request, now).await? {
            JobInsert::Inserted(job) => Ok(Some(job)),
            JobInsert::Existing(job) => {
                debug!(
                    "Replenishment {} already exists as job {}",
                    job.idempotency_key, job.id
                );
                Ok(None)
            }
        }
    }

    async fn create_job(&self, request: NewConversionJob, now: DateTime<Utc>) -> Result<JobInsert> {
        let providers = self.repository.list_providers().await?;
        let provider = selector::select(&providers, request.direction, request.amount)?;

        let mut job = ConversionJob::new(request, self.retry.max_retries, now)?;
        job.assign_provider(&provider);

        let history = JobHistoryEntry::record(&job, None, "created");
        let insert = self.repository.insert_job_if_absent(&job, &history).await?;

        if let JobInsert::Inserted(job) = &insert {
            self.metrics
                .jobs_created
                .with_label_values(&[job.trigger.as_str()])
                .inc();
            info!(
                "Created conversion job {}: {} {} via {} ({})",
                job.id, job.direction, job.amount, provider.name, job.trigger
            );
        }

        Ok(insert)
    }

    /// Open and submit a manual or emergency conversion
    ///
    /// A request whose idempotency key already exists returns the stored job
    /// untouched.
    pub async fn request_conversion(&self, request: NewConversionJob) -> Result<ConversionJob> {
        request.validate()?;

        if let Some(existing) = self
            .repository
            .find_job_by_idempotency_key(&request.idempotency_key)
            .await?
        {
            debug!("Conversion {} already exists as job {}", request.idempotency_key, existing.id);
            return Ok(existing);
        }

        match self.create_job(request, Utc::now()).await? {
            JobInsert::Inserted(job) => self.submit_job(job).await,
            JobInsert::Existing(job) => Ok(job),
        }
    }

    /// Send a pending job to its provider
    ///
    /// Provider errors are recorded on the job; only persistence errors
    /// surface as `Err`.
    async fn submit_job(&self, mut job: ConversionJob) -> Result<ConversionJob> {
        let provider_id = match job.provider_id {
            Some(id) => id,
            None => {
                let providers = self.repository.list_providers().await?;
                match selector::select(&providers, job.direction, job.amount) {
                    Ok(provider) => {
                        job.assign_provider(&provider);
                        provider.id
                    }
                    Err(e) => return self.fail_job(job, &e).await,
                }
            }
        };

        let rail = match self.rails.rail(provider_id) {
            Ok(rail) => rail,
            Err(e) => return self.fail_job(job, &e).await,
        };

        let request = ConversionRequest {
            job_id: job.id,
            direction: job.direction,
            amount: job.amount,
            source_ref: job.source_account.clone(),
            destination_ref: job.destination_account.clone(),
            idempotency_key: job.provider_idempotency_key(),
        };

        match rail.initiate_conversion(&request).await {
            Ok(receipt) => {
                let from = job.mark_submitted(receipt.external_tx_id, receipt.raw_response, Utc::now())?;
                self.persist(&job, from, "submitted to provider").await?;

                let from = job.mark_processing(Utc::now())?;
                self.persist(&job, from, "provider processing").await?;
                Ok(job)
            }
            Err(e) => {
                self.record_provider_failure(provider_id).await;
                self.fail_job(job, &e).await
            }
        }
    }

    async fn fail_job(&self, job: ConversionJob, err: &Error) -> Result<ConversionJob> {
        self.fail_job_with(job, err.code().to_string(), err.to_string(), FailureKind::of(err))
            .await
    }

    async fn fail_job_with(
        &self,
        mut job: ConversionJob,
        code: String,
        message: String,
        kind: FailureKind,
    ) -> Result<ConversionJob> {
        let now = Utc::now();
        let next_retry_at = match kind {
            FailureKind::Transient if job.retry_count < job.max_retries => {
                Some(self.retry.next_retry_at(job.retry_count, now))
            }
            _ => None,
        };

        let from = job.mark_failed(code, message, kind, next_retry_at, now)?;
        self.persist(&job, from, format!("{} failure", kind)).await?;
        self.metrics
            .job_failures
            .with_label_values(&[kind.as_str()])
            .inc();

        let reason = job.error_message.as_deref().unwrap_or_default();
        if job.can_retry() {
            warn!(
                "Conversion job {} failed ({}), retry {}/{} after {:?}",
                job.id,
                reason,
                job.retry_count + 1,
                job.max_retries,
                job.next_retry_at
            );
        } else {
            error!(
                "Conversion job {} failed terminally after {} retries: {}",
                job.id, job.retry_count, reason
            );
        }

        Ok(job)
    }

    async fn record_provider_failure(&self, provider_id: Uuid) {
        if let Err(e) = self
            .repository
            .record_provider_failure(provider_id, Utc::now())
            .await
        {
            warn!("Could not count failure for provider {}: {}", provider_id, e);
        }
    }

    async fn persist(
        &self,
        job: &ConversionJob,
        from: JobStatus,
        note: impl Into<String>,
    ) -> Result<()> {
        let history = JobHistoryEntry::record(job, Some(from), note);
        self.repository.save_job(job, from, Some(&history)).await?;
        self.metrics
            .job_transitions
            .with_label_values(&[job.status.as_str()])
            .inc();
        info!("Conversion job {}: {} -> {}", job.id, from, job.status);
        Ok(())
    }

    /// Poll provider-side jobs and post ledger entries for finished ones
    pub async fn monitor_conversion_jobs(&self) -> Result<MonitorSummary> {
        let started = Instant::now();
        let mut summary = MonitorSummary::default();

        let jobs = self
            .repository
            .list_jobs_by_status(&[
                JobStatus::ProviderSubmitted,
                JobStatus::ProviderProcessing,
                JobStatus::ProviderCompleted,
                JobStatus::LedgerUpdating,
            ])
            .await?;

        for job in jobs {
            let job_id = job.id;
            let result = if job.status.is_with_provider() {
                self.poll_job(job, &mut summary).await
            } else if job.status.awaits_ledger() {
                self.settle_ledger(job, &mut summary).await.map(|_| ())
            } else {
                continue;
            };

            if let Err(e) = result {
                warn!("Monitor left job {} untouched: {}", job_id, e);
                summary.errors.push(format!("{}: {}", job_id, e));
            }
        }

        self.metrics
            .cycle_duration
            .with_label_values(&["monitor"])
            .observe(started.elapsed().as_secs_f64());

        if summary.jobs_polled > 0 || summary.ledger_failures > 0 {
            info!(
                "Monitor pass: {} polled, {} provider completed, {} provider failed, {} completed, {} ledger failures, {} stale",
                summary.jobs_polled,
                summary.provider_completed,
                summary.provider_failed,
                summary.completed,
                summary.ledger_failures,
                summary.stale_flagged
            );
        }

        Ok(summary)
    }

    async fn poll_job(&self, mut job: ConversionJob, summary: &mut MonitorSummary) -> Result<()> {
        let now = Utc::now();
        summary.jobs_polled += 1;

        let stale_after = ChronoDuration::seconds(self.settings.stale_after_secs as i64);
        let since = job.submitted_at.unwrap_or(job.created_at);
        if job.stale_flagged_at.is_none() && now - since > stale_after {
            job.stale_flagged_at = Some(now);
            job.updated_at = now;
            self.repository.save_job(&job, job.status, None).await?;
            self.metrics.stale_jobs.inc();
            summary.stale_flagged += 1;
            warn!(
                "Conversion job {} stale: {} with {} since {}",
                job.id,
                job.status,
                job.provider_name.as_deref().unwrap_or("unknown provider"),
                since
            );
        }

        let provider_id = job
            .provider_id
            .ok_or_else(|| Error::Validation(format!("job {} has no provider", job.id)))?;
        let external_tx_id = job
            .external_tx_id
            .clone()
            .ok_or_else(|| Error::Validation(format!("job {} has no provider reference", job.id)))?;
        let rail = self.rails.rail(provider_id)?;

        let report = match rail.get_conversion_status(&external_tx_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Status poll for job {} failed: {}", job.id, e);
                summary.poll_errors += 1;
                return Ok(());
            }
        };

        match report.status {
            RailStatus::Pending => {
                debug!("Conversion job {} still pending at provider", job.id);
            }
            RailStatus::Processing => {
                if job.status == JobStatus::ProviderSubmitted {
                    let from = job.mark_processing(now)?;
                    self.persist(&job, from, "provider processing").await?;
                    summary.advanced_to_processing += 1;
                }
            }
            RailStatus::Completed => {
                let converted_amount = report.converted_amount.ok_or_else(|| {
                    Error::Validation(format!(
                        "provider completed job {} without a converted amount",
                        job.id
                    ))
                })?;
                let from = job.mark_provider_completed(
                    converted_amount,
                    report.exchange_rate,
                    report.fees,
                    report.raw_response,
                    now,
                )?;
                self.persist(&job, from, "provider completed").await?;
                summary.provider_completed += 1;

                if let Err(e) = self
                    .repository
                    .record_provider_success(provider_id, job.amount, now)
                    .await
                {
                    warn!("Could not count success for provider {}: {}", provider_id, e);
                }

                self.settle_ledger(job, summary).await?;
            }
            RailStatus::Failed => {
                let failure = report.failure.unwrap_or_else(|| RailFailure {
                    code: "provider_failed".to_string(),
                    message: "provider reported failure without detail".to_string(),
                    retryable: false,
                });
                let kind = if failure.retryable {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                };
                job.provider_response = Some(report.raw_response);
                self.record_provider_failure(provider_id).await;
                self.fail_job_with(job, failure.code, failure.message, kind)
                    .await?;
                summary.provider_failed += 1;
            }
        }

        Ok(())
    }

    async fn settle_ledger(
        &self,
        mut job: ConversionJob,
        summary: &mut MonitorSummary,
    ) -> Result<ConversionJob> {
        if job.status == JobStatus::ProviderCompleted {
            let from = job.begin_ledger_update(Utc::now())?;
            self.persist(&job, from, "posting ledger entries").await?;
        }

        let entries = job.ledger_entries()?;

        match self.ledger.post_balanced_entries(&entries).await {
            Ok(transaction_id) => {
                let from = job.mark_completed(transaction_id, Utc::now())?;
                self.persist(&job, from, format!("ledger transaction {}", transaction_id))
                    .await?;
                summary.completed += 1;
            }
            Err(e) => {
                job.record_ledger_failure(e.to_string(), Utc::now())?;
                self.repository
                    .save_job(&job, JobStatus::LedgerUpdating, None)
                    .await?;
                self.metrics.ledger_post_failures.inc();
                summary.ledger_failures += 1;

                if job.ledger_attempts >= self.settings.ledger_alert_after {
                    self.metrics.ledger_alerts.inc();
                    error!(
                        "ALERT: ledger post for conversion job {} failed {} times: {}",
                        job.id, job.ledger_attempts, e
                    );
                } else {
                    warn!(
                        "Ledger post for conversion job {} failed (attempt {}): {}",
                        job.id, job.ledger_attempts, e
                    );
                }
            }
        }

        Ok(job)
    }

    /// Cancel a `pending` or `failed` job
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<ConversionJob> {
        let mut job = self
            .repository
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        let from = job.cancel(reason, Utc::now())?;
        self.persist(&job, from, format!("cancelled: {}", reason)).await?;
        Ok(job)
    }

    /// Load a job
    pub async fn get_job(&self, job_id: Uuid) -> Result<ConversionJob> {
        self.repository
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Audit trail of a job, oldest first
    pub async fn job_history(&self, job_id: Uuid) -> Result<Vec<JobHistoryEntry>> {
        self.get_job(job_id).await?;
        self.repository.list_job_history(job_id).await
    }
}

fn record_submission(job: &ConversionJob, summary: &mut SettlementCycleSummary) {
    match job.status {
        JobStatus::Failed => summary.submission_failures += 1,
        _ => summary.jobs_submitted += 1,
    }
}

impl std::fmt::Debug for TreasuryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreasuryEngine")
            .field("rails", &self.rails)
            .field("retry", &self.retry)
            .field("settings", &self.settings)
            .finish()
    }
}
