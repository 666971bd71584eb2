//! Postgres treasury repository

use super::{JobInsert, TreasuryRepository};
use crate::buffer::BufferThreshold;
use crate::job::{ConversionJob, JobHistoryEntry, JobStatus};
use crate::provider::ConversionProvider;
use crate::types::AccountId;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, direction, amount, status, trigger_reason, provider_id, provider_name, \
    external_tx_id, provider_response, ledger_transaction_id, source_account, destination_account, \
    converted_amount, exchange_rate, fees, scheduled_at, submitted_at, provider_completed_at, \
    completed_at, failed_at, error_message, error_code, failure_kind, retry_count, max_retries, \
    next_retry_at, ledger_attempts, stale_flagged_at, idempotency_key, notes, created_at, updated_at";

/// `sqlx` Postgres repository
#[derive(Debug, Clone)]
pub struct PgTreasuryRepository {
    pool: PgPool,
}

impl PgTreasuryRepository {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("Connected to treasury database");
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations
    ///
    /// Versions applied by other crates sharing the database are ignored.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator
            .set_ignore_missing(true)
            .run(&self.pool)
            .await
            .map_err(|e| Error::Config(format!("treasury migration failed: {}", e)))?;
        Ok(())
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Postgres>,
        entry: &JobHistoryEntry,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversion_job_history
                (id, job_id, previous_status, new_status, notes, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id)
        .bind(entry.previous_status.map(|s| s.as_str()))
        .bind(entry.new_status.as_str())
        .bind(entry.notes.as_deref())
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn bind_job<'q>(
    query: Query<'q, Postgres, PgArguments>,
    job: &'q ConversionJob,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(job.id)
        .bind(job.direction.as_str())
        .bind(job.amount)
        .bind(job.status.as_str())
        .bind(job.trigger.as_str())
        .bind(job.provider_id)
        .bind(job.provider_name.as_deref())
        .bind(job.external_tx_id.as_deref())
        .bind(job.provider_response.as_ref())
        .bind(job.ledger_transaction_id)
        .bind(job.source_account.as_str())
        .bind(job.destination_account.as_str())
        .bind(job.converted_amount)
        .bind(job.exchange_rate)
        .bind(job.fees)
        .bind(job.scheduled_at)
        .bind(job.submitted_at)
        .bind(job.provider_completed_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.error_message.as_deref())
        .bind(job.error_code.as_deref())
        .bind(job.failure_kind.map(|k| k.as_str()))
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.next_retry_at)
        .bind(job.ledger_attempts as i32)
        .bind(job.stale_flagged_at)
        .bind(job.idempotency_key.as_str())
        .bind(job.notes.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
}

fn job_from_row(row: &PgRow) -> Result<ConversionJob> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger_reason")?;
    let failure_kind: Option<String> = row.try_get("failure_kind")?;
    let source_account: String = row.try_get("source_account")?;
    let destination_account: String = row.try_get("destination_account")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    let ledger_attempts: i32 = row.try_get("ledger_attempts")?;

    Ok(ConversionJob {
        id: row.try_get("id")?,
        direction: direction.parse()?,
        amount: row.try_get("amount")?,
        status: status.parse()?,
        trigger: trigger.parse()?,
        provider_id: row.try_get("provider_id")?,
        provider_name: row.try_get("provider_name")?,
        external_tx_id: row.try_get("external_tx_id")?,
        provider_response: row.try_get("provider_response")?,
        ledger_transaction_id: row.try_get("ledger_transaction_id")?,
        source_account: AccountId::new(source_account),
        destination_account: AccountId::new(destination_account),
        converted_amount: row.try_get("converted_amount")?,
        exchange_rate: row.try_get("exchange_rate")?,
        fees: row.try_get("fees")?,
        scheduled_at: row.try_get("scheduled_at")?,
        submitted_at: row.try_get("submitted_at")?,
        provider_completed_at: row.try_get("provider_completed_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
        failure_kind: failure_kind.map(|k| k.parse()).transpose()?,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        next_retry_at: row.try_get("next_retry_at")?,
        ledger_attempts: ledger_attempts.max(0) as u32,
        stale_flagged_at: row.try_get("stale_flagged_at")?,
        idempotency_key: row.try_get("idempotency_key")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<JobHistoryEntry> {
    let previous_status: Option<String> = row.try_get("previous_status")?;
    let new_status: String = row.try_get("new_status")?;

    Ok(JobHistoryEntry {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        previous_status: previous_status.map(|s| s.parse()).transpose()?,
        new_status: new_status.parse()?,
        notes: row.try_get("notes")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn threshold_from_row(row: &PgRow) -> Result<BufferThreshold> {
    let account: String = row.try_get("account")?;

    Ok(BufferThreshold {
        id: row.try_get("id")?,
        account: account.parse()?,
        min_threshold: row.try_get("min_threshold")?,
        target_threshold: row.try_get("target_threshold")?,
        max_threshold: row.try_get("max_threshold")?,
        conversion_batch_size: row.try_get("conversion_batch_size")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn provider_from_row(row: &PgRow) -> Result<ConversionProvider> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let success_count: i64 = row.try_get("success_count")?;
    let failure_count: i64 = row.try_get("failure_count")?;

    Ok(ConversionProvider {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: kind.parse()?,
        priority: row.try_get("priority")?,
        status: status.parse()?,
        supports_usdc_to_usd: row.try_get("supports_usdc_to_usd")?,
        supports_usd_to_usdc: row.try_get("supports_usd_to_usdc")?,
        min_conversion_amount: row.try_get("min_conversion_amount")?,
        max_conversion_amount: row.try_get("max_conversion_amount")?,
        daily_volume_limit: row.try_get("daily_volume_limit")?,
        daily_volume_used: row.try_get("daily_volume_used")?,
        success_count: success_count.max(0) as u64,
        failure_count: failure_count.max(0) as u64,
        last_success_at: row.try_get("last_success_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TreasuryRepository for PgTreasuryRepository {
    async fn insert_job_if_absent(
        &self,
        job: &ConversionJob,
        history: &JobHistoryEntry,
    ) -> Result<JobInsert> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO conversion_jobs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
             $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, \
             $27, $28, $29, $30, $31, $32) ON CONFLICT (idempotency_key) DO NOTHING",
            JOB_COLUMNS
        );
        let inserted = bind_job(sqlx::query(&sql), job)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            let existing = self
                .find_job_by_idempotency_key(&job.idempotency_key)
                .await?
                .ok_or(Error::JobNotFound(job.id))?;
            return Ok(JobInsert::Existing(existing));
        }

        Self::insert_history(&mut tx, history).await?;
        tx.commit().await?;

        Ok(JobInsert::Inserted(job.clone()))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ConversionJob>> {
        let sql = format!("SELECT {} FROM conversion_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_job_by_idempotency_key(&self, key: &str) -> Result<Option<ConversionJob>> {
        let sql = format!(
            "SELECT {} FROM conversion_jobs WHERE idempotency_key = $1",
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<ConversionJob>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let sql = format!(
            "SELECT {} FROM conversion_jobs WHERE status = ANY($1) ORDER BY created_at",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn save_job(
        &self,
        job: &ConversionJob,
        expected: JobStatus,
        history: Option<&JobHistoryEntry>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = bind_job(
            sqlx::query(
                r#"
                UPDATE conversion_jobs SET
                    direction = $2, amount = $3, status = $4, trigger_reason = $5,
                    provider_id = $6, provider_name = $7, external_tx_id = $8,
                    provider_response = $9, ledger_transaction_id = $10,
                    source_account = $11, destination_account = $12,
                    converted_amount = $13, exchange_rate = $14, fees = $15,
                    scheduled_at = $16, submitted_at = $17, provider_completed_at = $18,
                    completed_at = $19, failed_at = $20, error_message = $21,
                    error_code = $22, failure_kind = $23, retry_count = $24,
                    max_retries = $25, next_retry_at = $26, ledger_attempts = $27,
                    stale_flagged_at = $28, idempotency_key = $29, notes = $30,
                    created_at = $31, updated_at = $32
                WHERE id = $1 AND status = $33
                "#,
            ),
            job,
        )
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return match self.get_job(job.id).await? {
                Some(_) => Err(Error::ConcurrentModification {
                    job_id: job.id,
                    expected,
                }),
                None => Err(Error::JobNotFound(job.id)),
            };
        }

        if let Some(entry) = history {
            Self::insert_history(&mut tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_job_history(&self, job_id: Uuid) -> Result<Vec<JobHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, previous_status, new_status, notes, metadata, created_at
            FROM conversion_job_history
            WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn list_buffer_thresholds(&self) -> Result<Vec<BufferThreshold>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account, min_threshold, target_threshold, max_threshold,
                   conversion_batch_size, notes, created_at, updated_at
            FROM buffer_thresholds
            ORDER BY account
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(threshold_from_row).collect()
    }

    async fn upsert_buffer_threshold(&self, threshold: &BufferThreshold) -> Result<()> {
        threshold.validate()?;
        sqlx::query(
            r#"
            INSERT INTO buffer_thresholds
                (id, account, min_threshold, target_threshold, max_threshold,
                 conversion_batch_size, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (account) DO UPDATE SET
                min_threshold = EXCLUDED.min_threshold,
                target_threshold = EXCLUDED.target_threshold,
                max_threshold = EXCLUDED.max_threshold,
                conversion_batch_size = EXCLUDED.conversion_batch_size,
                notes = EXCLUDED.notes,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(threshold.id)
        .bind(threshold.account.as_str())
        .bind(threshold.min_threshold)
        .bind(threshold.target_threshold)
        .bind(threshold.max_threshold)
        .bind(threshold.conversion_batch_size)
        .bind(threshold.notes.as_deref())
        .bind(threshold.created_at)
        .bind(threshold.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<ConversionProvider>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, kind, priority, status, supports_usdc_to_usd, supports_usd_to_usdc,
                   min_conversion_amount, max_conversion_amount, daily_volume_limit,
                   daily_volume_used, success_count, failure_count, last_success_at,
                   last_failure_at, created_at, updated_at
            FROM conversion_providers
            ORDER BY priority, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(provider_from_row).collect()
    }

    async fn upsert_provider(&self, provider: &ConversionProvider) -> Result<()> {
        provider.validate()?;
        sqlx::query(
            r#"
            INSERT INTO conversion_providers
                (id, name, kind, priority, status, supports_usdc_to_usd, supports_usd_to_usdc,
                 min_conversion_amount, max_conversion_amount, daily_volume_limit,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                priority = EXCLUDED.priority,
                status = EXCLUDED.status,
                supports_usdc_to_usd = EXCLUDED.supports_usdc_to_usd,
                supports_usd_to_usdc = EXCLUDED.supports_usd_to_usdc,
                min_conversion_amount = EXCLUDED.min_conversion_amount,
                max_conversion_amount = EXCLUDED.max_conversion_amount,
                daily_volume_limit = EXCLUDED.daily_volume_limit,
                updated_at = NOW()
            "#,
        )
        .bind(provider.id)
        .bind(&provider.name)
        .bind(provider.kind.as_str())
        .bind(provider.priority)
        .bind(provider.status.as_str())
        .bind(provider.supports_usdc_to_usd)
        .bind(provider.supports_usd_to_usdc)
        .bind(provider.min_conversion_amount)
        .bind(provider.max_conversion_amount)
        .bind(provider.daily_volume_limit)
        .bind(provider.created_at)
        .bind(provider.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_provider_success(
        &self,
        provider_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE conversion_providers SET
                success_count = success_count + 1,
                daily_volume_used = daily_volume_used + $2,
                last_success_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(provider_id)
        .bind(amount)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::Validation(format!("unknown provider {}", provider_id)));
        }
        Ok(())
    }

    async fn record_provider_failure(&self, provider_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE conversion_providers SET
                failure_count = failure_count + 1,
                last_failure_at = $2,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(provider_id)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::Validation(format!("unknown provider {}", provider_id)));
        }
        Ok(())
    }
}
