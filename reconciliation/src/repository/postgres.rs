//! Postgres reconciliation repository

use super::ReconciliationRepository;
use crate::types::{ReconciliationCheck, ReconciliationException, ReconciliationReport};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

const REPORT_COLUMNS: &str = "id, run_type, status, started_at, completed_at, total_checks, \
    passed_checks, failed_checks, exceptions_count, auto_corrected_count, error_message, created_at";

const CHECK_COLUMNS: &str = "id, report_id, check_type, currency, expected_value, actual_value, \
    difference, passed, subject, error_message, execution_time_ms, created_at";

const EXCEPTION_COLUMNS: &str = "id, report_id, check_id, check_type, severity, description, \
    expected_value, actual_value, difference, currency, affected_user_id, affected_entity, \
    auto_corrected, correction_action, resolved_at, resolved_by, resolution_notes, created_at";

/// `sqlx` Postgres repository
#[derive(Debug, Clone)]
pub struct PgReconciliationRepository {
    pool: PgPool,
}

impl PgReconciliationRepository {
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
        info!("Connected to reconciliation database");
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
            .map_err(|e| Error::Config(format!("reconciliation migration failed: {}", e)))?;
        Ok(())
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn count(row: &PgRow, column: &str) -> Result<u32> {
    let value: i32 = row.try_get(column)?;
    Ok(value.max(0) as u32)
}

fn report_from_row(row: &PgRow) -> Result<ReconciliationReport> {
    let run_type: String = row.try_get("run_type")?;
    let status: String = row.try_get("status")?;

    Ok(ReconciliationReport {
        id: row.try_get("id")?,
        run_type: run_type.parse()?,
        status: status.parse()?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        total_checks: count(row, "total_checks")?,
        passed_checks: count(row, "passed_checks")?,
        failed_checks: count(row, "failed_checks")?,
        exceptions_count: count(row, "exceptions_count")?,
        auto_corrected_count: count(row, "auto_corrected_count")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn check_from_row(row: &PgRow) -> Result<ReconciliationCheck> {
    let check_type: String = row.try_get("check_type")?;
    let currency: String = row.try_get("currency")?;
    let execution_time_ms: i64 = row.try_get("execution_time_ms")?;

    Ok(ReconciliationCheck {
        id: row.try_get("id")?,
        report_id: row.try_get("report_id")?,
        check_type: check_type.parse()?,
        currency: currency.parse()?,
        expected: row.try_get("expected_value")?,
        actual: row.try_get("actual_value")?,
        difference: row.try_get("difference")?,
        passed: row.try_get("passed")?,
        subject: row.try_get("subject")?,
        error_message: row.try_get("error_message")?,
        execution_time_ms: execution_time_ms.max(0) as u64,
        created_at: row.try_get("created_at")?,
    })
}

fn exception_from_row(row: &PgRow) -> Result<ReconciliationException> {
    let check_type: String = row.try_get("check_type")?;
    let severity: String = row.try_get("severity")?;
    let currency: String = row.try_get("currency")?;

    Ok(ReconciliationException {
        id: row.try_get("id")?,
        report_id: row.try_get("report_id")?,
        check_id: row.try_get("check_id")?,
        check_type: check_type.parse()?,
        severity: severity.parse()?,
        description: row.try_get("description")?,
        expected: row.try_get("expected_value")?,
        actual: row.try_get("actual_value")?,
        difference: row.try_get("difference")?,
        currency: currency.parse()?,
        affected_user_id: row.try_get("affected_user_id")?,
        affected_entity: row.try_get("affected_entity")?,
        auto_corrected: row.try_get("auto_corrected")?,
        correction_action: row.try_get("correction_action")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        resolution_notes: row.try_get("resolution_notes")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ReconciliationRepository for PgReconciliationRepository {
    async fn save_report(&self, report: &ReconciliationReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_reports
                (id, run_type, status, started_at, completed_at, total_checks, passed_checks,
                 failed_checks, exceptions_count, auto_corrected_count, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                total_checks = EXCLUDED.total_checks,
                passed_checks = EXCLUDED.passed_checks,
                failed_checks = EXCLUDED.failed_checks,
                exceptions_count = EXCLUDED.exceptions_count,
                auto_corrected_count = EXCLUDED.auto_corrected_count,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(report.id)
        .bind(report.run_type.as_str())
        .bind(report.status.as_str())
        .bind(report.started_at)
        .bind(report.completed_at)
        .bind(report.total_checks as i32)
        .bind(report.passed_checks as i32)
        .bind(report.failed_checks as i32)
        .bind(report.exceptions_count as i32)
        .bind(report.auto_corrected_count as i32)
        .bind(report.error_message.as_deref())
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<ReconciliationReport>> {
        let sql = format!(
            "SELECT {} FROM reconciliation_reports WHERE id = $1",
            REPORT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn latest_report(&self) -> Result<Option<ReconciliationReport>> {
        let sql = format!(
            "SELECT {} FROM reconciliation_reports ORDER BY started_at DESC LIMIT 1",
            REPORT_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn insert_check(&self, check: &ReconciliationCheck) -> Result<()> {
        let sql = format!(
            "INSERT INTO reconciliation_checks ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            CHECK_COLUMNS
        );
        sqlx::query(&sql)
            .bind(check.id)
            .bind(check.report_id)
            .bind(check.check_type.as_str())
            .bind(check.currency.code())
            .bind(check.expected)
            .bind(check.actual)
            .bind(check.difference)
            .bind(check.passed)
            .bind(check.subject.as_deref())
            .bind(check.error_message.as_deref())
            .bind(check.execution_time_ms.min(i64::MAX as u64) as i64)
            .bind(check.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_checks(&self, report_id: Uuid) -> Result<Vec<ReconciliationCheck>> {
        let sql = format!(
            "SELECT {} FROM reconciliation_checks WHERE report_id = $1 ORDER BY created_at, id",
            CHECK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(report_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(check_from_row).collect()
    }

    async fn insert_exception(&self, exception: &ReconciliationException) -> Result<()> {
        let sql = format!(
            "INSERT INTO reconciliation_exceptions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, \
             $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            EXCEPTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(exception.id)
            .bind(exception.report_id)
            .bind(exception.check_id)
            .bind(exception.check_type.as_str())
            .bind(exception.severity.as_str())
            .bind(&exception.description)
            .bind(exception.expected)
            .bind(exception.actual)
            .bind(exception.difference)
            .bind(exception.currency.code())
            .bind(exception.affected_user_id)
            .bind(exception.affected_entity.as_deref())
            .bind(exception.auto_corrected)
            .bind(exception.correction_action.as_deref())
            .bind(exception.resolved_at)
            .bind(exception.resolved_by.as_deref())
            .bind(exception.resolution_notes.as_deref())
            .bind(exception.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_exception(&self, exception: &ReconciliationException) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE reconciliation_exceptions SET
                auto_corrected = $2,
                correction_action = $3,
                resolved_at = $4,
                resolved_by = $5,
                resolution_notes = $6
            WHERE id = $1
            "#,
        )
        .bind(exception.id)
        .bind(exception.auto_corrected)
        .bind(exception.correction_action.as_deref())
        .bind(exception.resolved_at)
        .bind(exception.resolved_by.as_deref())
        .bind(exception.resolution_notes.as_deref())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Error::ExceptionNotFound(exception.id));
        }
        Ok(())
    }

    async fn get_exception(&self, id: Uuid) -> Result<Option<ReconciliationException>> {
        let sql = format!(
            "SELECT {} FROM reconciliation_exceptions WHERE id = $1",
            EXCEPTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(exception_from_row).transpose()
    }

    async fn list_exceptions(&self, report_id: Uuid) -> Result<Vec<ReconciliationException>> {
        let sql = format!(
            "SELECT {} FROM reconciliation_exceptions WHERE report_id = $1 ORDER BY created_at",
            EXCEPTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(report_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(exception_from_row).collect()
    }

    async fn list_open_exceptions(&self) -> Result<Vec<ReconciliationException>> {
        let sql = format!(
            "SELECT {} FROM reconciliation_exceptions WHERE resolved_at IS NULL \
             AND NOT auto_corrected ORDER BY created_at",
            EXCEPTION_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(exception_from_row).collect()
    }
}
