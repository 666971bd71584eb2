//! In-memory reconciliation repository

use super::ReconciliationRepository;
use crate::types::{ReconciliationCheck, ReconciliationException, ReconciliationReport};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// `dashmap`-backed repository for tests and the sandbox node
#[derive(Debug, Default)]
pub struct InMemoryReconciliationRepository {
    reports: DashMap<Uuid, ReconciliationReport>,
    checks: DashMap<Uuid, Vec<ReconciliationCheck>>,
    exceptions: DashMap<Uuid, ReconciliationException>,
}

impl InMemoryReconciliationRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconciliationRepository for InMemoryReconciliationRepository {
    async fn save_report(&self, report: &ReconciliationReport) -> Result<()> {
        self.reports.insert(report.id, report.clone());
        Ok(())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<ReconciliationReport>> {
        Ok(self.reports.get(&id).map(|r| r.clone()))
    }

    async fn latest_report(&self) -> Result<Option<ReconciliationReport>> {
        Ok(self
            .reports
            .iter()
            .max_by_key(|r| r.started_at)
            .map(|r| r.clone()))
    }

    async fn insert_check(&self, check: &ReconciliationCheck) -> Result<()> {
        self.checks
            .entry(check.report_id)
            .or_default()
            .push(check.clone());
        Ok(())
    }

    async fn list_checks(&self, report_id: Uuid) -> Result<Vec<ReconciliationCheck>> {
        Ok(self
            .checks
            .get(&report_id)
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    async fn insert_exception(&self, exception: &ReconciliationException) -> Result<()> {
        if self.exceptions.contains_key(&exception.id) {
            return Err(Error::Validation(format!(
                "exception {} already stored",
                exception.id
            )));
        }
        self.exceptions.insert(exception.id, exception.clone());
        Ok(())
    }

    async fn update_exception(&self, exception: &ReconciliationException) -> Result<()> {
        match self.exceptions.get_mut(&exception.id) {
            Some(mut stored) => {
                *stored = exception.clone();
                Ok(())
            }
            None => Err(Error::ExceptionNotFound(exception.id)),
        }
    }

    async fn get_exception(&self, id: Uuid) -> Result<Option<ReconciliationException>> {
        Ok(self.exceptions.get(&id).map(|e| e.clone()))
    }

    async fn list_exceptions(&self, report_id: Uuid) -> Result<Vec<ReconciliationException>> {
        let mut exceptions: Vec<ReconciliationException> = self
            .exceptions
            .iter()
            .filter(|e| e.report_id == report_id)
            .map(|e| e.clone())
            .collect();
        exceptions.sort_by_key(|e| e.created_at);
        Ok(exceptions)
    }

    async fn list_open_exceptions(&self) -> Result<Vec<ReconciliationException>> {
        let mut exceptions: Vec<ReconciliationException> = self
            .exceptions
            .iter()
            .filter(|e| e.is_open())
            .map(|e| e.clone())
            .collect();
        exceptions.sort_by_key(|e| e.created_at);
        Ok(exceptions)
    }
}
