//! Hourly and daily reconciliation loops
//!
//! Both loops reuse the treasury's periodic single-flight runner. Each run
//! type has its own guard, so an hourly tick never waits on a long daily
//! run, and a manual trigger is rejected only while another manual run is
//! going.

use crate::config::ScheduleConfig;
use crate::engine::ReconciliationEngine;
use crate::types::{ReconciliationReport, RunType};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use treasury::{spawn_periodic, LoopHandle, SingleFlight};

/// Hourly and daily loops for one engine
pub struct ReconciliationScheduler {
    engine: Arc<ReconciliationEngine>,
    config: ScheduleConfig,
    lifecycle: CancellationToken,
    hourly_flight: SingleFlight,
    daily_flight: SingleFlight,
    manual_flight: SingleFlight,
    hourly: Mutex<Option<LoopHandle>>,
    daily: Mutex<Option<LoopHandle>>,
}

impl ReconciliationScheduler {
    /// Scheduler with its own lifecycle token
    pub fn new(engine: Arc<ReconciliationEngine>, config: ScheduleConfig) -> Self {
        Self::with_token(engine, config, CancellationToken::new())
    }

    /// Scheduler whose loops also stop when `lifecycle` is cancelled
    pub fn with_token(
        engine: Arc<ReconciliationEngine>,
        config: ScheduleConfig,
        lifecycle: CancellationToken,
    ) -> Self {
        Self {
            engine,
            config,
            lifecycle,
            hourly_flight: SingleFlight::new("hourly reconciliation"),
            daily_flight: SingleFlight::new("daily reconciliation"),
            manual_flight: SingleFlight::new("manual reconciliation"),
            hourly: Mutex::new(None),
            daily: Mutex::new(None),
        }
    }

    /// Start both loops
    pub fn start(&self) -> Result<()> {
        self.start_loop(RunType::Hourly)?;
        self.start_loop(RunType::Daily)?;
        Ok(())
    }

    /// Stop both loops, waiting for in-flight runs
    pub async fn stop(&self) -> Result<()> {
        self.stop_loop(RunType::Hourly).await?;
        self.stop_loop(RunType::Daily).await?;
        info!("Reconciliation scheduler stopped");
        Ok(())
    }

    fn slot(&self, run_type: RunType) -> Result<(&Mutex<Option<LoopHandle>>, &SingleFlight, Duration)> {
        match run_type {
            RunType::Hourly => Ok((&self.hourly, &self.hourly_flight, self.config.hourly_interval())),
            RunType::Daily => Ok((&self.daily, &self.daily_flight, self.config.daily_interval())),
            RunType::Manual => Err(Error::Scheduler(
                "manual runs have no loop; use trigger_run".to_string(),
            )),
        }
    }

    /// Start the loop for `run_type`
    pub fn start_loop(&self, run_type: RunType) -> Result<()> {
        let (slot, flight, period) = self.slot(run_type)?;
        let mut slot = slot.lock();
        if slot.is_some() {
            return Err(Error::Scheduler(format!("{} loop already running", run_type)));
        }

        let token = self.lifecycle.child_token();
        let engine = Arc::clone(&self.engine);
        let handle = spawn_periodic(flight.clone(), period, token.clone(), move || {
            let engine = Arc::clone(&engine);
            async move {
                if let Err(e) = engine.run_reconciliation_checks(run_type).await {
                    error!("{} reconciliation failed: {}", run_type, e);
                }
            }
        });

        *slot = Some(LoopHandle::new(token, handle));
        Ok(())
    }

    /// Stop the loop for `run_type`
    pub async fn stop_loop(&self, run_type: RunType) -> Result<()> {
        let (slot, _, _) = self.slot(run_type)?;
        let running = slot.lock().take();
        match running {
            Some(handle) => handle.shutdown().await.map_err(Error::from),
            None => Ok(()),
        }
    }

    /// Whether the loop for `run_type` is running
    pub fn is_running(&self, run_type: RunType) -> bool {
        self.slot(run_type)
            .map(|(slot, _, _)| slot.lock().is_some())
            .unwrap_or(false)
    }

    /// Run now unless a run of the same type is in progress
    pub async fn trigger_run(&self, run_type: RunType) -> Result<ReconciliationReport> {
        let flight = match run_type {
            RunType::Hourly => &self.hourly_flight,
            RunType::Daily => &self.daily_flight,
            RunType::Manual => &self.manual_flight,
        };
        let _guard = flight.try_acquire().ok_or_else(|| {
            warn!("{} rejected: already in progress", flight.name());
            Error::RunInProgress(flight.name())
        })?;
        self.engine.run_reconciliation_checks(run_type).await
    }
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("config", &self.config)
            .field("hourly_running", &self.is_running(RunType::Hourly))
            .field("daily_running", &self.is_running(RunType::Daily))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use crate::repository::InMemoryReconciliationRepository;
    use crate::probes::LedgerConsistencyProbe;
    use treasury::{Currency, InMemoryLedger};

    fn engine() -> Arc<ReconciliationEngine> {
        let ledger = Arc::new(InMemoryLedger::new());
        Arc::new(
            ReconciliationEngine::new(
                &Config::default(),
                Arc::new(InMemoryReconciliationRepository::new()),
                ledger.clone(),
                Metrics::new().unwrap(),
            )
            .with_probe(Arc::new(LedgerConsistencyProbe::new(ledger, Currency::Usd))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_start_and_stop() {
        let engine = engine();
        let scheduler = ReconciliationScheduler::new(Arc::clone(&engine), ScheduleConfig::default());
        scheduler.start().unwrap();
        assert!(scheduler.is_running(RunType::Hourly));
        assert!(scheduler.start_loop(RunType::Daily).is_err());
        assert!(scheduler.start_loop(RunType::Manual).is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running(RunType::Hourly));
        assert!(!scheduler.is_running(RunType::Daily));

        // both loops ran their immediate first tick
        let runs = &engine.metrics().runs;
        assert_eq!(runs.with_label_values(&["hourly", "completed"]).get(), 1);
        assert_eq!(runs.with_label_values(&["daily", "completed"]).get(), 1);
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let scheduler = ReconciliationScheduler::new(engine(), ScheduleConfig::default());
        let report = scheduler.trigger_run(RunType::Manual).await.unwrap();
        assert_eq!(report.run_type, RunType::Manual);
        assert_eq!(report.total_checks, 1);

        let held = scheduler.manual_flight.try_acquire().unwrap();
        assert!(matches!(
            scheduler.trigger_run(RunType::Manual).await,
            Err(Error::RunInProgress(_))
        ));
        drop(held);
    }
}
