//! Periodic treasury loops
//!
//! Two independent loops drive the engine:
//! - settlement: retry, submit, replenish (default every 5 minutes)
//! - monitor: poll providers, post ledger entries (default every minute)
//!
//! Each loop is single-flight. A tick that lands while the previous run is
//! still going is skipped, and `trigger_immediate_cycle` shares the
//! settlement loop's guard. Stopping cancels the ticker but lets the
//! in-flight run finish.

use crate::config::SchedulerConfig;
use crate::engine::{SettlementCycleSummary, TreasuryEngine};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// At-most-one-run flag shared by a loop and its manual trigger
#[derive(Debug, Clone)]
pub struct SingleFlight {
    name: &'static str,
    running: Arc<AtomicBool>,
}

/// Held for the duration of a run; releases the flag on drop
#[derive(Debug)]
pub struct SingleFlightGuard {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    /// Idle flag
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the flag unless a run is in progress
    pub fn try_acquire(&self) -> Option<SingleFlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleFlightGuard {
                running: Arc::clone(&self.running),
            })
    }

    /// Claim the flag or fail with `CycleInProgress`
    pub fn acquire(&self) -> Result<SingleFlightGuard> {
        self.try_acquire().ok_or(Error::CycleInProgress(self.name))
    }

    /// Whether a run is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Loop name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Run `task` every `period` until `token` is cancelled
///
/// The first run starts immediately. Missed ticks are skipped, and ticks
/// that find `flight` held are dropped.
pub fn spawn_periodic<F, Fut>(
    flight: SingleFlight,
    period: Duration,
    token: CancellationToken,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("{} loop started (every {:?})", flight.name(), period);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(_guard) = flight.try_acquire() else {
                        debug!("{} still running, skipping tick", flight.name());
                        continue;
                    };
                    task().await;
                }
            }
        }

        info!("{} loop stopped", flight.name());
    })
}

/// A running loop
#[derive(Debug)]
pub struct LoopHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl LoopHandle {
    /// Wrap a spawned loop and the token that stops it
    pub fn new(token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { token, handle }
    }

    /// Cancel and wait for the in-flight run
    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();
        self.handle
            .await
            .map_err(|e| Error::Scheduler(format!("loop task failed: {}", e)))
    }
}

/// Settlement and monitor loops for one engine
pub struct TreasuryScheduler {
    engine: Arc<TreasuryEngine>,
    config: SchedulerConfig,
    lifecycle: CancellationToken,
    settlement_flight: SingleFlight,
    monitor_flight: SingleFlight,
    settlement: Mutex<Option<LoopHandle>>,
    monitor: Mutex<Option<LoopHandle>>,
}

impl TreasuryScheduler {
    /// Scheduler with its own lifecycle token
    pub fn new(engine: Arc<TreasuryEngine>, config: SchedulerConfig) -> Self {
        Self::with_token(engine, config, CancellationToken::new())
    }

    /// Scheduler whose loops also stop when `lifecycle` is cancelled
    pub fn with_token(
        engine: Arc<TreasuryEngine>,
        config: SchedulerConfig,
        lifecycle: CancellationToken,
    ) -> Self {
        Self {
            engine,
            config,
            lifecycle,
            settlement_flight: SingleFlight::new("settlement cycle"),
            monitor_flight: SingleFlight::new("conversion monitor"),
            settlement: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// Start both loops
    pub fn start(&self) -> Result<()> {
        self.start_settlement()?;
        self.start_monitor()?;
        Ok(())
    }

    /// Stop both loops, waiting for in-flight runs
    pub async fn stop(&self) -> Result<()> {
        self.stop_settlement().await?;
        self.stop_monitor().await?;
        info!("Treasury scheduler stopped");
        Ok(())
    }

    /// Start the settlement loop
    pub fn start_settlement(&self) -> Result<()> {
        let mut slot = self.settlement.lock();
        if slot.is_some() {
            return Err(Error::Scheduler("settlement loop already running".to_string()));
        }

        let token = self.lifecycle.child_token();
        let engine = Arc::clone(&self.engine);
        let handle = spawn_periodic(
            self.settlement_flight.clone(),
            self.config.settlement_interval(),
            token.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    if let Err(e) = engine.run_settlement_cycle().await {
                        error!("Settlement cycle failed: {}", e);
                    }
                }
            },
        );

        *slot = Some(LoopHandle::new(token, handle));
        Ok(())
    }

    /// Start the monitor loop
    pub fn start_monitor(&self) -> Result<()> {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return Err(Error::Scheduler("monitor loop already running".to_string()));
        }

        let token = self.lifecycle.child_token();
        let engine = Arc::clone(&self.engine);
        let handle = spawn_periodic(
            self.monitor_flight.clone(),
            self.config.monitor_interval(),
            token.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    if let Err(e) = engine.monitor_conversion_jobs().await {
                        error!("Conversion monitor failed: {}", e);
                    }
                }
            },
        );

        *slot = Some(LoopHandle::new(token, handle));
        Ok(())
    }

    /// Stop the settlement loop
    pub async fn stop_settlement(&self) -> Result<()> {
        let running = self.settlement.lock().take();
        match running {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    /// Stop the monitor loop
    pub async fn stop_monitor(&self) -> Result<()> {
        let running = self.monitor.lock().take();
        match running {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    /// Whether the settlement loop is running
    pub fn is_settlement_running(&self) -> bool {
        self.settlement.lock().is_some()
    }

    /// Whether the monitor loop is running
    pub fn is_monitor_running(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Run a settlement cycle now unless one is already in progress
    pub async fn trigger_immediate_cycle(&self) -> Result<SettlementCycleSummary> {
        let _guard = self.settlement_flight.acquire().map_err(|e| {
            warn!("Immediate settlement cycle rejected: {}", e);
            e
        })?;
        info!("Running immediate settlement cycle");
        self.engine.run_settlement_cycle().await
    }
}

impl std::fmt::Debug for TreasuryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreasuryScheduler")
            .field("config", &self.config)
            .field("settlement_running", &self.is_settlement_running())
            .field("monitor_running", &self.is_monitor_running())
            .finish()
    }
}
