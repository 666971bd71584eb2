//! Conversion job scenarios against scripted collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use treasury::{
    config::{BufferConfig, ProviderConfig},
    provider::{ConversionRequest, RailFailure, RailReceipt, RailStatus, RailStatusReport},
    AccountId, BufferAccount, Config, ConversionDirection, ConversionProvider, ConversionRail,
    ConversionTrigger, Currency, Error, FailureKind, InMemoryLedger, InMemoryTreasuryRepository,
    JobStatus, LedgerEntry, LedgerPosting, LedgerService, Metrics, NewConversionJob,
    ProviderKind, RailRegistry, TreasuryEngine, TreasuryRepository, TreasuryScheduler,
    TrialBalance,
};
use uuid::Uuid;

/// Initiate outcome queued on the scripted rail
enum Initiate {
    Accept,
    Transient,
    Reject(&'static str),
}

/// Rail whose answers are queued by the test
#[derive(Default)]
struct ScriptedRail {
    initiate: Mutex<VecDeque<Initiate>>,
    statuses: Mutex<VecDeque<RailStatusReport>>,
    initiate_calls: AtomicUsize,
    keys: Mutex<Vec<String>>,
    initiate_delay: Mutex<Duration>,
}

impl ScriptedRail {
    fn push_initiate(&self, outcome: Initiate) {
        self.initiate.lock().push_back(outcome);
    }

    fn push_status(&self, report: RailStatusReport) {
        self.statuses.lock().push_back(report);
    }
}

fn report(status: RailStatus) -> RailStatusReport {
    RailStatusReport {
        status,
        converted_amount: None,
        exchange_rate: None,
        fees: None,
        failure: None,
        raw_response: json!({ "status": format!("{:?}", status) }),
    }
}

fn completed(converted: Decimal) -> RailStatusReport {
    RailStatusReport {
        converted_amount: Some(converted),
        exchange_rate: Some(Decimal::ONE),
        fees: Some(Decimal::ZERO),
        ..report(RailStatus::Completed)
    }
}

#[async_trait]
impl ConversionRail for ScriptedRail {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Simulated
    }

    async fn initiate_conversion(&self, request: &ConversionRequest) -> treasury::Result<RailReceipt> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().push(request.idempotency_key.clone());
        let delay = *self.initiate_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.initiate.lock().pop_front().unwrap_or(Initiate::Accept);
        match outcome {
            Initiate::Accept => Ok(RailReceipt {
                external_tx_id: format!("ext-{}", request.job_id),
                status: RailStatus::Pending,
                raw_response: json!({ "accepted": true }),
            }),
            Initiate::Transient => Err(Error::ProviderTransient {
                provider: "scripted".to_string(),
                message: "connection reset".to_string(),
            }),
            Initiate::Reject(code) => Err(Error::ProviderRejected {
                provider: "scripted".to_string(),
                code: code.to_string(),
                message: "destination account closed".to_string(),
            }),
        }
    }

    async fn get_conversion_status(&self, _external_tx_id: &str) -> treasury::Result<RailStatusReport> {
        Ok(self
            .statuses
            .lock()
            .pop_front()
            .unwrap_or_else(|| report(RailStatus::Processing)))
    }

    async fn get_balance(&self, _currency: Currency) -> treasury::Result<Decimal> {
        Ok(Decimal::ZERO)
    }
}

/// Ledger that fails the next N posts
#[derive(Default)]
struct FlakyLedger {
    inner: InMemoryLedger,
    fail_next: AtomicUsize,
    post_calls: AtomicUsize,
}

#[async_trait]
impl LedgerService for FlakyLedger {
    async fn post_balanced_entries(&self, entries: &[LedgerEntry]) -> treasury::Result<Uuid> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Ledger("ledger unavailable".to_string()));
        }
        self.inner.post_balanced_entries(entries).await
    }

    async fn get_balance(&self, account: &AccountId) -> treasury::Result<Decimal> {
        self.inner.get_balance(account).await
    }

    async fn find_by_reference(&self, reference: &str) -> treasury::Result<Option<LedgerPosting>> {
        self.inner.find_by_reference(reference).await
    }

    async fn trial_balance(&self) -> treasury::Result<TrialBalance> {
        self.inner.trial_balance().await
    }
}

struct Harness {
    engine: Arc<TreasuryEngine>,
    rail: Arc<ScriptedRail>,
    ledger: Arc<FlakyLedger>,
    repository: Arc<InMemoryTreasuryRepository>,
    config: Config,
}

async fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config {
        buffers: vec![BufferConfig {
            account: BufferAccount::BrokerOperational,
            min_threshold: dec!(50000),
            target_threshold: dec!(200000),
            max_threshold: dec!(500000),
            conversion_batch_size: dec!(25000),
            notes: None,
        }],
        providers: vec![ProviderConfig::simulated("scripted", 1)],
        ..Config::default()
    };
    config.retry.initial_delay_ms = 0;
    config.retry.jitter_factor = 0.0;
    config.engine.idempotency_window_secs = Some(86_400);
    configure(&mut config);

    let rail = Arc::new(ScriptedRail::default());
    let mut rails = RailRegistry::new();
    let record = ConversionProvider::from_config(&config.providers[0]).unwrap();
    rails.register(&record, rail.clone()).unwrap();

    let repository = Arc::new(InMemoryTreasuryRepository::new());
    let ledger = Arc::new(FlakyLedger::default());
    let engine = Arc::new(TreasuryEngine::new(
        &config,
        repository.clone(),
        ledger.clone(),
        Arc::new(rails),
        Metrics::new().unwrap(),
    ));
    engine.seed_from_config(&config).await.unwrap();

    Harness {
        engine,
        rail,
        ledger,
        repository,
        config,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

fn manual(key: &str, amount: Decimal) -> NewConversionJob {
    NewConversionJob {
        direction: ConversionDirection::UsdcToUsd,
        amount,
        trigger: ConversionTrigger::Manual,
        source_account: AccountId::new("system:usdc_onchain"),
        destination_account: AccountId::new("system:broker_operational"),
        idempotency_key: key.to_string(),
        notes: None,
    }
}

#[tokio::test]
async fn test_permanent_initiate_failure_is_terminal() {
    let h = harness().await;
    h.rail.push_initiate(Initiate::Reject("invalid_destination"));

    let summary = h.engine.run_settlement_cycle().await.unwrap();
    assert_eq!(summary.jobs_created, 1);
    assert_eq!(summary.submission_failures, 1);

    let jobs = h.repository.list_jobs_by_status(&JobStatus::ALL).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.failure_kind, Some(FailureKind::Permanent));
    assert_eq!(job.error_code.as_deref(), Some("invalid_destination"));
    assert!(job.is_terminal());
    assert_eq!(h.ledger.post_calls.load(Ordering::SeqCst), 0);

    // not retried on the next cycle, and the buffer is not re-requested
    // within the same window
    let next = h.engine.run_settlement_cycle().await.unwrap();
    assert_eq!(next.jobs_retried, 0);
    assert_eq!(h.rail.initiate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.ledger.post_calls.load(Ordering::SeqCst), 0);

    let providers = h.repository.list_providers().await.unwrap();
    assert_eq!(providers[0].failure_count, 1);
}

#[tokio::test]
async fn test_ledger_failure_retried_until_completed() {
    let h = harness_with(|c| c.engine.ledger_alert_after = 2).await;
    h.ledger.fail_next.store(2, Ordering::SeqCst);

    let job = h
        .engine
        .request_conversion(manual("manual-ledger", dec!(10000)))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::ProviderProcessing);

    h.rail.push_status(completed(dec!(9990)));
    let first = h.engine.monitor_conversion_jobs().await.unwrap();
    assert_eq!(first.provider_completed, 1);
    assert_eq!(first.ledger_failures, 1);

    let stuck = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(stuck.status, JobStatus::LedgerUpdating);
    assert_eq!(stuck.ledger_attempts, 1);
    assert!(stuck.ledger_transaction_id.is_none());

    let second = h.engine.monitor_conversion_jobs().await.unwrap();
    assert_eq!(second.ledger_failures, 1);
    assert_eq!(h.engine.metrics().ledger_alerts.get(), 1);

    let third = h.engine.monitor_conversion_jobs().await.unwrap();
    assert_eq!(third.completed, 1);

    let done = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.ledger_attempts, 2);
    let posting = h
        .ledger
        .find_by_reference(&done.destination_leg_reference())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.ledger_transaction_id, Some(posting.transaction_id));
    assert_eq!(posting.entry.amount, dec!(9990));
    assert_eq!(posting.entry.currency, Currency::Usd);
    assert_eq!(h.ledger.post_calls.load(Ordering::SeqCst), 3);
    assert!(h.ledger.trial_balance().await.unwrap().is_balanced());

    // provider was polled once; later passes only retried the ledger
    let providers = h.repository.list_providers().await.unwrap();
    assert_eq!(providers[0].success_count, 1);
}

#[tokio::test]
async fn test_duplicate_idempotency_key_yields_one_job() {
    let h = harness().await;

    let (a, b) = tokio::join!(
        h.engine.request_conversion(manual("manual-dup", dec!(5000))),
        h.engine.request_conversion(manual("manual-dup", dec!(5000))),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.id, b.id);

    let again = h
        .engine
        .request_conversion(manual("manual-dup", dec!(7000)))
        .await
        .unwrap();
    assert_eq!(again.id, a.id);
    assert_eq!(again.amount, dec!(5000));

    let jobs = h.repository.list_jobs_by_status(&JobStatus::ALL).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(h.rail.initiate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried_with_fresh_provider_key() {
    let h = harness().await;
    h.rail.push_initiate(Initiate::Transient);

    let job = h
        .engine
        .request_conversion(manual("manual-transient", dec!(5000)))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Transient));
    assert!(job.can_retry());
    assert!(job.next_retry_at.is_some());

    let summary = h.engine.run_settlement_cycle().await.unwrap();
    assert_eq!(summary.jobs_retried, 1);

    let retried = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::ProviderProcessing);
    assert_eq!(retried.retry_count, 1);

    // the job keeps its own key; the rail sees one key per attempt
    assert_eq!(retried.idempotency_key, "manual-transient");
    let keys: Vec<String> = h
        .rail
        .keys
        .lock()
        .iter()
        .filter(|k| k.starts_with("manual-transient"))
        .cloned()
        .collect();
    assert_eq!(keys, vec!["manual-transient", "manual-transient:retry:1"]);
}

#[tokio::test]
async fn test_provider_reported_retryable_failure_then_retry_succeeds() {
    let h = harness().await;
    let job = h
        .engine
        .request_conversion(manual("manual-rail-retry", dec!(5000)))
        .await
        .unwrap();

    h.rail.push_status(RailStatusReport {
        failure: Some(RailFailure {
            code: "liquidity_unavailable".to_string(),
            message: "Try again later".to_string(),
            retryable: true,
        }),
        ..report(RailStatus::Failed)
    });
    let summary = h.engine.monitor_conversion_jobs().await.unwrap();
    assert_eq!(summary.provider_failed, 1);

    let failed = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_kind, Some(FailureKind::Transient));
    assert!(failed.can_retry());

    let cycle = h.engine.run_settlement_cycle().await.unwrap();
    assert_eq!(cycle.jobs_retried, 1);
    let resubmitted = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(resubmitted.status, JobStatus::ProviderProcessing);
    assert_eq!(resubmitted.retry_count, 1);

    // the rail must not treat the retry as a replay of the failed attempt
    let keys: Vec<String> = h
        .rail
        .keys
        .lock()
        .iter()
        .filter(|k| k.starts_with("manual-rail-retry"))
        .cloned()
        .collect();
    assert_eq!(keys, vec!["manual-rail-retry", "manual-rail-retry:retry:1"]);

    assert_eq!(cycle.skipped_in_flight, 1);

    h.rail.push_status(completed(dec!(4995)));
    h.engine.monitor_conversion_jobs().await.unwrap();

    let done = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert_eq!(done.converted_amount, Some(dec!(4995)));
    let posting = h
        .ledger
        .find_by_reference(&done.destination_leg_reference())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(posting.entry.amount, dec!(4995));
}

#[tokio::test]
async fn test_retries_exhausted_becomes_terminal() {
    let h = harness_with(|c| c.retry.max_retries = 1).await;
    h.rail.push_initiate(Initiate::Transient);
    h.rail.push_initiate(Initiate::Transient);

    let job = h
        .engine
        .request_conversion(manual("manual-exhaust", dec!(5000)))
        .await
        .unwrap();
    assert!(job.can_retry());

    h.engine.run_settlement_cycle().await.unwrap();
    let job = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(!job.can_retry());
    assert!(job.is_terminal());
    assert!(job.next_retry_at.is_none());
}

#[tokio::test]
async fn test_provider_reported_failure_keeps_provider_error() {
    let h = harness().await;
    let job = h
        .engine
        .request_conversion(manual("manual-provider-fail", dec!(5000)))
        .await
        .unwrap();

    h.rail.push_status(RailStatusReport {
        failure: Some(RailFailure {
            code: "compliance_hold".to_string(),
            message: "Funds held pending review".to_string(),
            retryable: false,
        }),
        ..report(RailStatus::Failed)
    });

    let summary = h.engine.monitor_conversion_jobs().await.unwrap();
    assert_eq!(summary.provider_failed, 1);

    let failed = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("compliance_hold"));
    assert_eq!(failed.error_message.as_deref(), Some("Funds held pending review"));
    assert!(failed.is_terminal());
    assert_eq!(h.ledger.post_calls.load(Ordering::SeqCst), 0);

    let cancelled = h.engine.cancel_job(job.id, "closed by ops").await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let history = h.engine.job_history(job.id).await.unwrap();
    assert_eq!(history.last().unwrap().new_status, JobStatus::Cancelled);
    assert_eq!(
        history.last().unwrap().previous_status,
        Some(JobStatus::Failed)
    );
}

#[tokio::test]
async fn test_stale_job_flagged_once_and_never_cancelled() {
    let h = harness_with(|c| c.engine.stale_after_secs = 0).await;
    let job = h
        .engine
        .request_conversion(manual("manual-stale", dec!(5000)))
        .await
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));

    let first = h.engine.monitor_conversion_jobs().await.unwrap();
    let second = h.engine.monitor_conversion_jobs().await.unwrap();
    assert_eq!(first.stale_flagged, 1);
    assert_eq!(second.stale_flagged, 0);
    assert_eq!(h.engine.metrics().stale_jobs.get(), 1);

    let job = h.engine.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::ProviderProcessing);
    assert!(job.stale_flagged_at.is_some());
}

#[tokio::test]
async fn test_poll_error_leaves_job_untouched() {
    struct BrokenPollRail;

    #[async_trait]
    impl ConversionRail for BrokenPollRail {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Simulated
        }

        async fn initiate_conversion(
            &self,
            request: &ConversionRequest,
        ) -> treasury::Result<RailReceipt> {
            Ok(RailReceipt {
                external_tx_id: request.idempotency_key.clone(),
                status: RailStatus::Pending,
                raw_response: json!({}),
            })
        }

        async fn get_conversion_status(&self, _: &str) -> treasury::Result<RailStatusReport> {
            Err(Error::ProviderTransient {
                provider: "broken".to_string(),
                message: "timeout".to_string(),
            })
        }

        async fn get_balance(&self, _: Currency) -> treasury::Result<Decimal> {
            Ok(Decimal::ZERO)
        }
    }

    let config = Config {
        buffers: vec![],
        providers: vec![ProviderConfig::simulated("broken", 1)],
        ..Config::default()
    };
    let mut rails = RailRegistry::new();
    rails
        .register(
            &ConversionProvider::from_config(&config.providers[0]).unwrap(),
            Arc::new(BrokenPollRail),
        )
        .unwrap();
    let repository = Arc::new(InMemoryTreasuryRepository::new());
    let engine = TreasuryEngine::new(
        &config,
        repository.clone(),
        Arc::new(InMemoryLedger::new()),
        Arc::new(rails),
        Metrics::new().unwrap(),
    );
    engine.seed_from_config(&config).await.unwrap();

    let job = engine
        .request_conversion(manual("manual-poll", dec!(5000)))
        .await
        .unwrap();
    let before = engine.get_job(job.id).await.unwrap();

    let summary = engine.monitor_conversion_jobs().await.unwrap();
    assert_eq!(summary.poll_errors, 1);
    assert_eq!(engine.get_job(job.id).await.unwrap(), before);
}

#[tokio::test]
async fn test_unregistered_provider_fails_startup() {
    let config = Config {
        providers: vec![ProviderConfig::simulated("orphan", 1)],
        ..Config::default()
    };
    let engine = TreasuryEngine::new(
        &config,
        Arc::new(InMemoryTreasuryRepository::new()),
        Arc::new(InMemoryLedger::new()),
        Arc::new(RailRegistry::new()),
        Metrics::new().unwrap(),
    );
    let err = engine.seed_from_config(&config).await.unwrap_err();
    assert!(matches!(err, Error::RailNotRegistered(_)));
}

#[tokio::test]
async fn test_scheduler_runs_and_stops() {
    let h = harness().await;
    h.rail.push_status(completed(dec!(200000)));

    let scheduler = TreasuryScheduler::new(h.engine.clone(), h.config.scheduler.clone());
    scheduler.start().unwrap();
    assert!(scheduler.start_settlement().is_err());

    // the first tick of each loop fires immediately
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_settlement_running());
    assert!(!scheduler.is_monitor_running());

    let jobs = h.repository.list_jobs_by_status(&JobStatus::ALL).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].direction, ConversionDirection::UsdcToUsd);
    assert_eq!(jobs[0].amount, dec!(200000));

    // loops are stopped, so a manual cycle can claim the guard
    let summary = scheduler.trigger_immediate_cycle().await.unwrap();
    assert_eq!(summary.jobs_created, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_cycle_rejected_while_loop_cycle_runs() {
    let h = harness().await;
    *h.rail.initiate_delay.lock() = Duration::from_secs(30);

    let scheduler = TreasuryScheduler::new(h.engine.clone(), h.config.scheduler.clone());
    scheduler.start_settlement().unwrap();

    // the loop's first cycle is now parked inside the slow initiate
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.rail.initiate_calls.load(Ordering::SeqCst), 1);

    let err = scheduler.trigger_immediate_cycle().await.unwrap_err();
    assert!(matches!(err, Error::CycleInProgress(_)));
    assert_eq!(h.rail.initiate_calls.load(Ordering::SeqCst), 1);

    scheduler.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_cycle() {
    let h = harness().await;
    *h.rail.initiate_delay.lock() = Duration::from_secs(30);

    let scheduler = TreasuryScheduler::new(h.engine.clone(), h.config.scheduler.clone());
    scheduler.start_settlement().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let jobs = h.repository.list_jobs_by_status(&JobStatus::ALL).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Pending);

    let before = tokio::time::Instant::now();
    scheduler.stop().await.unwrap();
    assert!(before.elapsed() >= Duration::from_secs(29));
    assert!(!scheduler.is_settlement_running());

    // the cycle ran to completion rather than being dropped mid-submit
    let jobs = h.repository.list_jobs_by_status(&JobStatus::ALL).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::ProviderProcessing);
    assert!(jobs[0].external_tx_id.is_some());

    // and released the guard on the way out
    *h.rail.initiate_delay.lock() = Duration::ZERO;
    let summary = scheduler.trigger_immediate_cycle().await.unwrap();
    assert_eq!(summary.skipped_in_flight, 1);
}
