//! Treasury node binary
//!
//! Runs the treasury settlement and monitor loops alongside the hourly and
//! daily reconciliation loops until interrupted.

use anyhow::Context;
use prometheus::Registry;
use reconciliation::{
    CheckType, ConversionJobTotalsProbe, InMemoryReconciliationRepository, LedgerAccountProbe,
    LedgerConsistencyProbe, PgReconciliationRepository, RailBalanceFeed, ReconciliationEngine,
    ReconciliationRepository, ReconciliationScheduler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treasury::{
    BufferAccount, ConversionRail, Currency, InMemoryLedger, InMemoryTreasuryRepository,
    LedgerService, PgTreasuryRepository, RailRegistry, TreasuryEngine, TreasuryRepository,
    TreasuryScheduler,
};

const MAX_DB_CONNECTIONS: u32 = 10;

fn load_treasury_config() -> anyhow::Result<treasury::Config> {
    match std::env::var("TREASURY_CONFIG") {
        Ok(path) => treasury::Config::from_file(&path)
            .with_context(|| format!("loading treasury config from {}", path)),
        Err(_) => Ok(treasury::Config::from_env()?),
    }
}

fn load_reconciliation_config() -> anyhow::Result<reconciliation::Config> {
    match std::env::var("RECONCILIATION_CONFIG") {
        Ok(path) => reconciliation::Config::from_file(&path)
            .with_context(|| format!("loading reconciliation config from {}", path)),
        Err(_) => Ok(reconciliation::Config::from_env()?),
    }
}

async fn open_treasury_repository(
    config: &treasury::Config,
) -> anyhow::Result<Arc<dyn TreasuryRepository>> {
    match &config.database_url {
        Some(url) => {
            let repository = PgTreasuryRepository::connect(url, MAX_DB_CONNECTIONS).await?;
            repository.migrate().await?;
            info!("Treasury repository: postgres");
            Ok(Arc::new(repository))
        }
        None => {
            info!("Treasury repository: in-memory");
            Ok(Arc::new(InMemoryTreasuryRepository::new()))
        }
    }
}

async fn open_reconciliation_repository(
    config: &reconciliation::Config,
) -> anyhow::Result<Arc<dyn ReconciliationRepository>> {
    match &config.database_url {
        Some(url) => {
            let repository = PgReconciliationRepository::connect(url, MAX_DB_CONNECTIONS).await?;
            repository.migrate().await?;
            info!("Reconciliation repository: postgres");
            Ok(Arc::new(repository))
        }
        None => {
            info!("Reconciliation repository: in-memory");
            Ok(Arc::new(InMemoryReconciliationRepository::new()))
        }
    }
}

/// Fund every buffer at its target so the sandbox starts healthy
///
/// With a single provider the fiat buffer opens at what that provider
/// reports holding for us, so the provider balance check starts clean.
async fn seed_sandbox_ledger(
    ledger: &InMemoryLedger,
    config: &treasury::Config,
    rails: &RailRegistry,
) -> anyhow::Result<()> {
    for buffer in &config.buffers {
        let account = config.engine.ledger_account(buffer.account);
        let opening = match (buffer.account, config.providers.as_slice()) {
            (BufferAccount::FiatAtProvider, [provider]) => rails
                .rail(provider.id)?
                .get_balance(Currency::Usd)
                .await
                .with_context(|| format!("reading custody at {}", provider.name))?,
            _ => buffer.target_threshold,
        };
        ledger.seed_balance(&account, opening, buffer.account.currency())?;
        debug!("Seeded {} with {}", account, opening);
    }
    Ok(())
}

fn register_probes(
    engine: &mut ReconciliationEngine,
    treasury_config: &treasury::Config,
    treasury_repository: Arc<dyn TreasuryRepository>,
    ledger: Arc<dyn LedgerService>,
    rails: &RailRegistry,
) -> anyhow::Result<()> {
    engine.register_probe(Arc::new(LedgerConsistencyProbe::new(
        Arc::clone(&ledger),
        Currency::Usd,
    )));

    for currency in [Currency::Usd, Currency::Usdc] {
        engine.register_probe(Arc::new(ConversionJobTotalsProbe::new(
            Arc::clone(&treasury_repository),
            Arc::clone(&ledger),
            currency,
        )));
    }

    // One fiat account backs the provider float, so only a single rail can
    // be compared against it.
    match treasury_config.providers.as_slice() {
        [provider] => {
            let account = treasury_config
                .engine
                .ledger_account(BufferAccount::FiatAtProvider);
            let feed = RailBalanceFeed::new(
                provider.name.clone(),
                rails.rail(provider.id)?,
                Currency::Usd,
            );
            engine.register_probe(Arc::new(LedgerAccountProbe::new(
                CheckType::ProviderBalance,
                account,
                Currency::Usd,
                ledger,
                Arc::new(feed),
            )?));
        }
        providers => {
            warn!(
                "Provider balance check disabled: {} providers share one fiat account",
                providers.len()
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting treasury node");

    let treasury_config = load_treasury_config()?;
    let reconciliation_config = load_reconciliation_config()?;
    info!(
        "Configuration loaded - {} buffers, {} providers, settlement every {}s, hourly reconciliation every {}s",
        treasury_config.buffers.len(),
        treasury_config.providers.len(),
        treasury_config.scheduler.settlement_interval().as_secs(),
        reconciliation_config.schedule.hourly_interval_secs
    );

    let registry = Arc::new(Registry::new());
    let rails = Arc::new(RailRegistry::build(&treasury_config.providers)?);
    let ledger = Arc::new(InMemoryLedger::new());
    seed_sandbox_ledger(&ledger, &treasury_config, &rails).await?;

    let treasury_repository = open_treasury_repository(&treasury_config).await?;
    let treasury_engine = Arc::new(TreasuryEngine::new(
        &treasury_config,
        Arc::clone(&treasury_repository),
        ledger.clone(),
        Arc::clone(&rails),
        treasury::Metrics::with_registry(Arc::clone(&registry))?,
    ));
    treasury_engine.seed_from_config(&treasury_config).await?;

    let mut reconciliation_engine = ReconciliationEngine::new(
        &reconciliation_config,
        open_reconciliation_repository(&reconciliation_config).await?,
        ledger.clone(),
        reconciliation::Metrics::with_registry(Arc::clone(&registry))?,
    );
    register_probes(
        &mut reconciliation_engine,
        &treasury_config,
        treasury_repository,
        ledger,
        &rails,
    )?;
    info!(
        "Reconciliation engine ready with {} probes",
        reconciliation_engine.probe_count()
    );

    let shutdown = CancellationToken::new();
    let treasury_scheduler = TreasuryScheduler::with_token(
        treasury_engine,
        treasury_config.scheduler.clone(),
        shutdown.clone(),
    );
    let reconciliation_scheduler = ReconciliationScheduler::with_token(
        Arc::new(reconciliation_engine),
        reconciliation_config.schedule.clone(),
        shutdown.clone(),
    );

    treasury_scheduler.start()?;
    reconciliation_scheduler.start()?;
    info!("Treasury node running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down treasury node");

    shutdown.cancel();
    treasury_scheduler.stop().await?;
    reconciliation_scheduler.stop().await?;

    let gathered = registry.gather();
    debug!("Exported {} metric families at shutdown", gathered.len());
    Ok(())
}
