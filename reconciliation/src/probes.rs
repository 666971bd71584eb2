//! Data sources for reconciliation checks
//!
//! A probe reads both sides of one comparison. The expected side is always
//! what the ledger (or the treasury's own records) believe; the actual side
//! is what an external system reports.

use crate::types::CheckType;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;
use treasury::{
    AccountId, ConversionRail, Currency, JobStatus, LedgerService, TreasuryRepository,
};

/// Both sides of one comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReading {
    /// Source-of-truth side
    pub expected: Decimal,
    /// Observed side
    pub actual: Decimal,
}

/// One comparison the engine runs
#[async_trait]
pub trait ReconciliationProbe: Send + Sync {
    /// Kind of comparison
    fn check_type(&self) -> CheckType;

    /// Currency compared
    fn currency(&self) -> Currency;

    /// What is compared, recorded on checks and exceptions
    fn subject(&self) -> Option<String> {
        None
    }

    /// Ledger account a compensating posting may adjust
    fn correction_account(&self) -> Option<AccountId> {
        None
    }

    /// Read both sides
    async fn read(&self) -> Result<ProbeReading>;
}

/// An external balance (provider custody, chain custody, deposit or
/// withdrawal totals)
#[async_trait]
pub trait BalanceFeed: Send + Sync {
    /// Where the figure comes from
    fn source(&self) -> String;

    /// Current figure
    async fn balance(&self) -> Result<Decimal>;
}

/// Ledger debits against ledger credits
pub struct LedgerConsistencyProbe {
    ledger: Arc<dyn LedgerService>,
    currency: Currency,
}

impl LedgerConsistencyProbe {
    /// Probe over the ledger's trial balance, reported in `currency`
    pub fn new(ledger: Arc<dyn LedgerService>, currency: Currency) -> Self {
        Self { ledger, currency }
    }
}

#[async_trait]
impl ReconciliationProbe for LedgerConsistencyProbe {
    fn check_type(&self) -> CheckType {
        CheckType::LedgerConsistency
    }

    fn currency(&self) -> Currency {
        self.currency
    }

    fn subject(&self) -> Option<String> {
        Some("trial balance".to_string())
    }

    async fn read(&self) -> Result<ProbeReading> {
        let trial = self.ledger.trial_balance().await?;
        Ok(ProbeReading {
            expected: trial.total_debits,
            actual: trial.total_credits,
        })
    }
}

/// A ledger account against an external feed
pub struct LedgerAccountProbe {
    check_type: CheckType,
    account: AccountId,
    currency: Currency,
    ledger: Arc<dyn LedgerService>,
    feed: Arc<dyn BalanceFeed>,
}

impl LedgerAccountProbe {
    /// Compare `account` with `feed`
    pub fn new(
        check_type: CheckType,
        account: AccountId,
        currency: Currency,
        ledger: Arc<dyn LedgerService>,
        feed: Arc<dyn BalanceFeed>,
    ) -> Result<Self> {
        if matches!(
            check_type,
            CheckType::LedgerConsistency | CheckType::ConversionJobTotals
        ) {
            return Err(Error::Validation(format!(
                "{} is not an account check",
                check_type
            )));
        }
        Ok(Self {
            check_type,
            account,
            currency,
            ledger,
            feed,
        })
    }
}

#[async_trait]
impl ReconciliationProbe for LedgerAccountProbe {
    fn check_type(&self) -> CheckType {
        self.check_type
    }

    fn currency(&self) -> Currency {
        self.currency
    }

    fn subject(&self) -> Option<String> {
        Some(format!("{} vs {}", self.account, self.feed.source()))
    }

    fn correction_account(&self) -> Option<AccountId> {
        Some(self.account.clone())
    }

    async fn read(&self) -> Result<ProbeReading> {
        let expected = self.ledger.get_balance(&self.account).await?;
        let actual = self.feed.balance().await?;
        Ok(ProbeReading { expected, actual })
    }
}

/// Ledger postings of completed conversion jobs against the jobs' converted
/// amounts
pub struct ConversionJobTotalsProbe {
    repository: Arc<dyn TreasuryRepository>,
    ledger: Arc<dyn LedgerService>,
    currency: Currency,
}

impl ConversionJobTotalsProbe {
    /// Probe over completed jobs crediting `currency`
    pub fn new(
        repository: Arc<dyn TreasuryRepository>,
        ledger: Arc<dyn LedgerService>,
        currency: Currency,
    ) -> Self {
        Self {
            repository,
            ledger,
            currency,
        }
    }
}

#[async_trait]
impl ReconciliationProbe for ConversionJobTotalsProbe {
    fn check_type(&self) -> CheckType {
        CheckType::ConversionJobTotals
    }

    fn currency(&self) -> Currency {
        self.currency
    }

    fn subject(&self) -> Option<String> {
        Some(format!("completed {} conversions", self.currency))
    }

    async fn read(&self) -> Result<ProbeReading> {
        let jobs = self
            .repository
            .list_jobs_by_status(&[JobStatus::Completed])
            .await?;

        let mut expected = Decimal::ZERO;
        let mut actual = Decimal::ZERO;
        for job in jobs
            .iter()
            .filter(|j| j.direction.destination_currency() == self.currency)
        {
            actual += job.converted_amount.unwrap_or_default();
            if let Some(posting) = self
                .ledger
                .find_by_reference(&job.destination_leg_reference())
                .await?
            {
                expected += posting.entry.amount;
            }
        }

        Ok(ProbeReading { expected, actual })
    }
}

/// Custody balance reported by a conversion rail
pub struct RailBalanceFeed {
    provider: String,
    rail: Arc<dyn ConversionRail>,
    currency: Currency,
}

impl RailBalanceFeed {
    /// Feed for `currency` held at `provider`
    pub fn new(provider: impl Into<String>, rail: Arc<dyn ConversionRail>, currency: Currency) -> Self {
        Self {
            provider: provider.into(),
            rail,
            currency,
        }
    }
}

#[async_trait]
impl BalanceFeed for RailBalanceFeed {
    fn source(&self) -> String {
        format!("{} {} custody", self.provider, self.currency)
    }

    async fn balance(&self) -> Result<Decimal> {
        Ok(self.rail.get_balance(self.currency).await?)
    }
}

/// Figure pushed by an external watcher (chain indexer, deposit or
/// withdrawal processor)
///
/// Reads fail until the first report arrives.
#[derive(Debug)]
pub struct ReportedBalanceFeed {
    source: String,
    latest: RwLock<Option<Decimal>>,
}

impl ReportedBalanceFeed {
    /// Feed with no report yet
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            latest: RwLock::new(None),
        }
    }

    /// Record the latest figure
    pub fn report(&self, amount: Decimal) {
        *self.latest.write() = Some(amount);
    }
}

#[async_trait]
impl BalanceFeed for ReportedBalanceFeed {
    fn source(&self) -> String {
        self.source.clone()
    }

    async fn balance(&self) -> Result<Decimal> {
        (*self.latest.read())
            .ok_or_else(|| Error::Probe(format!("no figure reported by {} yet", self.source)))
    }
}

impl std::fmt::Debug for LedgerConsistencyProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConsistencyProbe")
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for LedgerAccountProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerAccountProbe")
            .field("check_type", &self.check_type)
            .field("account", &self.account)
            .field("feed", &self.feed.source())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ConversionJobTotalsProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionJobTotalsProbe")
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for RailBalanceFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RailBalanceFeed")
            .field("provider", &self.provider)
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}
