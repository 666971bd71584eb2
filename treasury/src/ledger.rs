//! Ledger port
//!
//! The double-entry ledger is owned elsewhere; the treasury only posts
//! balanced entries and reads balances. A batch of entries is applied
//! atomically under one transaction ID. Postings are deduplicated by
//! `reference`, so a replay after a crash returns the original
//! transaction instead of moving funds twice.

use crate::types::{AccountId, Currency};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Account funding opening balances in the in-memory ledger
pub const OPENING_EQUITY_ACCOUNT: &str = "system:opening_equity";

/// Clearing account between the source and destination legs of a conversion
pub fn conversion_clearing_account(currency: Currency) -> AccountId {
    AccountId::new(format!(
        "system:conversion_clearing_{}",
        currency.code().to_lowercase()
    ))
}

/// Account collecting provider fees
pub fn conversion_fees_account(currency: Currency) -> AccountId {
    AccountId::new(format!(
        "system:conversion_fees_{}",
        currency.code().to_lowercase()
    ))
}

/// One balanced two-leg entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account whose balance decreases
    pub debit_account: AccountId,
    /// Account whose balance increases
    pub credit_account: AccountId,
    /// Amount moved
    pub amount: Decimal,
    /// Currency of the amount
    pub currency: Currency,
    /// Dedup key
    pub reference: String,
    /// Description
    pub description: Option<String>,
}

impl LedgerEntry {
    /// Reject entries that cannot be posted
    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "ledger amount must be positive, got {}",
                self.amount
            )));
        }
        if self.debit_account == self.credit_account {
            return Err(Error::Validation(format!(
                "debit and credit are both {}",
                self.debit_account
            )));
        }
        if self.reference.is_empty() {
            return Err(Error::Validation("ledger reference is required".to_string()));
        }
        Ok(())
    }
}

/// A posted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPosting {
    /// Ledger transaction ID
    pub transaction_id: Uuid,
    /// Posted entry
    pub entry: LedgerEntry,
    /// Posted at
    pub posted_at: DateTime<Utc>,
}

/// Debit-balance and credit-balance totals across every account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialBalance {
    /// Total debited
    pub total_debits: Decimal,
    /// Total credited
    pub total_credits: Decimal,
}

impl TrialBalance {
    /// Debits equal credits
    pub fn is_balanced(&self) -> bool {
        self.total_debits == self.total_credits
    }
}

/// Double-entry ledger consumed by the treasury and reconciliation engines
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Post every entry or none, under one transaction ID
    ///
    /// A batch whose references were all posted together before returns
    /// that transaction ID. A batch overlapping earlier postings only in
    /// part is rejected.
    async fn post_balanced_entries(&self, entries: &[LedgerEntry]) -> Result<Uuid>;

    /// Post a single entry
    async fn post_balanced_entry(&self, entry: &LedgerEntry) -> Result<Uuid> {
        self.post_balanced_entries(std::slice::from_ref(entry)).await
    }

    /// Current balance of an account (zero when unknown)
    async fn get_balance(&self, account: &AccountId) -> Result<Decimal>;

    /// Posting carrying this reference, if any
    async fn find_by_reference(&self, reference: &str) -> Result<Option<LedgerPosting>>;

    /// Debit-balance and credit-balance totals across all accounts
    async fn trial_balance(&self) -> Result<TrialBalance>;
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<AccountId, Decimal>,
    postings: Vec<LedgerPosting>,
    by_reference: HashMap<String, usize>,
}

/// In-process ledger for tests and the sandbox node
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Fund an account from opening equity
    pub fn seed_balance(&self, account: &AccountId, amount: Decimal, currency: Currency) -> Result<Uuid> {
        let entry = LedgerEntry {
            debit_account: AccountId::new(OPENING_EQUITY_ACCOUNT),
            credit_account: account.clone(),
            amount,
            currency,
            reference: format!("opening:{}:{}", account, Uuid::new_v4()),
            description: Some("opening balance".to_string()),
        };
        self.post(std::slice::from_ref(&entry))
    }

    /// Every posting, oldest first
    pub fn postings(&self) -> Vec<LedgerPosting> {
        self.state.read().postings.clone()
    }

    fn post(&self, entries: &[LedgerEntry]) -> Result<Uuid> {
        if entries.is_empty() {
            return Err(Error::Validation("ledger batch is empty".to_string()));
        }
        let mut references = HashSet::new();
        for entry in entries {
            entry.validate()?;
            if !references.insert(entry.reference.as_str()) {
                return Err(Error::Validation(format!(
                    "ledger reference {} repeated within one batch",
                    entry.reference
                )));
            }
        }

        let mut state = self.state.write();
        let posted: Vec<Uuid> = entries
            .iter()
            .filter_map(|entry| state.by_reference.get(&entry.reference))
            .map(|&index| state.postings[index].transaction_id)
            .collect();
        if let Some(&existing) = posted.first() {
            if posted.len() == entries.len() && posted.iter().all(|id| *id == existing) {
                debug!("Ledger batch already posted as {}", existing);
                return Ok(existing);
            }
            return Err(Error::Validation(format!(
                "ledger batch partially overlaps transaction {}",
                existing
            )));
        }

        let transaction_id = Uuid::new_v4();
        let posted_at = Utc::now();
        for entry in entries {
            *state
                .balances
                .entry(entry.debit_account.clone())
                .or_insert(Decimal::ZERO) -= entry.amount;
            *state
                .balances
                .entry(entry.credit_account.clone())
                .or_insert(Decimal::ZERO) += entry.amount;

            let index = state.postings.len();
            state.postings.push(LedgerPosting {
                transaction_id,
                entry: entry.clone(),
                posted_at,
            });
            state.by_reference.insert(entry.reference.clone(), index);
        }

        Ok(transaction_id)
    }
}

#[async_trait]
impl LedgerService for InMemoryLedger {
    async fn post_balanced_entries(&self, entries: &[LedgerEntry]) -> Result<Uuid> {
        self.post(entries)
    }

    async fn get_balance(&self, account: &AccountId) -> Result<Decimal> {
        Ok(self
            .state
            .read()
            .balances
            .get(account)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<LedgerPosting>> {
        let state = self.state.read();
        Ok(state
            .by_reference
            .get(reference)
            .map(|&index| state.postings[index].clone()))
    }

    async fn trial_balance(&self) -> Result<TrialBalance> {
        let state = self.state.read();
        let mut trial = TrialBalance {
            total_debits: Decimal::ZERO,
            total_credits: Decimal::ZERO,
        };
        for balance in state.balances.values() {
            if *balance < Decimal::ZERO {
                trial.total_debits -= *balance;
            } else {
                trial.total_credits += *balance;
            }
        }
        Ok(trial)
    }
}
