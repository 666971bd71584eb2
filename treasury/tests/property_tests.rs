//! Property-based tests for treasury invariants
//!
//! - Health partition: every balance falls in exactly one contiguous region
//! - Replenishment: non-negative multiple of the batch, zero iff at target
//! - Selection: never returns an inactive, unhealthy or over-capacity provider
//! - Idempotency: one job per key no matter how many inserts race

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use treasury::{
    buffer::{BufferHealth, BufferThreshold},
    job::{ConversionJob, JobHistoryEntry, NewConversionJob},
    provider::{ConversionProvider, ProviderKind, ProviderStatus},
    selector, AccountId, BufferAccount, ConversionDirection, ConversionTrigger,
    InMemoryTreasuryRepository, JobStatus, TreasuryRepository,
};
use uuid::Uuid;

/// Strategy for generating valid amounts (positive decimals)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000_00i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Strategy for generating balances, including zero and overdrawn
fn balance_strategy() -> impl Strategy<Value = Decimal> {
    (-1_000_000_00i64..100_000_000_00i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Strategy for generating ordered thresholds
fn threshold_strategy() -> impl Strategy<Value = BufferThreshold> {
    (
        1i64..1_000_000i64,
        1i64..1_000_000i64,
        1i64..1_000_000i64,
        1i64..100_000i64,
    )
        .prop_map(|(min, target_gap, max_gap, batch)| {
            let min = Decimal::new(min, 0);
            let target = min + Decimal::new(target_gap, 0);
            let max = target + Decimal::new(max_gap, 0);
            BufferThreshold::new(
                BufferAccount::UsdcOnchain,
                min,
                target,
                max,
                Decimal::new(batch, 0),
            )
            .unwrap()
        })
}

fn status_strategy() -> impl Strategy<Value = ProviderStatus> {
    prop_oneof![
        Just(ProviderStatus::Active),
        Just(ProviderStatus::Inactive),
        Just(ProviderStatus::Degraded),
    ]
}

fn direction_strategy() -> impl Strategy<Value = ConversionDirection> {
    prop_oneof![
        Just(ConversionDirection::UsdcToUsd),
        Just(ConversionDirection::UsdToUsdc),
    ]
}

/// Strategy for generating provider records with arbitrary health and limits
fn provider_strategy() -> impl Strategy<Value = ConversionProvider> {
    (
        1i32..5,
        status_strategy(),
        any::<bool>(),
        any::<bool>(),
        1i64..1_000_00i64,
        prop::option::of(1_000_00i64..10_000_000_00i64),
        prop::option::of(0i64..10_000_000_00i64),
        0u64..50,
        0u64..50,
    )
        .prop_map(
            |(priority, status, usdc_to_usd, usd_to_usdc, min, max, limit, ok, failed)| {
                let now = Utc::now();
                ConversionProvider {
                    id: Uuid::new_v4(),
                    name: format!("p{}", priority),
                    kind: ProviderKind::Simulated,
                    priority,
                    status,
                    supports_usdc_to_usd: usdc_to_usd,
                    supports_usd_to_usdc: usd_to_usdc,
                    min_conversion_amount: Decimal::new(min, 2),
                    max_conversion_amount: max.map(|m| Decimal::new(m, 2)),
                    daily_volume_limit: limit.map(|l| Decimal::new(l, 2)),
                    daily_volume_used: Decimal::ZERO,
                    success_count: ok,
                    failure_count: failed,
                    last_success_at: None,
                    last_failure_at: None,
                    created_at: now,
                    updated_at: now,
                }
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: health regions partition the balance line in order
    #[test]
    fn prop_health_partition(threshold in threshold_strategy(), balance in balance_strategy()) {
        let health = threshold.check_health_status(balance);
        let expected = if balance < threshold.min_threshold {
            BufferHealth::CriticalLow
        } else if balance < threshold.target_threshold {
            BufferHealth::BelowTarget
        } else if balance <= threshold.max_threshold {
            BufferHealth::Healthy
        } else {
            BufferHealth::OverCapitalized
        };
        prop_assert_eq!(health, expected);
        prop_assert_eq!(
            health.needs_replenishment(),
            balance < threshold.target_threshold
        );
    }

    /// Property: replenishment is a non-negative batch multiple that reaches target
    #[test]
    fn prop_replenishment_batches(threshold in threshold_strategy(), balance in balance_strategy()) {
        let amount = threshold.calculate_replenishment_amount(balance);
        prop_assert!(amount >= Decimal::ZERO);
        prop_assert_eq!(amount % threshold.conversion_batch_size, Decimal::ZERO);
        prop_assert_eq!(amount.is_zero(), balance >= threshold.target_threshold);
        if !amount.is_zero() {
            prop_assert!(balance + amount >= threshold.target_threshold);
            prop_assert!(
                balance + amount - threshold.conversion_batch_size < threshold.target_threshold
            );
        }
    }

    /// Property: the selected provider is always eligible and best-ranked
    #[test]
    fn prop_selection_respects_eligibility(
        providers in prop::collection::vec(provider_strategy(), 0..8),
        direction in direction_strategy(),
        amount in amount_strategy(),
    ) {
        match selector::select(&providers, direction, amount) {
            Ok(selected) => {
                prop_assert_eq!(selected.status, ProviderStatus::Active);
                prop_assert!(selected.supports(direction));
                prop_assert!(selected.is_healthy());
                prop_assert!(selected.has_capacity(amount));
                for other in providers.iter().filter(|p| selector::is_eligible(p, direction, amount)) {
                    prop_assert!(selected.priority <= other.priority);
                }
            }
            Err(_) => {
                prop_assert!(providers
                    .iter()
                    .all(|p| !selector::is_eligible(p, direction, amount)));
            }
        }
    }

    /// Property: racing inserts with one key store exactly one job
    #[test]
    fn prop_one_job_per_idempotency_key(copies in 1usize..8, amount in amount_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let repo = Arc::new(InMemoryTreasuryRepository::new());
            let mut handles = Vec::new();

            for _ in 0..copies {
                let repo = Arc::clone(&repo);
                handles.push(tokio::spawn(async move {
                    let job = ConversionJob::new(
                        NewConversionJob {
                            direction: ConversionDirection::UsdcToUsd,
                            amount,
                            trigger: ConversionTrigger::Manual,
                            source_account: AccountId::new("system:usdc_onchain"),
                            destination_account: AccountId::new("system:broker_operational"),
                            idempotency_key: "same-key".to_string(),
                            notes: None,
                        },
                        3,
                        Utc::now(),
                    )
                    .unwrap();
                    let history = JobHistoryEntry::record(&job, None, "created");
                    repo.insert_job_if_absent(&job, &history).await.unwrap().into_job().id
                }));
            }

            let mut ids = Vec::new();
            for handle in handles {
                ids.push(handle.await.unwrap());
            }
            ids.dedup();

            prop_assert_eq!(ids.len(), 1);
            prop_assert_eq!(
                repo.list_jobs_by_status(&JobStatus::ALL).await.unwrap().len(),
                1
            );
            Ok(())
        })?;
    }
}
