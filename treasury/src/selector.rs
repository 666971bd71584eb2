//! Provider selection
//!
//! Pure ranking over provider records. Callers load the records fresh on
//! every job creation and retry, so health and remaining capacity reflect
//! the latest counters.

use crate::provider::{ConversionProvider, ProviderStatus};
use crate::types::ConversionDirection;
use crate::{Error, Result};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Whether a provider may take this conversion
pub fn is_eligible(
    provider: &ConversionProvider,
    direction: ConversionDirection,
    amount: rust_decimal::Decimal,
) -> bool {
    provider.status == ProviderStatus::Active
        && provider.supports(direction)
        && provider.is_healthy()
        && provider.has_capacity(amount)
}

/// Eligible providers, best first
///
/// Sorted by priority (lower first), then by success rate (higher first).
pub fn rank(
    providers: &[ConversionProvider],
    direction: ConversionDirection,
    amount: rust_decimal::Decimal,
) -> Vec<ConversionProvider> {
    let mut ranked: Vec<ConversionProvider> = providers
        .iter()
        .filter(|p| {
            let eligible = is_eligible(p, direction, amount);
            if !eligible {
                debug!(
                    "Provider {} not eligible for {} {} (status={}, success_rate={:.1})",
                    p.name,
                    direction,
                    amount,
                    p.status.as_str(),
                    p.success_rate()
                );
            }
            eligible
        })
        .cloned()
        .collect();

    ranked.sort_by(|a, b| match a.priority.cmp(&b.priority) {
        Ordering::Equal => b
            .success_rate()
            .partial_cmp(&a.success_rate())
            .unwrap_or(Ordering::Equal),
        other => other,
    });

    ranked
}

/// Best eligible provider
pub fn select(
    providers: &[ConversionProvider],
    direction: ConversionDirection,
    amount: rust_decimal::Decimal,
) -> Result<ConversionProvider> {
    let selected = rank(providers, direction, amount)
        .into_iter()
        .next()
        .ok_or(Error::NoProviderAvailable { direction, amount })?;

    info!(
        "Selected provider {} for {} {} (priority={}, success_rate={:.1})",
        selected.name,
        direction,
        amount,
        selected.priority,
        selected.success_rate()
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn provider(name: &str, priority: i32, successes: u64, failures: u64) -> ConversionProvider {
        let now = Utc::now();
        ConversionProvider {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: ProviderKind::Simulated,
            priority,
            status: ProviderStatus::Active,
            supports_usdc_to_usd: true,
            supports_usd_to_usdc: true,
            min_conversion_amount: dec!(100),
            max_conversion_amount: Some(dec!(100000)),
            daily_volume_limit: None,
            daily_volume_used: Decimal::ZERO,
            success_count: successes,
            failure_count: failures,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_lowest_priority_wins() {
        let providers = vec![provider("b", 2, 100, 0), provider("a", 1, 90, 10)];
        let selected = select(&providers, ConversionDirection::UsdcToUsd, dec!(1000)).unwrap();
        assert_eq!(selected.name, "a");
    }

    #[test]
    fn test_tie_broken_by_success_rate() {
        let providers = vec![provider("worse", 1, 85, 15), provider("better", 1, 99, 1)];
        let ranked = rank(&providers, ConversionDirection::UsdToUsdc, dec!(1000));
        assert_eq!(ranked[0].name, "better");
        assert_eq!(ranked[1].name, "worse");
    }

    #[test]
    fn test_skips_unhealthy_and_over_capacity() {
        let unhealthy = provider("unhealthy", 1, 1, 9);
        let mut inactive = provider("inactive", 1, 0, 0);
        inactive.status = ProviderStatus::Inactive;
        let mut one_way = provider("one-way", 1, 0, 0);
        one_way.supports_usdc_to_usd = false;
        let fallback = provider("fallback", 5, 0, 0);

        let providers = vec![unhealthy, inactive, one_way, fallback];
        let selected = select(&providers, ConversionDirection::UsdcToUsd, dec!(1000)).unwrap();
        assert_eq!(selected.name, "fallback");

        let err = select(&providers, ConversionDirection::UsdcToUsd, dec!(200000)).unwrap_err();
        assert!(matches!(err, Error::NoProviderAvailable { .. }));
    }
}
