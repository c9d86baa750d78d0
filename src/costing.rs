//! Pure billing math: billed-token rounding and margin computation.
//!
//! Everything here is deterministic and side-effect free. It runs before the
//! transaction coordinator is invoked so callers can decide whether to
//! proceed with a debit at all. Money is carried in USD micros; `f64` only
//! appears at the conversion edges and is guarded against non-finite input.

use crate::config::BillingConfig;
use crate::error::BillingError;
use crate::types::{Margin, SourceType};

/// Result of pricing one completed AI call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Charge {
    pub billed_tokens: u64,
    pub margin_usd_micros: u64,
}

/// `ceil(raw_tokens * multiplier)`. Rejects non-finite or negative
/// multipliers instead of silently billing zero.
pub fn billed_tokens(raw_tokens: u64, multiplier: f64) -> Result<u64, BillingError> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return Err(BillingError::InvalidRequest {
            reason: format!("multiplier must be finite and >= 0, got {multiplier}"),
        });
    }
    let billed = (raw_tokens as f64 * multiplier).ceil();
    if billed >= u64::MAX as f64 {
        return Ok(u64::MAX);
    }
    Ok(billed as u64)
}

/// Margin in USD micros for a billed token count.
///
/// Platform usage is priced from the margin row's base cost; BYOK/local usage
/// from the configured reference valuation. Both are then marked up by
/// `margin_percent` and floored at `min_charge`.
pub fn margin_usd_micros(
    billed_tokens: u64,
    source_type: SourceType,
    margin: &Margin,
    config: &BillingConfig,
) -> u64 {
    let base_usd_micros = match source_type {
        SourceType::Platform => per_1k_cost(billed_tokens, margin.base_cost_per_1k_usd_micros),
        SourceType::Byok | SourceType::Local => per_1k_cost(
            billed_tokens,
            usd_to_usd_micros(config.byok_reference_usd_per_1k),
        ),
    };

    let percent = if margin.margin_percent.is_finite() && margin.margin_percent >= 0.0 {
        margin.margin_percent
    } else {
        0.0
    };

    let marked_up = (base_usd_micros as f64 * percent / 100.0).round();
    let marked_up = if !marked_up.is_finite() || marked_up < 0.0 {
        0
    } else if marked_up >= u64::MAX as f64 {
        u64::MAX
    } else {
        marked_up as u64
    };

    marked_up.max(margin.min_charge_usd_micros)
}

/// Rounds tokens and computes the margin in one step.
pub fn compute_charge(
    raw_tokens: u64,
    multiplier: f64,
    source_type: SourceType,
    margin: &Margin,
    config: &BillingConfig,
) -> Result<Charge, BillingError> {
    let billed = billed_tokens(raw_tokens, multiplier)?;
    Ok(Charge {
        billed_tokens: billed,
        margin_usd_micros: margin_usd_micros(billed, source_type, margin, config),
    })
}

/// `tokens / 1000 * per_1k_usd_micros` in integer math, widened to avoid
/// overflow on the intermediate product.
fn per_1k_cost(tokens: u64, per_1k_usd_micros: u64) -> u64 {
    let product = u128::from(tokens) * u128::from(per_1k_usd_micros) / 1000;
    if product > u128::from(u64::MAX) {
        u64::MAX
    } else {
        product as u64
    }
}

/// USD to USD micros with finite/negative guards, clamped at `u64::MAX`.
pub(crate) fn usd_to_usd_micros(usd: f64) -> u64 {
    if !usd.is_finite() || usd < 0.0 {
        return 0;
    }
    let micros = (usd * 1_000_000.0).round();
    if micros >= u64::MAX as f64 {
        u64::MAX
    } else {
        micros as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform_margin() -> Margin {
        Margin {
            source_type: SourceType::Platform,
            base_cost_per_1k_usd_micros: 30_000,
            margin_percent: 30.0,
            min_charge_usd_micros: 10_000,
            is_active: true,
        }
    }

    #[test]
    fn multiplier_rounds_up() {
        assert_eq!(billed_tokens(101, 1.15).expect("billed"), 117);
        assert_eq!(billed_tokens(1000, 1.0).expect("billed"), 1000);
        assert_eq!(billed_tokens(0, 2.5).expect("billed"), 0);
    }

    #[test]
    fn bad_multiplier_is_rejected() {
        assert!(matches!(
            billed_tokens(10, f64::NAN),
            Err(BillingError::InvalidRequest { .. })
        ));
        assert!(matches!(
            billed_tokens(10, -0.5),
            Err(BillingError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn platform_margin_floors_at_min_charge() {
        // base = 0.5k * $0.03 = $0.015, markup 30% = $0.0045, floored at $0.01
        let margin = platform_margin();
        let config = BillingConfig::default();
        assert_eq!(
            margin_usd_micros(500, SourceType::Platform, &margin, &config),
            10_000
        );
    }

    #[test]
    fn platform_margin_above_min_charge() {
        // base = 100k * $0.03 = $3.00, markup 30% = $0.90
        let margin = platform_margin();
        let config = BillingConfig::default();
        assert_eq!(
            margin_usd_micros(100_000, SourceType::Platform, &margin, &config),
            900_000
        );
    }

    #[test]
    fn byok_margin_uses_reference_valuation() {
        // reference = 2k * $0.01 = $0.02, markup 30% = $0.006, floored at $0.01
        let mut margin = platform_margin();
        margin.source_type = SourceType::Byok;
        let config = BillingConfig::default();
        assert_eq!(
            margin_usd_micros(2_000, SourceType::Byok, &margin, &config),
            10_000
        );

        // A larger reference rate moves the markup above the floor.
        let config = BillingConfig {
            byok_reference_usd_per_1k: 1.0,
            ..BillingConfig::default()
        };
        assert_eq!(
            margin_usd_micros(2_000, SourceType::Byok, &margin, &config),
            600_000
        );
    }

    #[test]
    fn compute_charge_combines_rounding_and_margin() {
        let margin = platform_margin();
        let config = BillingConfig::default();
        let charge =
            compute_charge(101, 1.15, SourceType::Platform, &margin, &config).expect("charge");
        assert_eq!(charge.billed_tokens, 117);
        assert_eq!(charge.margin_usd_micros, 10_000);
    }

    #[test]
    fn non_finite_percent_degrades_to_zero_markup() {
        let mut margin = platform_margin();
        margin.margin_percent = f64::INFINITY;
        margin.min_charge_usd_micros = 0;
        let config = BillingConfig::default();
        assert_eq!(
            margin_usd_micros(500, SourceType::Platform, &margin, &config),
            0
        );
    }
}
