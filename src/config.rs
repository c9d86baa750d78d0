use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::costing::usd_to_usd_micros;
use crate::types::{Margin, SourceType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Engine configuration. Every field has a serde default so a partial TOML
/// document (or an empty one) yields a working config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Bounded retry budget for transient store conflicts. After this many
    /// retries the operation fails closed instead of blocking further.
    #[serde(default = "default_max_txn_retries")]
    pub max_txn_retries: u32,

    /// Reference valuation applied to BYOK/local usage, USD per 1 000
    /// tokens. The upstream default of $0.01 is a commercial placeholder,
    /// not vetted pricing policy, which is why it is a knob and not a
    /// constant.
    #[serde(default = "default_byok_reference_usd_per_1k")]
    pub byok_reference_usd_per_1k: f64,

    /// Fallback pricing used when a source type has no configured margin
    /// row. Zero markup unless overridden.
    #[serde(default)]
    pub default_margin: DefaultMarginConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DefaultMarginConfig {
    #[serde(default)]
    pub base_cost_per_1k_usd: f64,
    #[serde(default)]
    pub margin_percent: f64,
    #[serde(default)]
    pub min_charge_usd: f64,
}

impl DefaultMarginConfig {
    pub fn to_margin(&self, source_type: SourceType) -> Margin {
        Margin {
            source_type,
            base_cost_per_1k_usd_micros: usd_to_usd_micros(self.base_cost_per_1k_usd),
            margin_percent: self.margin_percent,
            min_charge_usd_micros: usd_to_usd_micros(self.min_charge_usd),
            is_active: true,
        }
    }
}

fn check_rate(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be finite and >= 0, got {value}"),
        });
    }
    Ok(())
}

fn default_max_txn_retries() -> u32 {
    3
}

fn default_byok_reference_usd_per_1k() -> f64 {
    0.01
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            max_txn_retries: default_max_txn_retries(),
            byok_reference_usd_per_1k: default_byok_reference_usd_per_1k(),
            default_margin: DefaultMarginConfig::default(),
        }
    }
}

impl BillingConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_rate("byok_reference_usd_per_1k", self.byok_reference_usd_per_1k)?;
        check_rate(
            "default_margin.base_cost_per_1k_usd",
            self.default_margin.base_cost_per_1k_usd,
        )?;
        check_rate("default_margin.margin_percent", self.default_margin.margin_percent)?;
        check_rate("default_margin.min_charge_usd", self.default_margin.min_charge_usd)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = BillingConfig::from_toml_str("").expect("config");
        assert_eq!(config.max_txn_retries, 3);
        assert_eq!(config.byok_reference_usd_per_1k, 0.01);
        assert_eq!(config.default_margin.margin_percent, 0.0);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let raw = "max_txn_retries = 5\n\n[default_margin]\nmargin_percent = 12.5\n";
        let config = BillingConfig::from_toml_str(raw).expect("config");
        assert_eq!(config.max_txn_retries, 5);
        assert_eq!(config.byok_reference_usd_per_1k, 0.01);
        assert_eq!(config.default_margin.margin_percent, 12.5);
    }

    #[test]
    fn negative_reference_rate_is_rejected() {
        let err = BillingConfig::from_toml_str("byok_reference_usd_per_1k = -1.0");
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn negative_default_margin_prices_are_rejected() {
        let err = BillingConfig::from_toml_str("[default_margin]\nbase_cost_per_1k_usd = -0.03");
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue {
                field: "default_margin.base_cost_per_1k_usd",
                ..
            })
        ));

        let err = BillingConfig::from_toml_str("[default_margin]\nmin_charge_usd = -0.01");
        assert!(matches!(
            err,
            Err(ConfigError::InvalidValue {
                field: "default_margin.min_charge_usd",
                ..
            })
        ));

        let err = BillingConfig::from_toml_str("[default_margin]\nmargin_percent = nan");
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn default_margin_converts_to_micros() {
        let config = DefaultMarginConfig {
            base_cost_per_1k_usd: 0.03,
            margin_percent: 30.0,
            min_charge_usd: 0.01,
        };
        let margin = config.to_margin(SourceType::Platform);
        assert_eq!(margin.base_cost_per_1k_usd_micros, 30_000);
        assert_eq!(margin.min_charge_usd_micros, 10_000);
        assert!(margin.is_active);
    }
}
