//! Engine-level configuration.

use crate::calendar::TradingDayConfig;
use crate::fallback::FallbackConfig;
use crate::hierarchy::{HierarchyConfig, WeightingMethod};
use crate::pattern::PatternConfig;
use crate::trend::{EligibilityConfig, GridConfig};
use serde::{Deserialize, Serialize};

/// Full configuration surface of the forecasting engine.
///
/// Every component keeps its own config struct; this aggregates them with
/// the cross-cutting options so a deployment can load the whole surface
/// from one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Forecast horizon in months.
    pub horizon: usize,
    /// Only accounts with an observation in the trailing window are
    /// forecast at all.
    pub active_account_window: usize,
    /// Whether the pattern classifier (sparse/step) runs at all.
    pub pattern_forecasting: bool,
    /// Reconciliation weighting method.
    pub weighting_method: WeightingMethod,
    /// Trend dampening on/off.
    pub trend_dampening: bool,
    /// Decay time constant for trend dampening, in months.
    pub dampening_tau: f64,
    pub pattern: PatternConfig,
    pub eligibility: EligibilityConfig,
    pub grid: GridConfig,
    pub hierarchy: HierarchyConfig,
    pub fallback: FallbackConfig,
    pub trading_days: TradingDayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            horizon: 12,
            active_account_window: 12,
            pattern_forecasting: true,
            weighting_method: WeightingMethod::Shrinkage,
            trend_dampening: true,
            dampening_tau: 6.0,
            pattern: PatternConfig::default(),
            eligibility: EligibilityConfig::default(),
            grid: GridConfig::default(),
            hierarchy: HierarchyConfig::default(),
            fallback: FallbackConfig::default(),
            trading_days: TradingDayConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load the configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
