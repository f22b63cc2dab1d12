//! Pattern classification for sparse and step-like accounts.
//!
//! The pattern classifier is consulted before any model fitting: when it
//! claims an account (sparse or step-like), its own forecast is final for
//! that account.

mod features;
mod sparse;
mod step;

pub use features::{scan_steps, StepFeatures, StepScanConfig};
pub use sparse::{detect_sparse, sparse_forecast};
pub use step::{
    predictability_score, step_forecast, StepClassifier, ThresholdStepClassifier,
};

use crate::core::{MonthlyForecast, MonthlySeries};
use crate::error::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Which pattern claimed an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Too few observations per trailing year-window to model seasonality.
    Sparse,
    /// Piecewise-constant history with occasional level shifts.
    Step,
}

/// A final forecast produced by the pattern classifier.
#[derive(Debug, Clone)]
pub struct PatternForecast {
    pub kind: PatternKind,
    pub forecast: MonthlyForecast,
}

/// Thresholds for sparse and step detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// A trailing year-window with at least this many observations defeats
    /// sparse detection.
    pub sparse_min_per_year: usize,
    /// Forecast months whose historical observation probability falls below
    /// this cutoff are suppressed rather than forecast.
    pub month_probability_cutoff: f64,
    /// Relative jump size that counts as a step.
    pub step_relative_threshold: f64,
    /// Floor on the normalizing magnitude when computing relative jumps.
    pub magnitude_floor: f64,
    /// Minimum predictability score for a pattern projection to be blended
    /// in; below it only the conservative last-value forecast is used.
    pub predictability_threshold: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            sparse_min_per_year: 3,
            month_probability_cutoff: 0.2,
            step_relative_threshold: 0.1,
            magnitude_floor: 1e-3,
            predictability_threshold: 0.3,
        }
    }
}

impl PatternConfig {
    fn scan_config(&self) -> StepScanConfig {
        StepScanConfig {
            relative_threshold: self.step_relative_threshold,
            magnitude_floor: self.magnitude_floor,
        }
    }
}

/// Routes an account series to the sparse or step forecaster, or declines.
#[derive(Debug, Clone, Default)]
pub struct PatternClassifier {
    config: PatternConfig,
}

impl PatternClassifier {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    /// Try to claim the account.
    ///
    /// Sparse detection runs first; step detection only applies to
    /// non-sparse accounts. Returns `None` when neither pattern claims the
    /// series, leaving it to the trend-seasonality path.
    pub fn claim(
        &self,
        series: &MonthlySeries,
        origin: NaiveDate,
        horizon: usize,
        step_classifier: &dyn StepClassifier,
    ) -> Result<Option<PatternForecast>> {
        if detect_sparse(series, self.config.sparse_min_per_year) {
            let forecast = sparse_forecast(
                series,
                origin,
                horizon,
                self.config.month_probability_cutoff,
            )?;
            return Ok(Some(PatternForecast {
                kind: PatternKind::Sparse,
                forecast,
            }));
        }

        let features = scan_steps(series, &self.config.scan_config());
        if step_classifier.is_step_like(&features) {
            let forecast = step_forecast(
                series,
                &features,
                origin,
                horizon,
                self.config.predictability_threshold,
            )?;
            return Ok(Some(PatternForecast {
                kind: PatternKind::Step,
                forecast,
            }));
        }

        Ok(None)
    }
}
