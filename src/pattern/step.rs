//! Step-function forecasting with an injected step classifier.

use crate::core::{month_span, MonthlyForecast, MonthlySeries};
use crate::error::{ForecastError, Result};
use crate::pattern::features::StepFeatures;
use crate::utils::stats;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Decides whether a series should be forecast as a step function.
///
/// The decision rule is an external capability: the default below is a
/// plain threshold rule, substitutable by a trained model without touching
/// the rest of the pattern classifier.
pub trait StepClassifier: Send + Sync {
    fn is_step_like(&self, features: &StepFeatures) -> bool;
}

/// Default threshold rule over the step features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdStepClassifier {
    /// Minimum fraction of points explained by valid segments.
    pub min_explained_fraction: f64,
    /// Minimum segment quality score.
    pub min_quality: f64,
    /// Maximum coefficient of variation of step magnitudes.
    pub max_magnitude_cv: f64,
    /// Maximum coefficient of variation of step intervals.
    pub max_interval_cv: f64,
}

impl Default for ThresholdStepClassifier {
    fn default() -> Self {
        Self {
            min_explained_fraction: 0.6,
            min_quality: 0.5,
            max_magnitude_cv: 1.5,
            max_interval_cv: 1.5,
        }
    }
}

impl StepClassifier for ThresholdStepClassifier {
    fn is_step_like(&self, features: &StepFeatures) -> bool {
        if features.n_points == 0 {
            return false;
        }
        // Fully constant or two-level histories are step-like by
        // definition.
        if features.is_constant || features.is_binary {
            return true;
        }
        // Anything else needs at least one level change; a single smooth
        // segment is trend territory, not a step function.
        if features.step_count == 0 {
            return false;
        }
        if features.explained_fraction < self.min_explained_fraction {
            return false;
        }
        if !features.quality.is_finite() || features.quality < self.min_quality {
            return false;
        }
        // CV thresholds only bind when the statistic is defined.
        if features.magnitude_cv.is_finite() && features.magnitude_cv > self.max_magnitude_cv {
            return false;
        }
        if features.interval_cv.is_finite() && features.interval_cv > self.max_interval_cv {
            return false;
        }
        true
    }
}

/// Predictability score in [0, 1] for a step-like series.
///
/// Zero when fewer than 3 steps exist; otherwise the unweighted mean of up
/// to three components — exp(-magnitude CV), exp(-interval CV) and the
/// segment quality score — using only the components that are defined.
pub fn predictability_score(features: &StepFeatures) -> f64 {
    if features.step_count < 3 {
        return 0.0;
    }

    let mut components = Vec::with_capacity(3);
    let magnitude_term = (-features.magnitude_cv).exp();
    if magnitude_term.is_finite() {
        components.push(magnitude_term);
    }
    let interval_term = (-features.interval_cv).exp();
    if interval_term.is_finite() {
        components.push(interval_term);
    }
    if features.quality.is_finite() {
        components.push(features.quality);
    }

    if components.is_empty() {
        0.0
    } else {
        stats::mean(&components).clamp(0.0, 1.0)
    }
}

/// Project the historical step pattern forward.
///
/// Steps of the median historical magnitude are applied every
/// 75th-percentile historical interval, starting from the last observed
/// value.
fn pattern_projection(
    features: &StepFeatures,
    last_month: NaiveDate,
    last_value: f64,
    origin: NaiveDate,
    horizon: usize,
) -> Option<Vec<f64>> {
    if features.magnitudes.is_empty() || features.intervals.is_empty() {
        return None;
    }
    let magnitude = stats::median(&features.magnitudes);
    let interval = stats::quantile(&features.intervals, 0.75).ceil().max(1.0) as i32;

    let mut values = Vec::with_capacity(horizon);
    for step in 0..horizon {
        let months_out = month_span(last_month, origin) + step as i32;
        let steps_taken = (months_out / interval).max(0) as f64;
        values.push(last_value + magnitude * steps_taken);
    }
    Some(values)
}

/// Forecast a step-like series.
///
/// A constant series projects its last value. Otherwise the forecast is
/// the predictability-weighted blend `score * pattern + (1 - score) *
/// conservative`, where the conservative forecast repeats the last
/// observed value. The blend degrades gracefully from confident pattern
/// extrapolation to flat carry-forward as regularity decreases.
pub fn step_forecast(
    series: &MonthlySeries,
    features: &StepFeatures,
    origin: NaiveDate,
    horizon: usize,
    predictability_threshold: f64,
) -> Result<MonthlyForecast> {
    let Some((last_month, last_value)) = series.last_observed() else {
        return Err(ForecastError::EmptyData);
    };
    if horizon == 0 {
        return Err(ForecastError::InvalidParameter(
            "horizon must be positive".to_string(),
        ));
    }

    if features.is_constant {
        return MonthlyForecast::from_values(origin, vec![last_value; horizon]);
    }

    let conservative = vec![last_value; horizon];
    let score = predictability_score(features);

    let pattern = if score >= predictability_threshold {
        pattern_projection(features, last_month, last_value, origin, horizon)
    } else {
        None
    };

    let values = match pattern {
        Some(pattern) => pattern
            .iter()
            .zip(&conservative)
            .map(|(p, c)| score * p + (1.0 - score) * c)
            .collect(),
        None => conservative,
    };

    MonthlyForecast::from_values(origin, values)
}
