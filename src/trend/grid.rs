//! Bounded hyperparameter grid search with candidate filtering.

use crate::core::MonthlySeries;
use crate::error::{ForecastError, Result};
use crate::trend::model::{SeasonalityMode, TrendSeasonModel, TrendSeasonParams};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Grid definition and selection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Trend flexibility values to try.
    pub trend_flexibilities: Vec<f64>,
    /// History fractions used for changepoint placement.
    pub changepoint_fractions: Vec<f64>,
    /// Seasonal composition modes to try.
    pub seasonality_modes: Vec<SeasonalityMode>,
    /// Seasonality regularization values to try.
    pub seasonality_regularizations: Vec<f64>,
    /// Fourier orders for small datasets.
    pub fourier_orders_small: Vec<usize>,
    /// Fourier orders for full-size datasets.
    pub fourier_orders_full: Vec<usize>,
    /// Datasets with fewer months than this are "small".
    pub small_dataset_months: usize,
    /// Candidates whose active-changepoint count relative to training size
    /// reaches this ratio are discarded (survival is strict `<`).
    pub changepoint_filter_ratio: f64,
    /// Delta magnitude below which a changepoint is not counted as active.
    pub active_changepoint_cutoff: f64,
    /// Score by AICc when true, RMSE otherwise.
    pub use_aicc: bool,
    /// Per-fit time budget in seconds.
    pub fit_timeout_secs: u64,
    /// Number of fits per parallel work unit.
    pub batch_size: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            trend_flexibilities: vec![0.05, 0.5],
            changepoint_fractions: vec![0.8, 0.9],
            seasonality_modes: vec![SeasonalityMode::Additive, SeasonalityMode::Multiplicative],
            seasonality_regularizations: vec![0.1, 1.0, 10.0],
            fourier_orders_small: vec![1, 2, 3],
            fourier_orders_full: vec![3, 4, 5, 6],
            small_dataset_months: 24,
            changepoint_filter_ratio: 1.0 / 6.0,
            active_changepoint_cutoff: 0.01,
            use_aicc: true,
            fit_timeout_secs: 7,
            batch_size: 12,
        }
    }
}

/// Cooperative deadline for a single model fit.
///
/// Fitting loops poll `expired` and abandon the candidate when the budget
/// runs out; sibling fits are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct FitBudget {
    deadline: Option<Instant>,
}

impl FitBudget {
    /// A budget that never expires.
    pub fn unlimited() -> Self {
        Self { deadline: None }
    }

    /// A budget expiring after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// The surviving best-fit model for an account or hierarchy node.
#[derive(Debug, Clone)]
pub struct SelectedModel {
    pub model: TrendSeasonModel,
    pub score: f64,
    pub active_changepoints: usize,
    pub train_size: usize,
    pub grid_index: usize,
}

/// Grid search over trend/seasonality hyperparameters.
#[derive(Debug, Clone, Default)]
pub struct GridSearch {
    config: GridConfig,
}

impl GridSearch {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Enumerate the parameter grid in its deterministic order.
    ///
    /// The enumeration order defines the grid index used as the final
    /// selection tie-break, so it must not change between runs.
    pub fn candidates(&self, n_months: usize) -> Vec<TrendSeasonParams> {
        let orders = if n_months < self.config.small_dataset_months {
            &self.config.fourier_orders_small
        } else {
            &self.config.fourier_orders_full
        };

        let mut params = Vec::new();
        for &trend_flexibility in &self.config.trend_flexibilities {
            for &changepoint_fraction in &self.config.changepoint_fractions {
                for &seasonality_mode in &self.config.seasonality_modes {
                    for &seasonality_regularization in &self.config.seasonality_regularizations {
                        for &fourier_order in orders {
                            params.push(TrendSeasonParams {
                                trend_flexibility,
                                changepoint_fraction,
                                seasonality_mode,
                                seasonality_regularization,
                                fourier_order,
                            });
                        }
                    }
                }
            }
        }
        params
    }

    /// Fit the whole grid and select the best surviving candidate.
    ///
    /// Candidates are filtered by the active-changepoint ratio rule; the
    /// minimum-score survivor wins, with ties broken by fewer active
    /// changepoints and then by grid index. Returns
    /// [`ForecastError::NoSurvivingCandidate`] when nothing survives.
    pub fn run(&self, series: &MonthlySeries) -> Result<SelectedModel> {
        let candidates = self.candidates(series.len());
        let timeout = Duration::from_secs(self.config.fit_timeout_secs);
        let batch = self.config.batch_size.max(1);

        let fitted: Vec<Option<SelectedModel>> = candidates
            .par_chunks(batch)
            .enumerate()
            .flat_map(|(chunk_idx, chunk)| {
                chunk
                    .iter()
                    .enumerate()
                    .map(|(i, params)| {
                        let grid_index = chunk_idx * batch + i;
                        self.fit_candidate(series, params.clone(), grid_index, timeout)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let survivors = fitted.into_iter().flatten().filter(|c| {
            let ratio = c.active_changepoints as f64 / c.train_size as f64;
            ratio < self.config.changepoint_filter_ratio
        });

        survivors
            .min_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.active_changepoints.cmp(&b.active_changepoints))
                    .then(a.grid_index.cmp(&b.grid_index))
            })
            .ok_or(ForecastError::NoSurvivingCandidate)
    }

    fn fit_candidate(
        &self,
        series: &MonthlySeries,
        params: TrendSeasonParams,
        grid_index: usize,
        timeout: Duration,
    ) -> Option<SelectedModel> {
        let mut model = TrendSeasonModel::new(params, self.config.active_changepoint_cutoff);
        let budget = FitBudget::with_timeout(timeout);

        match model.fit(series, &budget) {
            Ok(()) => {}
            Err(err) => {
                debug!(grid_index, %err, "grid candidate abandoned");
                return None;
            }
        }

        let score = if self.config.use_aicc {
            model.aicc()?
        } else {
            model.rmse()?
        };
        if !score.is_finite() {
            return None;
        }

        let active_changepoints = model.active_changepoint_count()?;
        let train_size = model.train_size()?;
        Some(SelectedModel {
            model,
            score,
            active_changepoints,
            train_size,
            grid_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::f64::consts::PI;

    fn m(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    fn seasonal_series(months: usize) -> MonthlySeries {
        let values: Vec<Option<f64>> = (0..months)
            .map(|i| {
                let trend = 1000.0 + 10.0 * i as f64;
                let season = 150.0 * (2.0 * PI * (i % 12) as f64 / 12.0).sin();
                Some(trend + season)
            })
            .collect();
        MonthlySeries::from_values(m(2020, 1), values).unwrap()
    }

    #[test]
    fn grid_order_is_deterministic() {
        let search = GridSearch::default();
        let a = search.candidates(48);
        let b = search.candidates(48);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x, y);
        }
        // 2 flexibilities x 2 fractions x 2 modes x 3 regularizations x 4
        // full-size orders.
        assert_eq!(a.len(), 96);
    }

    #[test]
    fn small_dataset_uses_reduced_orders() {
        let search = GridSearch::default();
        let small = search.candidates(20);
        assert_eq!(small.len(), 72); // 3 small orders instead of 4
        assert!(small.iter().all(|p| p.fourier_order <= 3));
    }

    #[test]
    fn selects_a_surviving_candidate() {
        let search = GridSearch::default();
        let selected = search.run(&seasonal_series(48)).unwrap();

        assert!(selected.score.is_finite());
        let ratio = selected.active_changepoints as f64 / selected.train_size as f64;
        assert!(ratio < 1.0 / 6.0);

        let forecast = selected.model.predict(12, None).unwrap();
        assert_eq!(forecast.horizon(), 12);
    }

    #[test]
    fn selection_is_reproducible() {
        let search = GridSearch::default();
        let series = seasonal_series(48);
        let first = search.run(&series).unwrap();
        let second = search.run(&series).unwrap();

        assert_eq!(first.grid_index, second.grid_index);
        assert_eq!(first.score.to_bits(), second.score.to_bits());
        let f1 = first.model.predict(12, None).unwrap();
        let f2 = second.model.predict(12, None).unwrap();
        assert_eq!(f1, f2);
    }

    #[test]
    fn changepoint_ratio_filter_is_strict() {
        // Survival requires ratio strictly below the threshold: a candidate
        // at exactly 1/6 must be excluded.
        let config = GridConfig::default();
        let at_threshold = SelectedModel {
            model: TrendSeasonModel::new(
                GridSearch::default().candidates(48)[0].clone(),
                config.active_changepoint_cutoff,
            ),
            score: 0.0,
            active_changepoints: 5,
            train_size: 30,
            grid_index: 0,
        };
        let ratio = at_threshold.active_changepoints as f64 / at_threshold.train_size as f64;
        assert!(ratio >= config.changepoint_filter_ratio);
        assert!(!(ratio < config.changepoint_filter_ratio));
    }

    #[test]
    fn too_short_series_has_no_candidate() {
        let values: Vec<Option<f64>> = (0..5).map(|i| Some(i as f64)).collect();
        let series = MonthlySeries::from_values(m(2023, 1), values).unwrap();
        assert_eq!(
            GridSearch::default().run(&series).unwrap_err(),
            ForecastError::NoSurvivingCandidate
        );
    }
}
