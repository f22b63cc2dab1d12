//! Additive trend/seasonality model with changepoints.
//!
//! The trend is piecewise linear: potential changepoints are placed over
//! the early fraction of history and their slope shifts are shrunk by a
//! ridge penalty controlled by the trend flexibility. Seasonality is a
//! Fourier expansion over the calendar month, fitted on the detrended
//! series (additive) or the trend ratio (multiplicative). Fitting is
//! penalized least squares through the symmetric solver; there is no
//! randomness anywhere, so identical inputs always produce identical fits.

use crate::core::{add_months, MonthlyForecast, MonthlySeries};
use crate::error::{ForecastError, Result};
use crate::trend::grid::FitBudget;
use crate::utils::linalg::solve_symmetric;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const SEASONAL_PERIOD: usize = 12;
const MAX_CHANGEPOINTS: usize = 25;

/// How the seasonal component combines with the trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeasonalityMode {
    /// fitted = trend + seasonal
    Additive,
    /// fitted = trend * (1 + seasonal)
    Multiplicative,
}

/// One hyperparameter combination for the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSeasonParams {
    /// Larger values allow more abrupt trend shifts (weaker ridge penalty
    /// on changepoint deltas).
    pub trend_flexibility: f64,
    /// Fraction of history over which potential changepoints are placed.
    pub changepoint_fraction: f64,
    /// Seasonal composition mode.
    pub seasonality_mode: SeasonalityMode,
    /// Larger values allow stronger seasonal coefficients (weaker ridge
    /// penalty).
    pub seasonality_regularization: f64,
    /// Number of Fourier harmonics.
    pub fourier_order: usize,
}

#[derive(Debug, Clone)]
struct FittedState {
    /// Normalization scale (max |y|).
    scale: f64,
    /// Trend coefficients on the normalized series: intercept, slope.
    intercept: f64,
    slope: f64,
    /// Potential changepoint positions (axis indices) and their deltas.
    changepoints: Vec<usize>,
    deltas: Vec<f64>,
    /// Fourier coefficients, interleaved cos/sin per harmonic.
    seasonal: Vec<f64>,
    /// Axis index of the last training month.
    train_end: usize,
    /// Calendar month (0-based) of axis index 0.
    start_month0: u32,
    /// Month of axis index 0, for constructing forecast paths.
    axis_start: NaiveDate,
    /// Training diagnostics.
    n_obs: usize,
    sse: f64,
    fitted: Vec<f64>,
    residuals: Vec<(NaiveDate, f64)>,
}

/// Trend/seasonality model for one account or hierarchy node.
#[derive(Debug, Clone)]
pub struct TrendSeasonModel {
    params: TrendSeasonParams,
    /// Deltas smaller than this (on the normalized scale) do not count as
    /// active changepoints.
    active_cutoff: f64,
    state: Option<FittedState>,
}

impl TrendSeasonModel {
    pub fn new(params: TrendSeasonParams, active_cutoff: f64) -> Self {
        Self {
            params,
            active_cutoff,
            state: None,
        }
    }

    pub fn params(&self) -> &TrendSeasonParams {
        &self.params
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Number of training observations.
    pub fn train_size(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.n_obs)
    }

    /// Changepoints whose estimated shift magnitude exceeds the
    /// negligible-effect cutoff.
    pub fn active_changepoint_count(&self) -> Option<usize> {
        self.state.as_ref().map(|s| {
            s.deltas
                .iter()
                .filter(|d| d.abs() > self.active_cutoff)
                .count()
        })
    }

    /// In-sample fitted values at observed points, original scale.
    pub fn fitted_values(&self) -> Option<&[f64]> {
        self.state.as_ref().map(|s| s.fitted.as_slice())
    }

    /// Residuals (actual - fitted) keyed by month.
    pub fn residuals(&self) -> Option<&[(NaiveDate, f64)]> {
        self.state.as_ref().map(|s| s.residuals.as_slice())
    }

    /// Corrected Akaike information criterion of the fit.
    pub fn aicc(&self) -> Option<f64> {
        let state = self.state.as_ref()?;
        let n = state.n_obs as f64;
        let k = (2
            + self.active_changepoint_count().unwrap_or(0)
            + 2 * self.params.fourier_order) as f64;
        if n - k - 1.0 <= 0.0 {
            return Some(f64::INFINITY);
        }
        let sse = state.sse.max(1e-12);
        Some(n * (sse / n).ln() + 2.0 * k + 2.0 * k * (k + 1.0) / (n - k - 1.0))
    }

    /// Root mean squared error of the fit.
    pub fn rmse(&self) -> Option<f64> {
        let state = self.state.as_ref()?;
        Some((state.sse / state.n_obs as f64).sqrt())
    }

    /// Fit the model to a series, respecting the cooperative time budget.
    pub fn fit(&mut self, series: &MonthlySeries, budget: &FitBudget) -> Result<()> {
        let observed = series.observed();
        let n = observed.len();
        let min_obs = 4 + 2 * self.params.fourier_order;
        if n < min_obs {
            return Err(ForecastError::InsufficientData {
                needed: min_obs,
                got: n,
            });
        }
        if budget.expired() {
            return Err(ForecastError::FitTimeout);
        }

        let t_first = observed[0].0;
        let t_last = observed[n - 1].0;
        let t_range = (t_last - t_first).max(1) as f64;

        let scale = observed
            .iter()
            .map(|(_, y)| y.abs())
            .fold(0.0f64, f64::max)
            .max(1e-9);
        let ys: Vec<f64> = observed.iter().map(|(_, y)| y / scale).collect();
        let ts_norm: Vec<f64> = observed
            .iter()
            .map(|(t, _)| (*t - t_first) as f64 / t_range)
            .collect();

        // Potential changepoints: evenly sampled observed positions over
        // the first `changepoint_fraction` of history, excluding the first
        // point.
        let limit = t_first as f64 + t_range * self.params.changepoint_fraction;
        let window: Vec<usize> = observed
            .iter()
            .skip(1)
            .map(|(t, _)| *t)
            .filter(|t| (*t as f64) <= limit)
            .collect();
        let n_cp = window.len().min(MAX_CHANGEPOINTS);
        let changepoints: Vec<usize> = if n_cp == 0 {
            Vec::new()
        } else {
            (0..n_cp)
                .map(|i| window[i * window.len() / n_cp])
                .collect()
        };
        let cp_norm: Vec<f64> = changepoints
            .iter()
            .map(|t| (*t - t_first) as f64 / t_range)
            .collect();

        // Trend: ridge-penalized least squares over
        // [1, t, max(0, t - s_j)...], penalty on the deltas only.
        let trend_lambda = 1.0 / self.params.trend_flexibility.max(1e-9);
        let n_trend = 2 + cp_norm.len();
        let mut xtx = vec![vec![0.0; n_trend]; n_trend];
        let mut xty = vec![0.0; n_trend];
        for (i, &t) in ts_norm.iter().enumerate() {
            if i % 32 == 0 && budget.expired() {
                return Err(ForecastError::FitTimeout);
            }
            let mut row = Vec::with_capacity(n_trend);
            row.push(1.0);
            row.push(t);
            for &s in &cp_norm {
                row.push((t - s).max(0.0));
            }
            for a in 0..n_trend {
                for b in 0..n_trend {
                    xtx[a][b] += row[a] * row[b];
                }
                xty[a] += row[a] * ys[i];
            }
        }
        for j in 2..n_trend {
            xtx[j][j] += trend_lambda;
        }
        let beta = solve_symmetric(&xtx, &xty).ok_or_else(|| {
            ForecastError::ComputationError("trend system is singular".to_string())
        })?;
        let (intercept, slope) = (beta[0], beta[1]);
        let deltas = beta[2..].to_vec();

        let trend_at = |t_norm: f64| -> f64 {
            let mut value = intercept + slope * t_norm;
            for (j, &s) in cp_norm.iter().enumerate() {
                value += deltas[j] * (t_norm - s).max(0.0);
            }
            value
        };

        // Seasonal component on the trend-adjusted series.
        if budget.expired() {
            return Err(ForecastError::FitTimeout);
        }
        let start_month0 = series.start_month().month0();
        let order = self.params.fourier_order;
        let n_seasonal = 2 * order;
        let seasonal_lambda = 1.0 / self.params.seasonality_regularization.max(1e-9);

        let mut stx = vec![vec![0.0; n_seasonal]; n_seasonal];
        let mut sty = vec![0.0; n_seasonal];
        for (i, (t, _)) in observed.iter().enumerate() {
            let trend_i = trend_at(ts_norm[i]);
            let target = match self.params.seasonality_mode {
                SeasonalityMode::Additive => ys[i] - trend_i,
                SeasonalityMode::Multiplicative => {
                    if trend_i.abs() < 1e-6 {
                        continue;
                    }
                    ys[i] / trend_i - 1.0
                }
            };
            let row = fourier_row(start_month0, *t, order);
            for a in 0..n_seasonal {
                for b in 0..n_seasonal {
                    stx[a][b] += row[a] * row[b];
                }
                sty[a] += row[a] * target;
            }
        }
        for j in 0..n_seasonal {
            stx[j][j] += seasonal_lambda;
        }
        let seasonal = if n_seasonal == 0 {
            Vec::new()
        } else {
            solve_symmetric(&stx, &sty).ok_or_else(|| {
                ForecastError::ComputationError("seasonal system is singular".to_string())
            })?
        };

        // In-sample fit and residuals on the original scale.
        let mut fitted = Vec::with_capacity(n);
        let mut residuals = Vec::with_capacity(n);
        let mut sse = 0.0;
        for (i, (t, y)) in observed.iter().enumerate() {
            let trend_i = trend_at(ts_norm[i]);
            let s = seasonal_value(&seasonal, start_month0, *t, order);
            let value = match self.params.seasonality_mode {
                SeasonalityMode::Additive => trend_i + s,
                SeasonalityMode::Multiplicative => trend_i * (1.0 + s),
            } * scale;
            let residual = y - value;
            sse += residual * residual;
            fitted.push(value);
            residuals.push((series.month_at(*t), residual));
        }

        self.state = Some(FittedState {
            scale,
            intercept,
            slope,
            changepoints,
            deltas,
            seasonal,
            train_end: t_last,
            start_month0,
            axis_start: series.start_month(),
            n_obs: n,
            sse,
            fitted,
            residuals,
        });
        Ok(())
    }

    /// Forecast `horizon` months past the end of the training axis.
    ///
    /// When `dampening_tau` is given, the zero-centered trend component is
    /// attenuated by `exp(-t/tau)` and flattened beyond `floor(tau)`.
    pub fn predict(&self, horizon: usize, dampening_tau: Option<f64>) -> Result<MonthlyForecast> {
        let state = self.state.as_ref().ok_or(ForecastError::FitRequired)?;
        if horizon == 0 {
            return Err(ForecastError::InvalidParameter(
                "horizon must be positive".to_string(),
            ));
        }

        let t_range = self.train_range(state);
        let t_first = state.train_end as f64 - t_range;

        let trend_at = |t: f64| -> f64 {
            let t_norm = (t - t_first) / t_range;
            let mut value = state.intercept + state.slope * t_norm;
            for (j, &s) in state.changepoints.iter().enumerate() {
                let s_norm = (s as f64 - t_first) / t_range;
                value += state.deltas[j] * (t_norm - s_norm).max(0.0);
            }
            value
        };

        let origin_trend = trend_at(state.train_end as f64);
        let raw_trend: Vec<f64> = (1..=horizon)
            .map(|h| trend_at((state.train_end + h) as f64))
            .collect();

        let trend_path: Vec<f64> = match dampening_tau {
            Some(tau) => {
                let centered: Vec<f64> = raw_trend.iter().map(|t| t - origin_trend).collect();
                dampen_trend(&centered, tau)
                    .iter()
                    .map(|d| origin_trend + d)
                    .collect()
            }
            None => raw_trend,
        };

        let order = self.params.fourier_order;
        let mut values = Vec::with_capacity(horizon);
        for (h, trend_h) in trend_path.iter().enumerate() {
            let t = state.train_end + h + 1;
            let s = seasonal_value(&state.seasonal, state.start_month0, t, order);
            let value = match self.params.seasonality_mode {
                SeasonalityMode::Additive => trend_h + s,
                SeasonalityMode::Multiplicative => trend_h * (1.0 + s),
            } * state.scale;
            values.push(value);
        }

        let start = add_months(state.axis_start, state.train_end as i32 + 1);
        MonthlyForecast::from_values(start, values)
    }

    fn train_range(&self, state: &FittedState) -> f64 {
        // Reconstruct the normalization range from the stored axis bounds:
        // the first observed position is train_end minus the span of the
        // residual months.
        let first = state
            .residuals
            .first()
            .map(|(m, _)| crate::core::month_span(state.axis_start, *m))
            .unwrap_or(0) as f64;
        (state.train_end as f64 - first).max(1.0)
    }
}

/// Attenuate a zero-centered trend path by exponential decay.
///
/// `trend[t]` becomes `trend[t] * exp(-t / tau)` for `t < floor(tau)` and
/// is held at the `floor(tau)` value for all later steps, bounding the
/// extrapolation while preserving short-horizon responsiveness.
pub fn dampen_trend(trend: &[f64], tau: f64) -> Vec<f64> {
    if trend.is_empty() {
        return Vec::new();
    }
    if tau <= 0.0 {
        return vec![0.0; trend.len()];
    }
    let cut = tau.floor() as usize;
    (0..trend.len())
        .map(|t| {
            let idx = t.min(cut).min(trend.len() - 1);
            trend[idx] * (-(idx as f64) / tau).exp()
        })
        .collect()
}

fn fourier_row(start_month0: u32, t: usize, order: usize) -> Vec<f64> {
    let month = (start_month0 as usize + t) % SEASONAL_PERIOD;
    let mut row = Vec::with_capacity(2 * order);
    for j in 1..=order {
        let angle = 2.0 * PI * j as f64 * month as f64 / SEASONAL_PERIOD as f64;
        row.push(angle.cos());
        row.push(angle.sin());
    }
    row
}

fn seasonal_value(coeffs: &[f64], start_month0: u32, t: usize, order: usize) -> f64 {
    if coeffs.is_empty() {
        return 0.0;
    }
    fourier_row(start_month0, t, order)
        .iter()
        .zip(coeffs)
        .map(|(x, c)| x * c)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn m(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    fn params(mode: SeasonalityMode, order: usize) -> TrendSeasonParams {
        TrendSeasonParams {
            trend_flexibility: 0.5,
            changepoint_fraction: 0.8,
            seasonality_mode: mode,
            seasonality_regularization: 10.0,
            fourier_order: order,
        }
    }

    fn seasonal_series(months: usize) -> MonthlySeries {
        let values: Vec<Option<f64>> = (0..months)
            .map(|i| {
                let trend = 100.0 + 2.0 * i as f64;
                let season = 20.0 * (2.0 * PI * (i % 12) as f64 / 12.0).sin();
                Some(trend + season)
            })
            .collect();
        MonthlySeries::from_values(m(2020, 1), values).unwrap()
    }

    #[test]
    fn fits_trend_plus_seasonality() {
        let series = seasonal_series(48);
        let mut model = TrendSeasonModel::new(params(SeasonalityMode::Additive, 3), 0.01);
        model.fit(&series, &FitBudget::unlimited()).unwrap();

        assert!(model.is_fitted());
        assert_eq!(model.train_size(), Some(48));

        // The generating process is linear + one harmonic: the fit should
        // be tight.
        let rmse = model.rmse().unwrap();
        assert!(rmse < 5.0, "rmse = {rmse}");
    }

    #[test]
    fn forecast_continues_trend_and_season() {
        let series = seasonal_series(48);
        let mut model = TrendSeasonModel::new(params(SeasonalityMode::Additive, 3), 0.01);
        model.fit(&series, &FitBudget::unlimited()).unwrap();

        let forecast = model.predict(12, None).unwrap();
        assert_eq!(forecast.horizon(), 12);
        assert_eq!(forecast.start_month(), m(2024, 1));

        // Continuation of the generating process.
        for (h, value) in forecast.values().iter().enumerate() {
            let i = 48 + h;
            let expected =
                100.0 + 2.0 * i as f64 + 20.0 * (2.0 * PI * (i % 12) as f64 / 12.0).sin();
            let got = value.unwrap();
            assert!(
                (got - expected).abs() < 15.0,
                "h={h} got={got} expected={expected}"
            );
        }
    }

    #[test]
    fn dampened_forecast_is_flatter() {
        let series = seasonal_series(48);
        let mut model = TrendSeasonModel::new(params(SeasonalityMode::Additive, 2), 0.01);
        model.fit(&series, &FitBudget::unlimited()).unwrap();

        let raw = model.predict(12, None).unwrap();
        let damp = model.predict(12, Some(6.0)).unwrap();

        // The trend rises, so the dampened path must stay below the raw
        // one at the end of the horizon.
        assert!(damp.values()[11].unwrap() < raw.values()[11].unwrap());
    }

    #[test]
    fn aicc_penalizes_extra_harmonics_on_plain_trend() {
        // A pure linear series: more harmonics should not pay off.
        let values: Vec<Option<f64>> = (0..48).map(|i| Some(50.0 + 3.0 * i as f64)).collect();
        let series = MonthlySeries::from_values(m(2020, 1), values).unwrap();

        let mut lean = TrendSeasonModel::new(params(SeasonalityMode::Additive, 1), 0.01);
        lean.fit(&series, &FitBudget::unlimited()).unwrap();
        let mut rich = TrendSeasonModel::new(params(SeasonalityMode::Additive, 6), 0.01);
        rich.fit(&series, &FitBudget::unlimited()).unwrap();

        assert!(lean.aicc().unwrap() < rich.aicc().unwrap());
    }

    #[test]
    fn multiplicative_mode_scales_with_trend() {
        // Seasonal amplitude proportional to the level.
        let values: Vec<Option<f64>> = (0..48)
            .map(|i| {
                let trend = 100.0 + 5.0 * i as f64;
                let ratio = 0.1 * (2.0 * PI * (i % 12) as f64 / 12.0).cos();
                Some(trend * (1.0 + ratio))
            })
            .collect();
        let series = MonthlySeries::from_values(m(2020, 1), values).unwrap();

        let mut model = TrendSeasonModel::new(params(SeasonalityMode::Multiplicative, 2), 0.01);
        model.fit(&series, &FitBudget::unlimited()).unwrap();
        let rmse = model.rmse().unwrap();
        assert!(rmse < 10.0, "rmse = {rmse}");
    }

    #[test]
    fn expired_budget_aborts_fit() {
        let series = seasonal_series(48);
        let mut model = TrendSeasonModel::new(params(SeasonalityMode::Additive, 3), 0.01);
        let budget = FitBudget::with_timeout(std::time::Duration::ZERO);
        assert_eq!(
            model.fit(&series, &budget),
            Err(ForecastError::FitTimeout)
        );
    }

    #[test]
    fn predict_requires_fit() {
        let model = TrendSeasonModel::new(params(SeasonalityMode::Additive, 2), 0.01);
        assert!(matches!(
            model.predict(12, None),
            Err(ForecastError::FitRequired)
        ));
    }

    #[test]
    fn dampen_trend_boundary() {
        let trend: Vec<f64> = (0..12).map(|t| t as f64 * 10.0).collect();
        let tau = 6.0;
        let dampened = dampen_trend(&trend, tau);

        for t in 0..6 {
            assert_relative_eq!(
                dampened[t],
                trend[t] * (-(t as f64) / tau).exp(),
                epsilon = 1e-12
            );
        }
        let held = trend[6] * (-1.0f64).exp();
        for t in 6..12 {
            assert_relative_eq!(dampened[t], held, epsilon = 1e-12);
        }
    }

    #[test]
    fn dampen_trend_short_horizon() {
        // Horizon entirely inside the decay window: pure exponential decay.
        let trend = vec![5.0, 10.0, 15.0];
        let dampened = dampen_trend(&trend, 6.0);
        for t in 0..3 {
            assert_relative_eq!(
                dampened[t],
                trend[t] * (-(t as f64) / 6.0).exp(),
                epsilon = 1e-12
            );
        }
    }
}
