//! Revenue-proportional statistical fallback.
//!
//! Accounts that fail trend-seasonality eligibility (and are not sparse,
//! step-like or fixed) are forecast as `revenue_forecast(month) *
//! monthly_coefficient(month)`, where the coefficient is the historical
//! mean ratio of the account's value to total revenue for that calendar
//! month.

use crate::core::{add_months, MonthlyForecast, MonthlySeries};
use crate::error::{ForecastError, Result};
use crate::utils::ols::weighted_linear_fit;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Fallback options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Observation gaps longer than this many days truncate the
    /// coefficient-estimation window: pre-gap data is stale and its
    /// relationship to revenue may no longer hold.
    pub stale_gap_days: i64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            stale_gap_days: 365,
        }
    }
}

/// Fitted account/revenue ratio model.
#[derive(Debug, Clone)]
pub struct RevenueProportional {
    /// Mean ratio per calendar month (index 0 = January).
    coefficients: [Option<f64>; 12],
    /// Mean ratio across all overlapping months, used when a calendar
    /// month has no coefficient of its own.
    overall: f64,
    /// First month of the coefficient-estimation window.
    window_start: NaiveDate,
}

impl RevenueProportional {
    /// Estimate monthly coefficients from the account's history against
    /// total revenue.
    pub fn fit(
        account: &MonthlySeries,
        revenue: &MonthlySeries,
        config: &FallbackConfig,
    ) -> Result<Self> {
        let window_start = post_gap_window_start(account, config.stale_gap_days)?;

        let mut sums = [0.0f64; 12];
        let mut counts = [0usize; 12];
        let mut overall_sum = 0.0;
        let mut overall_count = 0usize;

        for (month, value) in account.iter() {
            if month < window_start {
                continue;
            }
            let (Some(account_value), Some(revenue_value)) = (value, revenue.value_at(month))
            else {
                continue;
            };
            if revenue_value.abs() < 1e-9 {
                continue;
            }
            let ratio = account_value / revenue_value;
            let idx = month.month0() as usize;
            sums[idx] += ratio;
            counts[idx] += 1;
            overall_sum += ratio;
            overall_count += 1;
        }

        if overall_count == 0 {
            return Err(ForecastError::InsufficientData { needed: 1, got: 0 });
        }

        let mut coefficients = [None; 12];
        for i in 0..12 {
            if counts[i] > 0 {
                coefficients[i] = Some(sums[i] / counts[i] as f64);
            }
        }

        Ok(Self {
            coefficients,
            overall: overall_sum / overall_count as f64,
            window_start,
        })
    }

    /// Coefficient for a calendar month (1 = January).
    pub fn coefficient(&self, month: u32) -> f64 {
        self.coefficients[(month - 1) as usize].unwrap_or(self.overall)
    }

    /// Start of the coefficient-estimation window.
    pub fn window_start(&self) -> NaiveDate {
        self.window_start
    }

    /// Apply the coefficients to a revenue forecast.
    pub fn forecast(&self, revenue_forecast: &MonthlyForecast) -> Result<MonthlyForecast> {
        let values: Vec<Option<f64>> = revenue_forecast
            .iter()
            .map(|(month, revenue)| revenue.map(|r| r * self.coefficient(month.month())))
            .collect();
        MonthlyForecast::from_optional(revenue_forecast.start_month(), values)
    }

    /// In-sample residuals (actual - coefficient * revenue) over the
    /// estimation window, for reconciliation weighting.
    pub fn residuals(
        &self,
        account: &MonthlySeries,
        revenue: &MonthlySeries,
    ) -> Vec<(NaiveDate, f64)> {
        account
            .iter()
            .filter(|(month, _)| *month >= self.window_start)
            .filter_map(|(month, value)| {
                let account_value = value?;
                let revenue_value = revenue.value_at(month)?;
                let fitted = revenue_value * self.coefficient(month.month());
                Some((month, account_value - fitted))
            })
            .collect()
    }
}

/// First month after the most recent observation gap longer than
/// `stale_gap_days`; the series start when no such gap exists.
fn post_gap_window_start(series: &MonthlySeries, stale_gap_days: i64) -> Result<NaiveDate> {
    let observed: Vec<NaiveDate> = series
        .iter()
        .filter_map(|(month, value)| value.map(|_| month))
        .collect();
    if observed.is_empty() {
        return Err(ForecastError::EmptyData);
    }

    let mut start = observed[0];
    for pair in observed.windows(2) {
        if (pair[1] - pair[0]).num_days() > stale_gap_days {
            start = pair[1];
        }
    }
    Ok(start)
}

/// Forecast total revenue by yearly trend extrapolation.
///
/// Used when no revenue forecast is available from the orchestrator:
/// partial-year-weighted yearly totals are fitted with an OLS linear trend
/// against the year number, month-of-year proportions are derived from
/// history (weighted by each year's completeness), and the trended yearly
/// total is multiplied by each forecast month's proportion.
pub fn extrapolate_revenue(
    revenue: &MonthlySeries,
    origin: NaiveDate,
    horizon: usize,
) -> Result<MonthlyForecast> {
    if horizon == 0 {
        return Err(ForecastError::InvalidParameter(
            "horizon must be positive".to_string(),
        ));
    }

    // Yearly totals and completeness.
    let mut years: Vec<i32> = Vec::new();
    let mut totals: Vec<f64> = Vec::new();
    let mut observed_months: Vec<usize> = Vec::new();
    let mut month_ratio_sums = [0.0f64; 12];
    let mut month_ratio_weights = [0.0f64; 12];

    for (month, value) in revenue.iter() {
        let Some(v) = value else { continue };
        match years.iter().position(|y| *y == month.year()) {
            Some(i) => {
                totals[i] += v;
                observed_months[i] += 1;
            }
            None => {
                years.push(month.year());
                totals.push(v);
                observed_months.push(1);
            }
        }
    }
    if years.is_empty() {
        return Err(ForecastError::EmptyData);
    }

    let completeness: Vec<f64> = observed_months
        .iter()
        .map(|n| *n as f64 / 12.0)
        .collect();
    let adjusted: Vec<f64> = totals
        .iter()
        .zip(&completeness)
        .map(|(t, c)| t / c.max(1e-9))
        .collect();

    // Month-of-year proportions, weighted by year completeness.
    for (month, value) in revenue.iter() {
        let Some(v) = value else { continue };
        let year_idx = years
            .iter()
            .position(|y| *y == month.year())
            .expect("year was recorded above");
        if totals[year_idx].abs() < 1e-9 {
            continue;
        }
        let weight = completeness[year_idx];
        let idx = month.month0() as usize;
        month_ratio_sums[idx] += weight * (v / totals[year_idx]);
        month_ratio_weights[idx] += weight;
    }

    let mut proportions = [0.0f64; 12];
    for i in 0..12 {
        if month_ratio_weights[i] > 0.0 {
            proportions[i] = month_ratio_sums[i] / month_ratio_weights[i];
        }
    }
    let proportion_sum: f64 = proportions.iter().sum();
    if proportion_sum > 0.0 {
        for p in proportions.iter_mut() {
            *p /= proportion_sum;
        }
    }

    // Linear trend of adjusted yearly totals on the year number, weighted
    // by completeness; a flat mean when the trend is not identifiable.
    let xs: Vec<f64> = years.iter().map(|y| *y as f64).collect();
    let fit = weighted_linear_fit(&xs, &adjusted, &completeness);

    let yearly_total = |year: i32| -> f64 {
        match &fit {
            Some(fit) => fit.predict(year as f64),
            None => {
                let weight_sum: f64 = completeness.iter().sum();
                adjusted
                    .iter()
                    .zip(&completeness)
                    .map(|(a, c)| a * c)
                    .sum::<f64>()
                    / weight_sum.max(1e-9)
            }
        }
    };

    let values: Vec<f64> = (0..horizon)
        .map(|step| {
            let target = add_months(origin, step as i32);
            yearly_total(target.year()) * proportions[target.month0() as usize]
        })
        .collect();

    MonthlyForecast::from_values(origin, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn m(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    fn constant_revenue(months: usize) -> MonthlySeries {
        MonthlySeries::from_values(m(2021, 1), vec![Some(1000.0); months]).unwrap()
    }

    #[test]
    fn reproduces_monthly_ratio_pattern() {
        // Account with a fixed per-month ratio against constant revenue:
        // the forecast must replay the historical monthly ratios.
        let account_values: Vec<Option<f64>> =
            (0..36).map(|i| Some(100.0 + 10.0 * (i % 12) as f64)).collect();
        let account = MonthlySeries::from_values(m(2021, 1), account_values).unwrap();
        let revenue = constant_revenue(36);

        let model =
            RevenueProportional::fit(&account, &revenue, &FallbackConfig::default()).unwrap();
        let revenue_forecast =
            MonthlyForecast::from_values(m(2024, 1), vec![1000.0; 12]).unwrap();
        let forecast = model.forecast(&revenue_forecast).unwrap();

        for (i, value) in forecast.values().iter().enumerate() {
            let expected = 100.0 + 10.0 * i as f64;
            assert_relative_eq!(value.unwrap(), expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn stale_pre_gap_history_is_discarded() {
        // Ratio 0.5 before a 2-year gap, 0.1 after: only the post-gap
        // relationship should survive.
        let mut values = vec![Some(500.0); 12];
        values.extend(vec![None; 24]);
        values.extend(vec![Some(100.0); 12]);
        let account = MonthlySeries::from_values(m(2020, 1), values).unwrap();
        let revenue = constant_revenue(48);

        let model =
            RevenueProportional::fit(&account, &revenue, &FallbackConfig::default()).unwrap();
        assert_eq!(model.window_start(), m(2023, 1));
        for month in 1..=12 {
            assert_relative_eq!(model.coefficient(month), 0.1, epsilon = 1e-12);
        }
    }

    #[test]
    fn missing_month_uses_overall_mean() {
        // Only January and February observed.
        let mut values = vec![None; 24];
        values[12] = Some(100.0); // Jan 2022
        values[13] = Some(300.0); // Feb 2022
        let account = MonthlySeries::from_values(m(2021, 1), values).unwrap();
        let revenue = constant_revenue(24);

        let model =
            RevenueProportional::fit(&account, &revenue, &FallbackConfig::default()).unwrap();
        assert_relative_eq!(model.coefficient(1), 0.1, epsilon = 1e-12);
        assert_relative_eq!(model.coefficient(2), 0.3, epsilon = 1e-12);
        // July never observed: overall mean ratio (0.2).
        assert_relative_eq!(model.coefficient(7), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn residuals_vanish_for_exact_ratio() {
        let account_values: Vec<Option<f64>> = (0..24).map(|_| Some(150.0)).collect();
        let account = MonthlySeries::from_values(m(2021, 1), account_values).unwrap();
        let revenue = constant_revenue(24);

        let model =
            RevenueProportional::fit(&account, &revenue, &FallbackConfig::default()).unwrap();
        let residuals = model.residuals(&account, &revenue);
        assert_eq!(residuals.len(), 24);
        for (_, r) in residuals {
            assert_relative_eq!(r, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn no_overlap_is_an_error() {
        let account =
            MonthlySeries::from_values(m(2021, 1), vec![Some(1.0); 12]).unwrap();
        let revenue =
            MonthlySeries::from_values(m(2023, 1), vec![Some(1000.0); 12]).unwrap();
        assert!(matches!(
            RevenueProportional::fit(&account, &revenue, &FallbackConfig::default()),
            Err(ForecastError::InsufficientData { .. })
        ));
    }

    #[test]
    fn revenue_trend_extrapolation() {
        // Yearly totals grow by 1200 each year; months are uniform.
        let values: Vec<Option<f64>> = (0..36)
            .map(|i| Some(1000.0 + 100.0 * (i / 12) as f64))
            .collect();
        let revenue = MonthlySeries::from_values(m(2021, 1), values).unwrap();

        let forecast = extrapolate_revenue(&revenue, m(2024, 1), 12).unwrap();
        // 2021: 12000, 2022: 13200, 2023: 14400 -> 2024: 15600, uniform
        // months -> 1300 per month.
        for value in forecast.values() {
            assert_relative_eq!(value.unwrap(), 1300.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn partial_final_year_is_upweighted_not_underestimated() {
        // 2 full flat years then 6 observed months of the third at the
        // same level: the trend must not dive because of the partial year.
        let mut values = vec![Some(1000.0); 30];
        values.extend(vec![None; 6]);
        let revenue = MonthlySeries::from_values(m(2021, 1), values).unwrap();

        let forecast = extrapolate_revenue(&revenue, m(2024, 1), 12).unwrap();
        let total: f64 = forecast.dense_values().iter().sum();
        assert_relative_eq!(total, 12000.0, epsilon = 1.0);
    }

    #[test]
    fn single_year_uses_flat_total() {
        let revenue =
            MonthlySeries::from_values(m(2023, 1), vec![Some(2000.0); 12]).unwrap();
        let forecast = extrapolate_revenue(&revenue, m(2024, 1), 12).unwrap();
        for value in forecast.values() {
            assert_relative_eq!(value.unwrap(), 2000.0, epsilon = 1e-6);
        }
    }
}
