//! Sparse-account detection and forecasting.

use crate::core::{add_months, MonthlyForecast, MonthlySeries};
use crate::error::{ForecastError, Result};
use chrono::{Datelike, NaiveDate};

/// Detect whether an account is sparse.
///
/// Counting backward from the last observed month in 12-month windows,
/// every window must contain strictly fewer than `min_per_year`
/// observations. Anchoring the year-windows to the series' own end date
/// avoids biasing the count against a partially observed final calendar
/// year.
pub fn detect_sparse(series: &MonthlySeries, min_per_year: usize) -> bool {
    let Some((last_month, _)) = series.last_observed() else {
        // Nothing observed at all: trivially sparse.
        return true;
    };
    let end_idx = series
        .index_of(last_month)
        .expect("observed month lies on the axis");

    let values = series.values();
    let mut hi = end_idx as i64;
    while hi >= 0 {
        let lo = (hi - 11).max(0);
        let count = values[lo as usize..=hi as usize]
            .iter()
            .filter(|v| v.is_some())
            .count();
        if count >= min_per_year {
            return false;
        }
        hi -= 12;
    }
    true
}

/// Empirical probability that each calendar month has any recorded
/// observation across the series' history.
///
/// Index 0 is January. A month that never appears on the axis gets
/// probability zero.
fn month_observation_probabilities(series: &MonthlySeries) -> [f64; 12] {
    let mut present = [0usize; 12];
    let mut observed = [0usize; 12];
    for (month, value) in series.iter() {
        let idx = month.month0() as usize;
        present[idx] += 1;
        if value.is_some() {
            observed[idx] += 1;
        }
    }

    let mut probabilities = [0.0; 12];
    for i in 0..12 {
        if present[i] > 0 {
            probabilities[i] = observed[i] as f64 / present[i] as f64;
        }
    }
    probabilities
}

/// Forecast a sparse account.
///
/// For each target month, the most recent historical observation on that
/// calendar month is carried forward; when that calendar month was never
/// observed, the most recent observation overall is used. Months whose
/// historical observation probability falls below `probability_cutoff` are
/// suppressed: forecasting a month that historically never has activity is
/// more misleading than omitting it.
pub fn sparse_forecast(
    series: &MonthlySeries,
    origin: NaiveDate,
    horizon: usize,
    probability_cutoff: f64,
) -> Result<MonthlyForecast> {
    let Some((_, last_value)) = series.last_observed() else {
        return Err(ForecastError::EmptyData);
    };
    if horizon == 0 {
        return Err(ForecastError::InvalidParameter(
            "horizon must be positive".to_string(),
        ));
    }

    let probabilities = month_observation_probabilities(series);

    let mut values = Vec::with_capacity(horizon);
    for step in 0..horizon {
        let target = add_months(origin, step as i32);

        if probabilities[target.month0() as usize] < probability_cutoff {
            values.push(None);
            continue;
        }

        // Most recent observation on the same calendar month.
        let same_month = series
            .iter()
            .filter(|(month, value)| {
                value.is_some() && month.month() == target.month() && *month < target
            })
            .next_back()
            .and_then(|(_, v)| v);

        values.push(Some(same_month.unwrap_or(last_value)));
    }

    MonthlyForecast::from_optional(origin, values)
}
