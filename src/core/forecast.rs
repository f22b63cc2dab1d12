//! Forecast path over future calendar months.

use crate::core::series::{add_months, month_span};
use crate::error::{ForecastError, Result};
use chrono::{Datelike, NaiveDate};

/// A monthly forecast path.
///
/// Entries are `Option<f64>` because the sparse forecaster may suppress
/// months whose historical observation probability is too low; a suppressed
/// month is reported as absent rather than forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyForecast {
    start: NaiveDate,
    values: Vec<Option<f64>>,
}

impl MonthlyForecast {
    /// Create a forecast from plain point values.
    pub fn from_values(start: NaiveDate, values: Vec<f64>) -> Result<Self> {
        Self::from_optional(start, values.into_iter().map(Some).collect())
    }

    /// Create a forecast where some months may be suppressed.
    pub fn from_optional(start: NaiveDate, values: Vec<Option<f64>>) -> Result<Self> {
        if start.day() != 1 {
            return Err(ForecastError::MonthIndexError(format!(
                "forecast must start on the first of a month, got {start}"
            )));
        }
        if values.is_empty() {
            return Err(ForecastError::EmptyData);
        }
        Ok(Self { start, values })
    }

    /// First forecast month.
    pub fn start_month(&self) -> NaiveDate {
        self.start
    }

    /// Number of forecast months.
    pub fn horizon(&self) -> usize {
        self.values.len()
    }

    /// The forecast values.
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// Forecast value for a month (`None` when off-path or suppressed).
    pub fn value_at(&self, month: NaiveDate) -> Option<f64> {
        let span = month_span(self.start, month);
        if span < 0 || span as usize >= self.values.len() {
            None
        } else {
            self.values[span as usize]
        }
    }

    /// Iterate (month, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, Option<f64>)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (add_months(self.start, i as i32), *v))
    }

    /// Dense point values, treating suppressed months as zero contribution.
    pub fn dense_values(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.unwrap_or(0.0)).collect()
    }

    /// Replace the point values, keeping the month axis.
    pub fn with_values(&self, values: Vec<f64>) -> Result<Self> {
        if values.len() != self.values.len() {
            return Err(ForecastError::DimensionMismatch {
                expected: self.values.len(),
                got: values.len(),
            });
        }
        Self::from_values(self.start, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    #[test]
    fn month_lookup() {
        let f = MonthlyForecast::from_values(m(2025, 1), vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(f.horizon(), 3);
        assert_eq!(f.value_at(m(2025, 2)), Some(2.0));
        assert_eq!(f.value_at(m(2024, 12)), None);
        assert_eq!(f.value_at(m(2025, 4)), None);
    }

    #[test]
    fn suppressed_months_stay_absent() {
        let f = MonthlyForecast::from_optional(m(2025, 1), vec![Some(1.0), None, Some(3.0)])
            .unwrap();
        assert_eq!(f.value_at(m(2025, 2)), None);
        assert_eq!(f.dense_values(), vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn year_rollover() {
        let f = MonthlyForecast::from_values(m(2024, 11), vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(f.value_at(m(2025, 1)), Some(3.0));
        let months: Vec<NaiveDate> = f.iter().map(|(month, _)| month).collect();
        assert_eq!(months, vec![m(2024, 11), m(2024, 12), m(2025, 1)]);
    }
}
