//! Monthly account series with explicit missing values.

use crate::error::{ForecastError, Result};
use chrono::{Datelike, Months, NaiveDate};

/// Shift a month-start date by a signed number of months.
pub fn add_months(month: NaiveDate, delta: i32) -> NaiveDate {
    if delta >= 0 {
        month + Months::new(delta as u32)
    } else {
        month - Months::new((-delta) as u32)
    }
}

/// Number of whole months from `from` to `to` (negative when `to` precedes
/// `from`). Both dates are expected to be month starts.
pub fn month_span(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + (to.month() as i32 - from.month() as i32)
}

/// A monthly time series for one account (or one aggregation of accounts).
///
/// The axis is contiguous: one entry per calendar month from `start`
/// onward. A `None` value means the month had no recorded activity — the
/// caller's contract is that a zero observed total is represented as
/// absent, never as `Some(0.0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlySeries {
    start: NaiveDate,
    values: Vec<Option<f64>>,
}

impl MonthlySeries {
    /// Create a series from a contiguous value axis starting at `start`.
    pub fn from_values(start: NaiveDate, values: Vec<Option<f64>>) -> Result<Self> {
        if start.day() != 1 {
            return Err(ForecastError::MonthIndexError(format!(
                "series must start on the first of a month, got {start}"
            )));
        }
        if values.is_empty() {
            return Err(ForecastError::EmptyData);
        }
        Ok(Self { start, values })
    }

    /// Create a series from (month, value) pairs.
    ///
    /// Months must be strictly increasing month starts; gaps are densified
    /// with `None`.
    pub fn from_pairs(pairs: &[(NaiveDate, Option<f64>)]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(ForecastError::EmptyData);
        }
        for (month, _) in pairs {
            if month.day() != 1 {
                return Err(ForecastError::MonthIndexError(format!(
                    "month keys must be month starts, got {month}"
                )));
            }
        }
        for w in pairs.windows(2) {
            if w[1].0 <= w[0].0 {
                return Err(ForecastError::MonthIndexError(
                    "months must be strictly increasing with no duplicates".to_string(),
                ));
            }
        }

        let start = pairs[0].0;
        let len = month_span(start, pairs[pairs.len() - 1].0) as usize + 1;
        let mut values = vec![None; len];
        for (month, value) in pairs {
            values[month_span(start, *month) as usize] = *value;
        }
        Ok(Self { start, values })
    }

    /// First month on the axis.
    pub fn start_month(&self) -> NaiveDate {
        self.start
    }

    /// Last month on the axis.
    pub fn end_month(&self) -> NaiveDate {
        add_months(self.start, self.values.len() as i32 - 1)
    }

    /// Number of months on the axis.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the axis is empty (never true for a validated series).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The full value axis.
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// Month at a given axis position.
    pub fn month_at(&self, index: usize) -> NaiveDate {
        add_months(self.start, index as i32)
    }

    /// Axis position of a month, if it lies on the axis.
    pub fn index_of(&self, month: NaiveDate) -> Option<usize> {
        let span = month_span(self.start, month);
        if span < 0 || span as usize >= self.values.len() {
            None
        } else {
            Some(span as usize)
        }
    }

    /// Value recorded for a month (`None` when off-axis or missing).
    pub fn value_at(&self, month: NaiveDate) -> Option<f64> {
        self.index_of(month).and_then(|i| self.values[i])
    }

    /// Iterate (month, value) over the axis.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (NaiveDate, Option<f64>)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (self.month_at(i), *v))
    }

    /// Observed (non-missing) points as (axis index, value).
    pub fn observed(&self) -> Vec<(usize, f64)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|x| (i, x)))
            .collect()
    }

    /// Number of non-missing observations.
    pub fn observed_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Most recent observation as (month, value).
    pub fn last_observed(&self) -> Option<(NaiveDate, f64)> {
        self.values
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, v)| v.map(|x| (self.month_at(i), x)))
    }

    /// The trailing `n` axis values (the whole axis when shorter).
    pub fn trailing(&self, n: usize) -> &[Option<f64>] {
        let skip = self.values.len().saturating_sub(n);
        &self.values[skip..]
    }

    /// Whether any observation exists in the trailing `window` months.
    pub fn is_active(&self, window: usize) -> bool {
        self.trailing(window).iter().any(|v| v.is_some())
    }

    /// Blank all values inside [start, end] (inclusive), e.g. to exclude
    /// the COVID window from model training.
    pub fn blank_window(&mut self, start: NaiveDate, end: NaiveDate) {
        for i in 0..self.values.len() {
            let month = add_months(self.start, i as i32);
            if month >= start && month <= end {
                self.values[i] = None;
            }
        }
    }

    /// Extend the axis so it spans at least [start, end], padding with
    /// `None`.
    pub fn extend_to(&mut self, start: NaiveDate, end: NaiveDate) {
        if start < self.start {
            let pad = month_span(start, self.start) as usize;
            let mut padded = vec![None; pad];
            padded.append(&mut self.values);
            self.values = padded;
            self.start = start;
        }
        let span = month_span(self.start, end);
        if span >= 0 && span as usize >= self.values.len() {
            self.values.resize(span as usize + 1, None);
        }
    }

    /// Elementwise sum of several series over the union of their axes.
    ///
    /// A month sums to `Some` when at least one constituent has a value
    /// there; months missing everywhere stay missing, so a zero-activity
    /// month is never fabricated.
    pub fn sum_of<'a, I>(series: I) -> Result<MonthlySeries>
    where
        I: IntoIterator<Item = &'a MonthlySeries>,
    {
        let series: Vec<&MonthlySeries> = series.into_iter().collect();
        if series.is_empty() {
            return Err(ForecastError::EmptyData);
        }

        let start = series.iter().map(|s| s.start).min().unwrap();
        let end = series.iter().map(|s| s.end_month()).max().unwrap();
        let len = month_span(start, end) as usize + 1;

        let mut values: Vec<Option<f64>> = vec![None; len];
        for s in &series {
            for (month, value) in s.iter() {
                if let Some(v) = value {
                    let idx = month_span(start, month) as usize;
                    values[idx] = Some(values[idx].unwrap_or(0.0) + v);
                }
            }
        }

        MonthlySeries::from_values(start, values)
    }
}
