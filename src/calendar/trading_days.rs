//! Trading-day normalization for revenue accounts.
//!
//! Months differ in length and weekday composition; revenue booked per
//! business day is comparable across months where raw monthly totals are
//! not. The model predicts a trading-day count per month from per-weekday
//! activity probabilities and the holiday calendar, so revenue can be
//! expressed per trading day before model fitting and re-multiplied
//! afterwards.

use crate::calendar::holidays::{estimate_holiday_impacts, holiday_on};
use crate::core::{MonthlyForecast, MonthlySeries};
use crate::error::{ForecastError, Result};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Options for the trading-day normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingDayConfig {
    /// Whether revenue accounts are normalized at all.
    pub enabled: bool,
    /// Bounded-ratio lower cutoff for write-off month detection.
    pub writeoff_low: f64,
    /// Bounded-ratio upper cutoff for write-off month detection.
    pub writeoff_high: f64,
}

impl Default for TradingDayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            writeoff_low: 0.25,
            writeoff_high: 0.75,
        }
    }
}

/// Daily activity amounts supplied by the input collaborator.
#[derive(Debug, Clone, Default)]
pub struct DailyActivity {
    days: BTreeMap<NaiveDate, f64>,
}

impl DailyActivity {
    pub fn new(days: BTreeMap<NaiveDate, f64>) -> Self {
        Self { days }
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// First and last recorded day.
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let first = self.days.keys().next()?;
        let last = self.days.keys().next_back()?;
        Some((*first, *last))
    }

    pub fn amount_on(&self, date: NaiveDate) -> Option<f64> {
        self.days.get(&date).copied()
    }

    /// Number of days with positive activity in a month.
    pub fn active_days_in_month(&self, month: NaiveDate) -> usize {
        let next = crate::core::add_months(month, 1);
        self.days
            .range(month..next)
            .filter(|(_, v)| **v > 0.0)
            .count()
    }
}

/// Per-weekday activity probabilities plus holiday impacts.
#[derive(Debug, Clone)]
pub struct TradingDayModel {
    /// Probability of activity per weekday (0 = Monday).
    weekday_probability: [f64; 7],
    /// Per-holiday probability that the company is affected.
    holiday_impacts: BTreeMap<&'static str, f64>,
}

impl TradingDayModel {
    /// Fit the business-day probability model from daily activity.
    ///
    /// Days in `excluded_months` (detected write-off months) are dropped
    /// from training; holiday dates are handled by the impact model and
    /// excluded from the weekday counts.
    pub fn fit(activity: &DailyActivity, excluded_months: &BTreeSet<NaiveDate>) -> Result<Self> {
        let Some((first, last)) = activity.date_range() else {
            return Err(ForecastError::EmptyData);
        };

        let mut active = [0usize; 7];
        let mut total = [0usize; 7];
        let mut date = first;
        while date <= last {
            let month = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap();
            if !excluded_months.contains(&month) && holiday_on(date).is_none() {
                let weekday = date.weekday().num_days_from_monday() as usize;
                total[weekday] += 1;
                if activity.amount_on(date).unwrap_or(0.0) > 0.0 {
                    active[weekday] += 1;
                }
            }
            date += Duration::days(1);
        }

        let mut weekday_probability = [0.0; 7];
        for i in 0..7 {
            if total[i] > 0 {
                weekday_probability[i] = active[i] as f64 / total[i] as f64;
            }
        }

        Ok(Self {
            weekday_probability,
            holiday_impacts: estimate_holiday_impacts(activity),
        })
    }

    /// Expected trading-day count for a calendar month.
    pub fn predict_count(&self, month: NaiveDate) -> f64 {
        let next = crate::core::add_months(month, 1);
        let mut count = 0.0;
        let mut date = month;
        while date < next {
            let weekday = date.weekday().num_days_from_monday() as usize;
            let mut p = self.weekday_probability[weekday];
            if let Some(holiday) = holiday_on(date) {
                let impact = self
                    .holiday_impacts
                    .get(holiday.name)
                    .copied()
                    .unwrap_or(1.0);
                p *= 1.0 - impact;
            }
            count += p;
            date += Duration::days(1);
        }
        count
    }
}

/// Observed trading-day counts per month.
pub fn monthly_trading_day_counts(activity: &DailyActivity) -> BTreeMap<NaiveDate, f64> {
    let Some((first, last)) = activity.date_range() else {
        return BTreeMap::new();
    };
    let mut counts = BTreeMap::new();
    let mut month = NaiveDate::from_ymd_opt(first.year(), first.month(), 1).unwrap();
    let end = NaiveDate::from_ymd_opt(last.year(), last.month(), 1).unwrap();
    while month <= end {
        counts.insert(month, activity.active_days_in_month(month) as f64);
        month = crate::core::add_months(month, 1);
    }
    counts
}

/// Detect months where revenue was recorded in bulk write-offs rather than
/// spread across business days.
///
/// The bounded ratio compares revenue-per-trading-day at month t against
/// t and t-1 combined; values outside [low, high] flag month t as an
/// outlier to exclude from the day-count model's training.
pub fn detect_writeoff_months(
    revenue: &MonthlySeries,
    counts: &BTreeMap<NaiveDate, f64>,
    config: &TradingDayConfig,
) -> BTreeSet<NaiveDate> {
    let mut flagged = BTreeSet::new();
    let mut prev: Option<(NaiveDate, f64)> = None;

    for (month, value) in revenue.iter() {
        let Some(value) = value else {
            prev = None;
            continue;
        };
        let count = counts.get(&month).copied().unwrap_or(0.0);
        if count <= 0.0 {
            prev = None;
            continue;
        }
        let per_day = value / count;

        if let Some((_, prev_per_day)) = prev {
            let denom = per_day + prev_per_day;
            if denom.abs() > 1e-9 {
                let ratio = per_day / denom;
                if ratio < config.writeoff_low || ratio > config.writeoff_high {
                    flagged.insert(month);
                }
            }
        }
        prev = Some((month, per_day));
    }
    flagged
}

/// Express a monthly revenue series per trading day.
///
/// Observed counts are preferred; months without daily data use the
/// model's predicted count.
pub fn normalize_by_trading_days(
    series: &MonthlySeries,
    counts: &BTreeMap<NaiveDate, f64>,
    model: &TradingDayModel,
) -> Result<MonthlySeries> {
    let values: Vec<Option<f64>> = series
        .iter()
        .map(|(month, value)| {
            value.and_then(|v| {
                let count = counts
                    .get(&month)
                    .copied()
                    .filter(|c| *c > 0.0)
                    .unwrap_or_else(|| model.predict_count(month));
                if count > 0.0 {
                    Some(v / count)
                } else {
                    None
                }
            })
        })
        .collect();
    MonthlySeries::from_values(series.start_month(), values)
}

/// Re-multiply a per-trading-day forecast by each month's predicted count.
pub fn denormalize_forecast(
    forecast: &MonthlyForecast,
    model: &TradingDayModel,
) -> Result<MonthlyForecast> {
    let values: Vec<Option<f64>> = forecast
        .iter()
        .map(|(month, value)| value.map(|v| v * model.predict_count(month)))
        .collect();
    MonthlyForecast::from_optional(forecast.start_month(), values)
}
