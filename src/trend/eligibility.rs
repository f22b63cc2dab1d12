//! Data-quality gate for trend-seasonality forecasting.

use crate::core::MonthlySeries;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Thresholds for the three eligibility conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityConfig {
    /// Minimum years of history required per calendar month.
    pub min_years_per_month: usize,
    /// Maximum missing values in the trailing 12 months.
    pub max_missing_trailing_year: usize,
    /// Length of the recent window, in years, for the third condition.
    pub recent_years: usize,
    /// Maximum missing values in the recent window.
    pub max_missing_recent: usize,
    /// COVID exclusion window start (inclusive).
    pub covid_start: NaiveDate,
    /// COVID exclusion window end (inclusive).
    pub covid_end: NaiveDate,
    /// Whether months inside the COVID window are excluded from the
    /// recent-window missing count.
    pub exclude_covid: bool,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            min_years_per_month: 2,
            max_missing_trailing_year: 1,
            recent_years: 3,
            max_missing_recent: 5,
            covid_start: NaiveDate::from_ymd_opt(2020, 2, 1).unwrap(),
            covid_end: NaiveDate::from_ymd_opt(2021, 5, 31).unwrap(),
            exclude_covid: true,
        }
    }
}

/// One failed eligibility condition, kept for diagnostics and for
/// hierarchy-node rejection bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// Some calendar months have fewer than the required years of history.
    InsufficientMonthlyHistory {
        /// Calendar months (1 = January) below the requirement.
        months: Vec<u32>,
        required_years: usize,
    },
    /// Too many missing values in the trailing 12 months.
    TrailingYearGaps { missing: usize, allowed: usize },
    /// Too many missing values over the recent window.
    RecentMissing { missing: usize, allowed: usize },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::InsufficientMonthlyHistory {
                months,
                required_years,
            } => write!(
                f,
                "calendar months {months:?} have fewer than {required_years} years of history"
            ),
            RejectionReason::TrailingYearGaps { missing, allowed } => write!(
                f,
                "{missing} missing values in the trailing year (allowed {allowed})"
            ),
            RejectionReason::RecentMissing { missing, allowed } => write!(
                f,
                "{missing} missing values in the recent window (allowed {allowed})"
            ),
        }
    }
}

/// Outcome of the eligibility check.
#[derive(Debug, Clone, Default)]
pub struct EligibilityVerdict {
    pub rejections: Vec<RejectionReason>,
}

impl EligibilityVerdict {
    pub fn is_eligible(&self) -> bool {
        self.rejections.is_empty()
    }
}

/// Evaluate the three-condition eligibility predicate over a series.
///
/// All three conditions must hold for the series to be eligible; every
/// failed condition is reported.
pub fn check_eligibility(series: &MonthlySeries, config: &EligibilityConfig) -> EligibilityVerdict {
    let mut rejections = Vec::new();

    // Condition 1: every calendar month must have enough years of history.
    let mut years_per_month = [0usize; 12];
    for (month, value) in series.iter() {
        if value.is_some() {
            years_per_month[month.month0() as usize] += 1;
        }
    }
    let failing: Vec<u32> = (0..12u32)
        .filter(|m| years_per_month[*m as usize] < config.min_years_per_month)
        .map(|m| m + 1)
        .collect();
    if !failing.is_empty() {
        rejections.push(RejectionReason::InsufficientMonthlyHistory {
            months: failing,
            required_years: config.min_years_per_month,
        });
    }

    // Condition 2: at most `max_missing_trailing_year` gaps in the trailing
    // 12 months, relative to the data's end date.
    let trailing = series.trailing(12);
    let missing_trailing = trailing.iter().filter(|v| v.is_none()).count();
    if missing_trailing > config.max_missing_trailing_year {
        rejections.push(RejectionReason::TrailingYearGaps {
            missing: missing_trailing,
            allowed: config.max_missing_trailing_year,
        });
    }

    // Condition 3: bounded missingness over the recent window, excluding
    // the COVID exclusion window.
    let window = config.recent_years * 12;
    let skip = series.len().saturating_sub(window);
    let mut missing_recent = 0usize;
    for (i, value) in series.values().iter().enumerate().skip(skip) {
        let month = series.month_at(i);
        if config.exclude_covid && month >= covid_month_floor(config.covid_start) && month <= config.covid_end
        {
            continue;
        }
        if value.is_none() {
            missing_recent += 1;
        }
    }
    if missing_recent > config.max_missing_recent {
        rejections.push(RejectionReason::RecentMissing {
            missing: missing_recent,
            allowed: config.max_missing_recent,
        });
    }

    EligibilityVerdict { rejections }
}

fn covid_month_floor(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}
