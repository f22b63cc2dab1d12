//! French public holiday calendar and per-holiday impact estimation.

use crate::calendar::trading_days::DailyActivity;
use chrono::{Datelike, Duration, NaiveDate};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;

/// One public holiday occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holiday {
    pub date: NaiveDate,
    pub name: &'static str,
}

/// Easter Sunday for a given year (Anonymous Gregorian computus).
pub fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).expect("computus yields a valid date")
}

/// French public holidays for a year, fixed dates plus the Easter-derived
/// movable feasts.
pub fn french_holidays(year: i32) -> Vec<Holiday> {
    let fixed = [
        (1, 1, "new_year"),
        (5, 1, "labour_day"),
        (5, 8, "victory_1945"),
        (7, 14, "bastille_day"),
        (8, 15, "assumption"),
        (11, 1, "all_saints"),
        (11, 11, "armistice"),
        (12, 25, "christmas"),
    ];
    let easter = easter_sunday(year);

    let mut holidays: Vec<Holiday> = fixed
        .iter()
        .map(|(month, day, name)| Holiday {
            date: NaiveDate::from_ymd_opt(year, *month, *day).expect("valid fixed holiday"),
            name,
        })
        .collect();
    holidays.push(Holiday {
        date: easter + Duration::days(1),
        name: "easter_monday",
    });
    holidays.push(Holiday {
        date: easter + Duration::days(39),
        name: "ascension",
    });
    holidays.push(Holiday {
        date: easter + Duration::days(50),
        name: "whit_monday",
    });
    holidays.sort_by_key(|h| h.date);
    holidays
}

/// Holiday falling on a specific date, if any.
pub fn holiday_on(date: NaiveDate) -> Option<Holiday> {
    french_holidays(date.year())
        .into_iter()
        .find(|h| h.date == date)
}

/// Estimated probability, per holiday, that the company is actually
/// affected by it.
///
/// Not every business closes on every public holiday. For each holiday the
/// historical activity on its dates is compared against a same-weekday
/// baseline from the surrounding weeks; the standardized drop is mapped
/// through the normal CDF to a probability. Holidays never observed in the
/// history default to fully affecting (probability 1).
pub fn estimate_holiday_impacts(activity: &DailyActivity) -> BTreeMap<&'static str, f64> {
    let normal = Normal::new(0.0, 1.0).expect("standard normal");
    let mut drops: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();

    let Some((first, last)) = activity.date_range() else {
        return BTreeMap::new();
    };

    for year in first.year()..=last.year() {
        for holiday in french_holidays(year) {
            if holiday.date < first || holiday.date > last {
                continue;
            }
            let Some(baseline) = same_weekday_baseline(activity, holiday.date) else {
                continue;
            };
            if baseline <= 0.0 {
                continue;
            }
            let observed = activity.amount_on(holiday.date).unwrap_or(0.0);
            let drop = ((baseline - observed) / baseline).clamp(-1.0, 1.0);
            drops.entry(holiday.name).or_default().push(drop);
        }
    }

    drops
        .into_iter()
        .map(|(name, drops)| {
            let n = drops.len() as f64;
            let mean = crate::utils::stats::mean(&drops);
            let sd = crate::utils::stats::std_dev(&drops);
            let z = if sd.is_finite() && sd > 1e-9 {
                mean / (sd / n.sqrt())
            } else {
                // All observations agree: map the raw drop to a strong
                // signal either way.
                mean * 10.0
            };
            (name, normal.cdf(z))
        })
        .collect()
}

/// Mean activity on the same weekday over the four nearest weeks, skipping
/// holidays.
fn same_weekday_baseline(activity: &DailyActivity, date: NaiveDate) -> Option<f64> {
    let mut values = Vec::new();
    for offset in [-14i64, -7, 7, 14] {
        let neighbor = date + Duration::days(offset);
        if holiday_on(neighbor).is_some() {
            continue;
        }
        if let Some(v) = activity.amount_on(neighbor) {
            values.push(v);
        }
    }
    if values.is_empty() {
        None
    } else {
        Some(crate::utils::stats::mean(&values))
    }
}
