//! End-to-end pipeline tests against a small synthetic company.

use chrono::NaiveDate;
use ledger_forecast::core::{AccountType, ClassificationTable, MonthlySeries};
use ledger_forecast::engine::{EngineInput, ForecastEngine, ForecastMethod};
use ledger_forecast::hierarchy::WeightingMethod;
use ledger_forecast::EngineConfig;
use std::collections::BTreeMap;
use std::f64::consts::PI;

fn month(year: i32, m: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, m, 1).unwrap()
}

fn classification() -> ClassificationTable {
    ClassificationTable::from_entries([
        ("606", AccountType::FixedExpense),
        ("601", AccountType::VariableExpense),
        ("602", AccountType::VariableExpense),
        ("7", AccountType::Revenue),
    ])
}

/// Four years of monthly history with trend, seasonality and a small
/// deterministic wobble so sibling accounts are not exact multiples.
fn seasonal(level: f64, growth: f64, phase: f64) -> MonthlySeries {
    let salt = (phase * 10.0) as usize;
    let values: Vec<Option<f64>> = (0..48)
        .map(|i| {
            let trend = level + growth * i as f64;
            let season = 0.08 * level * (2.0 * PI * (i % 12) as f64 / 12.0 + phase).sin();
            let wobble = 0.005 * level * ((i * (salt + 3) % 7) as f64 - 3.0);
            Some(trend + season + wobble)
        })
        .collect();
    MonthlySeries::from_values(month(2020, 1), values).unwrap()
}

fn company() -> EngineInput {
    let mut accounts = BTreeMap::new();
    accounts.insert("601100".to_string(), seasonal(1200.0, 4.0, 0.0));
    accounts.insert("601200".to_string(), seasonal(800.0, -2.0, 0.5));
    accounts.insert("602100".to_string(), seasonal(1500.0, 6.0, 1.0));
    accounts.insert("701000".to_string(), seasonal(20000.0, 50.0, 0.2));
    accounts.insert("702000".to_string(), seasonal(5000.0, 10.0, 0.8));

    // A fixed expense.
    accounts.insert(
        "606000".to_string(),
        MonthlySeries::from_values(
            month(2020, 1),
            (0..48).map(|i| Some(900.0 + 50.0 * ((i * 5) % 3) as f64)).collect(),
        )
        .unwrap(),
    );

    // A sparse account: one observation per year.
    let mut sparse_values = vec![None; 48];
    for year in 0..4 {
        sparse_values[year * 12 + 10] = Some(4000.0);
    }
    accounts.insert(
        "602900".to_string(),
        MonthlySeries::from_values(month(2020, 1), sparse_values).unwrap(),
    );

    EngineInput {
        accounts,
        classification: classification(),
        daily_activity: None,
        revenue: None,
    }
}

fn slim_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.grid.trend_flexibilities = vec![0.05, 0.5];
    config.grid.changepoint_fractions = vec![0.8];
    config.grid.seasonality_regularizations = vec![1.0];
    config.grid.fourier_orders_full = vec![2, 3];
    config.grid.fourier_orders_small = vec![1];
    config
}

#[test]
fn complete_forecast_table_with_one_method_each() {
    let engine = ForecastEngine::new(slim_config());
    let report = engine.run(&company()).unwrap();

    // Every forecastable account has exactly one attributed method and a
    // full-horizon forecast starting right after the cutoff.
    assert_eq!(report.forecasts.len(), 7);
    for (account, forecast) in &report.forecasts {
        assert_eq!(forecast.horizon(), 12, "{account}");
        assert_eq!(forecast.start_month(), month(2024, 1), "{account}");
    }
    assert_eq!(report.metadata.len(), 7);

    assert_eq!(report.metadata["606000"].method, ForecastMethod::CarryForward);
    assert_eq!(report.metadata["602900"].method, ForecastMethod::Sparse);
    assert_eq!(
        report.metadata["601100"].method,
        ForecastMethod::Hierarchical
    );
    assert_eq!(report.metadata["601100"].account_type, AccountType::VariableExpense);
    assert_eq!(report.metadata["701000"].account_type, AccountType::Revenue);
}

#[test]
fn pipeline_is_idempotent() {
    let input = company();
    let engine = ForecastEngine::new(slim_config());

    let first = engine.run(&input).unwrap();
    let second = engine.run(&input).unwrap();

    assert_eq!(first.forecasts, second.forecasts);
    assert_eq!(first.node_forecasts, second.node_forecasts);
    assert_eq!(first.rejections, second.rejections);
    for (account, metadata) in &first.metadata {
        assert_eq!(metadata.method, second.metadata[account].method, "{account}");
    }
}

#[test]
fn hierarchy_sums_hold_for_all_weighting_methods() {
    for method in [
        WeightingMethod::Ols,
        WeightingMethod::Structural,
        WeightingMethod::Wlsv,
        WeightingMethod::Shrinkage,
        WeightingMethod::Sample,
    ] {
        let mut config = slim_config();
        config.weighting_method = method;
        let engine = ForecastEngine::new(config);
        let report = engine.run(&company()).unwrap();

        // 601 splits into 6011 and 6012.
        let parent = &report.node_forecasts["601"];
        let a = &report.node_forecasts["6011"];
        let b = &report.node_forecasts["6012"];
        for h in 0..12 {
            let gap = (parent[h] - a[h] - b[h]).abs();
            assert!(
                gap < 1e-6 * parent[h].abs().max(1.0),
                "{method:?} h={h} gap={gap}"
            );
        }

        // Account-level forecasts of a multi-leaf tree agree with the
        // leaf vectors.
        let account = &report.forecasts["601100"];
        for (h, value) in account.values().iter().enumerate() {
            assert!((value.unwrap() - a[h]).abs() < 1e-9);
        }
    }
}

#[test]
fn sparse_forecast_repeats_observed_month_and_suppresses_rest() {
    let engine = ForecastEngine::new(slim_config());
    let report = engine.run(&company()).unwrap();

    let forecast = &report.forecasts["602900"];
    // November was observed every year at 4000.
    assert_eq!(forecast.value_at(month(2024, 11)), Some(4000.0));
    // A month with no history of activity is suppressed, not forecast.
    assert_eq!(forecast.value_at(month(2024, 2)), None);
}

#[test]
fn dampening_off_extends_trends_further() {
    let mut damp_on = slim_config();
    damp_on.trend_dampening = true;
    let mut damp_off = slim_config();
    damp_off.trend_dampening = false;

    let on = ForecastEngine::new(damp_on).run(&company()).unwrap();
    let off = ForecastEngine::new(damp_off).run(&company()).unwrap();

    // 602100 grows at +6/month: the undampened forecast must end higher.
    let on_last = on.forecasts["602100"].values()[11].unwrap();
    let off_last = off.forecasts["602100"].values()[11].unwrap();
    assert!(
        off_last > on_last,
        "undampened {off_last} should exceed dampened {on_last}"
    );
}

#[test]
fn externally_supplied_revenue_drives_the_fallback() {
    // One expense account with too little history for the trend path, plus
    // an external revenue series and forecastable revenue.
    let mut accounts = BTreeMap::new();
    let account_values: Vec<Option<f64>> =
        (0..36).map(|i| Some(100.0 + 10.0 * (i % 12) as f64)).collect();
    accounts.insert(
        "601100".to_string(),
        MonthlySeries::from_values(month(2021, 1), account_values).unwrap(),
    );

    let input = EngineInput {
        accounts,
        classification: classification(),
        daily_activity: None,
        revenue: Some(
            MonthlySeries::from_values(month(2021, 1), vec![Some(1000.0); 36]).unwrap(),
        ),
    };

    let mut config = slim_config();
    config.pattern_forecasting = false;
    config.eligibility.min_years_per_month = 5; // force fallback

    let report = ForecastEngine::new(config).run(&input).unwrap();
    assert_eq!(report.metadata["601100"].method, ForecastMethod::Fallback);

    // Constant revenue of 1000 projects each calendar month's historical
    // ratio.
    let forecast = &report.forecasts["601100"];
    for (i, value) in forecast.values().iter().enumerate() {
        let expected = 100.0 + 10.0 * (i % 12) as f64;
        assert!((value.unwrap() - expected).abs() < 1e-6, "i={i}");
    }
}

#[test]
fn diagnostics_name_the_failed_conditions() {
    // An expense group with a gappy recent history lands on the fallback
    // and leaves an audit trail.
    let mut accounts = BTreeMap::new();
    accounts.insert("701000".to_string(), seasonal(20000.0, 50.0, 0.2));
    let mut gappy: Vec<Option<f64>> = (0..48).map(|i| Some(100.0 + i as f64)).collect();
    for i in (36..48).step_by(2) {
        gappy[i] = None;
    }
    accounts.insert(
        "601100".to_string(),
        MonthlySeries::from_values(month(2020, 1), gappy).unwrap(),
    );

    let input = EngineInput {
        accounts,
        classification: classification(),
        daily_activity: None,
        revenue: None,
    };
    let report = ForecastEngine::new(slim_config()).run(&input).unwrap();

    assert_eq!(report.metadata["601100"].method, ForecastMethod::Fallback);
    let reasons = &report.rejections["601"];
    assert!(!reasons.is_empty());
}
