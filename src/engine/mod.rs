//! The forecasting decision engine.
//!
//! Routing order per account: activity check, pattern classifier (sparse,
//! then step), fixed-expense carry-forward, trend-seasonality eligibility
//! with hierarchical reconciliation, statistical fallback. Every
//! forecastable account ends with exactly one attributed method; per-account
//! failures downgrade to the next method instead of aborting the batch.
//! The only fatal condition is a structural hierarchy inconsistency.

use crate::calendar::{
    denormalize_forecast, detect_writeoff_months, monthly_trading_day_counts,
    normalize_by_trading_days, DailyActivity, TradingDayModel,
};
use crate::config::EngineConfig;
use crate::core::{
    add_months, AccountType, ClassificationTable, MonthlyForecast, MonthlySeries,
};
use crate::error::{ForecastError, Result};
use crate::fallback::{extrapolate_revenue, RevenueProportional};
use crate::hierarchy::{reconcile, HierarchyTree, TreeOutcome};
use crate::pattern::{
    PatternClassifier, PatternKind, StepClassifier, ThresholdStepClassifier,
};
use crate::trend::{check_eligibility, GridSearch, RejectionReason, SelectedModel};
use crate::utils::metrics::{calculate_metrics, AccuracyMetrics};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// In-memory inputs supplied by the input collaborator.
#[derive(Debug, Clone, Default)]
pub struct EngineInput {
    /// Per-account monthly series, zero-as-missing already applied.
    pub accounts: BTreeMap<String, MonthlySeries>,
    /// Static prefix classification table.
    pub classification: ClassificationTable,
    /// Optional daily activity for the trading-day normalizer.
    pub daily_activity: Option<DailyActivity>,
    /// Optional externally supplied total revenue series.
    pub revenue: Option<MonthlySeries>,
}

/// Which method produced an account's forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMethod {
    Sparse,
    Step,
    CarryForward,
    TrendSeason,
    Hierarchical,
    Fallback,
}

impl fmt::Display for ForecastMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForecastMethod::Sparse => "sparse",
            ForecastMethod::Step => "step",
            ForecastMethod::CarryForward => "carry_forward",
            ForecastMethod::TrendSeason => "trend_season",
            ForecastMethod::Hierarchical => "hierarchical",
            ForecastMethod::Fallback => "fallback",
        };
        write!(f, "{name}")
    }
}

/// Quality metrics of a selected trend-seasonality model.
#[derive(Debug, Clone)]
pub struct ModelQuality {
    /// AICc or RMSE, per configuration.
    pub score: f64,
    pub active_changepoints: usize,
    pub train_size: usize,
    pub accuracy: AccuracyMetrics,
}

/// Per-account forecast attribution.
#[derive(Debug, Clone)]
pub struct ForecastMetadata {
    pub method: ForecastMethod,
    pub account_type: AccountType,
    pub model_quality: Option<ModelQuality>,
}

/// Complete output of one forecasting run.
#[derive(Debug, Clone, Default)]
pub struct ForecastReport {
    /// Forecast per account, one horizon-length path each.
    pub forecasts: BTreeMap<String, MonthlyForecast>,
    /// Reconciled forecasts per hierarchy-node prefix.
    pub node_forecasts: BTreeMap<String, Vec<f64>>,
    /// Method attribution and quality metrics per account.
    pub metadata: BTreeMap<String, ForecastMetadata>,
    /// Eligibility rejection reasons per account or node prefix.
    pub rejections: BTreeMap<String, Vec<RejectionReason>>,
}

/// The account forecasting decision engine.
pub struct ForecastEngine {
    config: EngineConfig,
    step_classifier: Arc<dyn StepClassifier>,
}

impl ForecastEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            step_classifier: Arc::new(ThresholdStepClassifier::default()),
        }
    }

    /// Replace the injected step classifier.
    pub fn with_step_classifier(mut self, classifier: Arc<dyn StepClassifier>) -> Self {
        self.step_classifier = classifier;
        self
    }

    /// Run the full pipeline.
    pub fn run(&self, input: &EngineInput) -> Result<ForecastReport> {
        if input.accounts.is_empty() {
            return Err(ForecastError::EmptyData);
        }
        let horizon = self.config.horizon;
        if horizon == 0 {
            return Err(ForecastError::InvalidParameter(
                "horizon must be positive".to_string(),
            ));
        }

        let data_end = input
            .accounts
            .values()
            .map(|s| s.end_month())
            .max()
            .expect("accounts is non-empty");
        let origin = add_months(data_end, 1);

        // Align every axis to the common cutoff, then keep only accounts
        // with recent activity.
        let active: BTreeMap<String, MonthlySeries> = input
            .accounts
            .iter()
            .filter_map(|(account, series)| {
                let mut padded = series.clone();
                padded.extend_to(padded.start_month(), data_end);
                if padded.is_active(self.config.active_account_window) {
                    Some((account.clone(), padded))
                } else {
                    debug!(account = account.as_str(), "inactive account skipped");
                    None
                }
            })
            .collect();
        info!(
            total = input.accounts.len(),
            active = active.len(),
            %origin,
            "forecast run started"
        );

        let account_type = |account: &str| -> AccountType {
            input.classification.classify(account).unwrap_or_else(|| {
                warn!(account, "account matches no classification prefix");
                AccountType::UntypedForecastable
            })
        };

        let mut report = ForecastReport::default();

        // Revenue reference: externally supplied, or the sum of active
        // revenue accounts.
        let revenue_history = input.revenue.clone().or_else(|| {
            let revenue_series: Vec<&MonthlySeries> = active
                .iter()
                .filter(|(account, _)| account_type(account) == AccountType::Revenue)
                .map(|(_, series)| series)
                .collect();
            if revenue_series.is_empty() {
                None
            } else {
                MonthlySeries::sum_of(revenue_series).ok()
            }
        });

        // Trading-day normalizer, when enabled and daily data exists.
        let trading = self.fit_trading_day_model(input, revenue_history.as_ref());

        // Phase 1: pattern classification and fixed-expense carry-forward,
        // embarrassingly parallel across accounts.
        let classifier = PatternClassifier::new(self.config.pattern.clone());
        let routed: Vec<(String, RouteOutcome)> = active
            .par_iter()
            .map(|(account, series)| {
                let outcome = self.route_account(
                    account,
                    series,
                    account_type(account),
                    origin,
                    horizon,
                    &classifier,
                );
                (account.clone(), outcome)
            })
            .collect();

        let mut model_accounts: BTreeMap<String, MonthlySeries> = BTreeMap::new();
        for (account, outcome) in routed {
            match outcome {
                RouteOutcome::Final(forecast, metadata) => {
                    report.forecasts.insert(account.clone(), forecast);
                    report.metadata.insert(account, metadata);
                }
                RouteOutcome::NeedsModel => {
                    let series = active[&account].clone();
                    model_accounts.insert(account, series);
                }
            }
        }

        // Revenue accounts may be normalized to per-trading-day space
        // before fitting.
        let mut normalized_accounts: BTreeSet<String> = BTreeSet::new();
        if let Some((model, counts)) = &trading {
            for (account, series) in model_accounts.iter_mut() {
                if account_type(account) != AccountType::Revenue {
                    continue;
                }
                match normalize_by_trading_days(series, counts, model) {
                    Ok(normalized) => {
                        *series = normalized;
                        normalized_accounts.insert(account.clone());
                    }
                    Err(err) => {
                        warn!(account = account.as_str(), %err, "normalization failed")
                    }
                }
            }
        }

        // Internal revenue forecast for the statistical fallback.
        let revenue_forecast = match revenue_history.as_ref() {
            Some(history) => match self.forecast_revenue(history, origin, horizon) {
                Ok(forecast) => Some(forecast),
                Err(err) => {
                    warn!(%err, "revenue forecast unavailable");
                    None
                }
            },
            None => None,
        };

        // Phase 2: hierarchy construction, base fitting, reconciliation.
        // Trees are independent; each reconciles once all its node fits
        // are done.
        let groups = self.group_accounts(&model_accounts);
        let tree_results: Vec<Result<TreeResult>> = groups
            .par_iter()
            .map(|(prefix, members)| {
                self.forecast_group(
                    prefix,
                    members,
                    horizon,
                    revenue_history.as_ref(),
                    revenue_forecast.as_ref(),
                )
            })
            .collect();

        let mut fallback_accounts: Vec<String> = Vec::new();
        for result in tree_results {
            let tree_result = result?;
            for (prefix, reasons) in tree_result.rejections {
                report.rejections.insert(prefix, reasons);
            }
            fallback_accounts.extend(tree_result.fallback_accounts);
            for (prefix, values) in tree_result.node_forecasts {
                report.node_forecasts.insert(prefix, values);
            }
            for (account, forecast, mut metadata) in tree_result.account_forecasts {
                metadata.account_type = account_type(&account);
                report.forecasts.insert(account.clone(), forecast);
                report.metadata.insert(account, metadata);
            }
        }

        // Phase 3: statistical fallback for everything left over.
        let fallback_results: Vec<(String, MonthlyForecast)> = fallback_accounts
            .par_iter()
            .map(|account| {
                let series = &model_accounts[account];
                let forecast = self.fallback_forecast(
                    account,
                    series,
                    origin,
                    horizon,
                    revenue_history.as_ref(),
                    revenue_forecast.as_ref(),
                );
                (account.clone(), forecast)
            })
            .collect();
        for (account, forecast) in fallback_results {
            let metadata = ForecastMetadata {
                method: ForecastMethod::Fallback,
                account_type: account_type(&account),
                model_quality: None,
            };
            report.forecasts.insert(account.clone(), forecast);
            report.metadata.insert(account, metadata);
        }

        // Gather: denormalize revenue forecasts back to monthly space.
        if let Some((model, _)) = &trading {
            for account in &normalized_accounts {
                if let Some(forecast) = report.forecasts.get(account).cloned() {
                    match denormalize_forecast(&forecast, model) {
                        Ok(expanded) => {
                            report.forecasts.insert(account.clone(), expanded);
                        }
                        Err(err) => {
                            warn!(account = account.as_str(), %err, "denormalization failed")
                        }
                    }
                }
            }
        }

        info!(
            forecasts = report.forecasts.len(),
            trees = report.node_forecasts.len(),
            "forecast run finished"
        );
        Ok(report)
    }

    fn route_account(
        &self,
        account: &str,
        series: &MonthlySeries,
        account_type: AccountType,
        origin: NaiveDate,
        horizon: usize,
        classifier: &PatternClassifier,
    ) -> RouteOutcome {
        if self.config.pattern_forecasting {
            match classifier.claim(series, origin, horizon, self.step_classifier.as_ref()) {
                Ok(Some(claimed)) => {
                    let method = match claimed.kind {
                        PatternKind::Sparse => ForecastMethod::Sparse,
                        PatternKind::Step => ForecastMethod::Step,
                    };
                    debug!(account, %method, "pattern classifier claimed account");
                    return RouteOutcome::Final(
                        claimed.forecast,
                        ForecastMetadata {
                            method,
                            account_type,
                            model_quality: None,
                        },
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(account, %err, "pattern classification failed");
                }
            }
        }

        if account_type == AccountType::FixedExpense {
            match carry_forward(series, origin, horizon) {
                Ok(forecast) => {
                    return RouteOutcome::Final(
                        forecast,
                        ForecastMetadata {
                            method: ForecastMethod::CarryForward,
                            account_type,
                            model_quality: None,
                        },
                    )
                }
                Err(err) => {
                    warn!(account, %err, "carry-forward failed");
                }
            }
        }

        RouteOutcome::NeedsModel
    }

    fn fit_trading_day_model(
        &self,
        input: &EngineInput,
        revenue_history: Option<&MonthlySeries>,
    ) -> Option<(TradingDayModel, BTreeMap<NaiveDate, f64>)> {
        if !self.config.trading_days.enabled {
            return None;
        }
        let activity = input.daily_activity.as_ref()?;
        if activity.is_empty() {
            return None;
        }

        let counts = monthly_trading_day_counts(activity);
        let writeoffs = match revenue_history {
            Some(revenue) => {
                detect_writeoff_months(revenue, &counts, &self.config.trading_days)
            }
            None => BTreeSet::new(),
        };
        if !writeoffs.is_empty() {
            debug!(months = writeoffs.len(), "write-off months excluded");
        }

        match TradingDayModel::fit(activity, &writeoffs) {
            Ok(model) => Some((model, counts)),
            Err(err) => {
                warn!(%err, "trading-day model fit failed");
                None
            }
        }
    }

    /// Forecast total revenue: grid search when the series qualifies,
    /// trend extrapolation otherwise. The internal route means a missing
    /// revenue reference is always recoverable.
    fn forecast_revenue(
        &self,
        history: &MonthlySeries,
        origin: NaiveDate,
        horizon: usize,
    ) -> Result<MonthlyForecast> {
        let verdict = check_eligibility(history, &self.config.eligibility);
        if verdict.is_eligible() {
            let search = GridSearch::new(self.config.grid.clone());
            if let Ok(selected) = search.run(history) {
                return selected.model.predict(horizon, self.dampening());
            }
        }
        extrapolate_revenue(history, origin, horizon)
    }

    fn dampening(&self) -> Option<f64> {
        if self.config.trend_dampening {
            Some(self.config.dampening_tau)
        } else {
            None
        }
    }

    /// Partition accounts into root groups by prefix; singleton groups
    /// when hierarchical forecasting is disabled.
    fn group_accounts(
        &self,
        accounts: &BTreeMap<String, MonthlySeries>,
    ) -> BTreeMap<String, BTreeMap<String, MonthlySeries>> {
        let mut groups: BTreeMap<String, BTreeMap<String, MonthlySeries>> = BTreeMap::new();
        for (account, series) in accounts {
            let key = if self.config.hierarchy.enabled {
                let len = self.config.hierarchy.root_prefix_len.min(account.len());
                account[..len].to_string()
            } else {
                account.clone()
            };
            groups
                .entry(key)
                .or_default()
                .insert(account.clone(), series.clone());
        }
        groups
    }

    /// Forecast one root group: tree construction, base fits per node,
    /// reconciliation, and per-account extraction.
    fn forecast_group(
        &self,
        prefix: &str,
        members: &BTreeMap<String, MonthlySeries>,
        horizon: usize,
        revenue_history: Option<&MonthlySeries>,
        revenue_forecast: Option<&MonthlyForecast>,
    ) -> Result<TreeResult> {
        let mut result = TreeResult::default();

        let outcome = HierarchyTree::build(prefix, members, |series| {
            check_eligibility(series, &self.config.eligibility)
        })?;
        let (tree, rejected) = match outcome {
            TreeOutcome::Built {
                tree,
                rejected_refinements,
            } => (tree, rejected_refinements),
            TreeOutcome::RootRejected(reasons) => {
                debug!(prefix, ?reasons, "root group rejected, routed to fallback");
                result.rejections.push((prefix.to_string(), reasons));
                result.fallback_accounts.extend(members.keys().cloned());
                return Ok(result);
            }
        };
        result.rejections.extend(rejected);

        // Base forecasts for every node; reconciliation is the barrier and
        // cannot start before the slowest fit resolves.
        let search = GridSearch::new(self.config.grid.clone());
        let nodes = tree.nodes();
        let bases: Vec<NodeBase> = nodes
            .par_iter()
            .map(|node| {
                self.node_base_forecast(
                    &search,
                    &node.series,
                    horizon,
                    revenue_history,
                    revenue_forecast,
                )
            })
            .collect();

        let base_forecasts: Vec<Vec<f64>> =
            bases.iter().map(|b| b.forecast.clone()).collect();
        let residuals: Vec<Vec<(NaiveDate, f64)>> =
            bases.iter().map(|b| b.residuals.clone()).collect();

        let reconciled = match reconcile(
            &tree,
            &base_forecasts,
            &residuals,
            self.config.weighting_method,
        ) {
            Ok(reconciled) => reconciled,
            Err(err @ ForecastError::HierarchyMismatch { .. }) => return Err(err),
            Err(err) => {
                warn!(prefix, %err, "reconciliation degraded to base forecasts");
                base_forecasts.clone()
            }
        };

        let method = if tree.len() == 1 && !self.config.hierarchy.enabled {
            ForecastMethod::TrendSeason
        } else {
            ForecastMethod::Hierarchical
        };

        for (idx, node) in nodes.iter().enumerate() {
            result
                .node_forecasts
                .push((node.prefix.clone(), reconciled[idx].clone()));
        }

        // Leaf forecasts map onto accounts; multi-account leaves are
        // distributed by each member's share of recent observed activity.
        let origin = add_months(tree.root().series.end_month(), 1);
        for leaf in tree.leaves() {
            let node = &nodes[leaf];
            let vector = &reconciled[leaf];
            let quality = &bases[leaf].quality;

            let shares = if node.accounts.len() == 1 {
                vec![1.0]
            } else {
                recent_activity_shares(node.accounts.as_slice(), members)
            };
            for (account, share) in node.accounts.iter().zip(shares) {
                let values: Vec<f64> = vector.iter().map(|v| v * share).collect();
                let forecast = MonthlyForecast::from_values(origin, values)?;
                result.account_forecasts.push((
                    account.clone(),
                    forecast,
                    ForecastMetadata {
                        method,
                        // Corrected by the caller, which owns the table.
                        account_type: AccountType::UntypedForecastable,
                        model_quality: quality.clone(),
                    },
                ));
            }
        }

        Ok(result)
    }

    /// Base forecast for one hierarchy node: grid search, falling through
    /// to the revenue-proportional model, then to a flat carry of the last
    /// value. A node always produces a base forecast so reconciliation is
    /// never starved.
    fn node_base_forecast(
        &self,
        search: &GridSearch,
        series: &MonthlySeries,
        horizon: usize,
        revenue_history: Option<&MonthlySeries>,
        revenue_forecast: Option<&MonthlyForecast>,
    ) -> NodeBase {
        match search.run(series) {
            Ok(selected) => {
                if let Ok(forecast) = selected.model.predict(horizon, self.dampening()) {
                    return NodeBase {
                        forecast: forecast.dense_values(),
                        residuals: selected.model.residuals().unwrap_or(&[]).to_vec(),
                        quality: model_quality(&selected),
                    };
                }
            }
            Err(err) => {
                debug!(%err, "no surviving grid candidate for node");
            }
        }

        if let (Some(history), Some(forecast)) = (revenue_history, revenue_forecast) {
            if let Ok(model) =
                RevenueProportional::fit(series, history, &self.config.fallback)
            {
                if let Ok(projected) = model.forecast(forecast) {
                    return NodeBase {
                        forecast: projected.dense_values(),
                        residuals: model.residuals(series, history),
                        quality: None,
                    };
                }
            }
        }

        let last = series.last_observed().map(|(_, v)| v).unwrap_or(0.0);
        NodeBase {
            forecast: vec![last; horizon],
            residuals: Vec::new(),
            quality: None,
        }
    }

    /// Statistical fallback for a single account.
    fn fallback_forecast(
        &self,
        account: &str,
        series: &MonthlySeries,
        origin: NaiveDate,
        horizon: usize,
        revenue_history: Option<&MonthlySeries>,
        revenue_forecast: Option<&MonthlyForecast>,
    ) -> MonthlyForecast {
        if let (Some(history), Some(forecast)) = (revenue_history, revenue_forecast) {
            match RevenueProportional::fit(series, history, &self.config.fallback) {
                Ok(model) => match model.forecast(forecast) {
                    Ok(projected) => return projected,
                    Err(err) => warn!(account, %err, "fallback projection failed"),
                },
                Err(err) => {
                    debug!(account, %err, "no usable revenue relationship")
                }
            }
        }

        // Last resort: flat carry of the last observation.
        let last = series.last_observed().map(|(_, v)| v).unwrap_or(0.0);
        MonthlyForecast::from_values(origin, vec![last; horizon])
            .expect("horizon validated at entry")
    }
}

enum RouteOutcome {
    Final(MonthlyForecast, ForecastMetadata),
    NeedsModel,
}

#[derive(Default)]
struct TreeResult {
    account_forecasts: Vec<(String, MonthlyForecast, ForecastMetadata)>,
    node_forecasts: Vec<(String, Vec<f64>)>,
    rejections: Vec<(String, Vec<RejectionReason>)>,
    fallback_accounts: Vec<String>,
}

struct NodeBase {
    forecast: Vec<f64>,
    residuals: Vec<(NaiveDate, f64)>,
    quality: Option<ModelQuality>,
}

fn model_quality(selected: &SelectedModel) -> Option<ModelQuality> {
    let residuals = selected.model.residuals()?;
    let fitted = selected.model.fitted_values()?;
    let actual: Vec<f64> = residuals
        .iter()
        .zip(fitted)
        .map(|((_, r), f)| f + r)
        .collect();
    let accuracy = calculate_metrics(&actual, fitted).ok()?;
    Some(ModelQuality {
        score: selected.score,
        active_changepoints: selected.active_changepoints,
        train_size: selected.train_size,
        accuracy,
    })
}

/// Carry-forward for fixed expenses: the prior year's value for the same
/// calendar month, falling back to the most recent observation.
fn carry_forward(
    series: &MonthlySeries,
    origin: NaiveDate,
    horizon: usize,
) -> Result<MonthlyForecast> {
    let Some((_, last_value)) = series.last_observed() else {
        return Err(ForecastError::EmptyData);
    };
    let values: Vec<f64> = (0..horizon)
        .map(|step| {
            let target = add_months(origin, step as i32);
            series
                .value_at(add_months(target, -12))
                .unwrap_or(last_value)
        })
        .collect();
    MonthlyForecast::from_values(origin, values)
}

/// Each account's share of the leaf's observed activity over the trailing
/// year; equal shares when nothing was observed.
fn recent_activity_shares(
    accounts: &[String],
    members: &BTreeMap<String, MonthlySeries>,
) -> Vec<f64> {
    let sums: Vec<f64> = accounts
        .iter()
        .map(|account| {
            members[account]
                .trailing(12)
                .iter()
                .filter_map(|v| *v)
                .map(f64::abs)
                .sum()
        })
        .collect();
    let total: f64 = sums.iter().sum();
    if total > 1e-9 {
        sums.iter().map(|s| s / total).collect()
    } else {
        vec![1.0 / accounts.len() as f64; accounts.len()]
    }
}
