//! # ledger-forecast
//!
//! 12-month forecasting engine for general-ledger account series.
//!
//! Each account's monthly history is routed to one of five forecasting
//! strategies based on its statistical shape and data quality: sparse
//! carry-over, step-function blending, trend/seasonality grid search with
//! hierarchical reconciliation, fixed-expense carry-forward, or the
//! revenue-proportional statistical fallback. Forecasts across an account
//! hierarchy are reconciled so that sub-account totals sum to
//! parent-account totals, and revenue accounts can be normalized by
//! predicted trading-day counts.
//!
//! The whole pipeline is deterministic: identical inputs and configuration
//! produce bit-identical forecasts and metadata.

pub mod calendar;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod hierarchy;
pub mod pattern;
pub mod trend;
pub mod utils;

pub use config::EngineConfig;
pub use error::{ForecastError, Result};

pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::core::{AccountType, ClassificationTable, MonthlyForecast, MonthlySeries};
    pub use crate::engine::{
        EngineInput, ForecastEngine, ForecastMethod, ForecastReport,
    };
    pub use crate::error::{ForecastError, Result};
    pub use crate::hierarchy::WeightingMethod;
}
