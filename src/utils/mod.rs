//! Shared numeric utilities.

pub mod linalg;
pub mod metrics;
pub mod ols;
pub mod stats;

pub use metrics::{calculate_metrics, AccuracyMetrics};
pub use ols::{linear_fit, weighted_linear_fit, LinearFit};
pub use stats::{coefficient_of_variation, mean, median, quantile, std_dev, variance};
