//! Step-structure features derived from an account series.
//!
//! A *spike* is an immediate jump that reverts; a *level change* is an
//! immediate jump that persists. Level changes partition the observed
//! history into constant-value segments, from which the step features are
//! derived.

use crate::core::MonthlySeries;
use crate::utils::stats;

/// Parameters for the step scan.
#[derive(Debug, Clone)]
pub struct StepScanConfig {
    /// Relative jump size that counts as a step.
    pub relative_threshold: f64,
    /// Floor on the normalizing magnitude, so near-zero values do not blow
    /// up the relative distances.
    pub magnitude_floor: f64,
}

impl Default for StepScanConfig {
    fn default() -> Self {
        Self {
            relative_threshold: 0.1,
            magnitude_floor: 1e-3,
        }
    }
}

/// Features describing the step/spike structure of a series.
#[derive(Debug, Clone)]
pub struct StepFeatures {
    /// Signed value deltas at each level change.
    pub magnitudes: Vec<f64>,
    /// Months between consecutive level changes.
    pub intervals: Vec<f64>,
    /// Coefficient of variation of the absolute step magnitudes.
    pub magnitude_cv: f64,
    /// Coefficient of variation of the step intervals.
    pub interval_cv: f64,
    /// Mean of 1/(1+cv) over valid (length >= 2) segments.
    pub quality: f64,
    /// Fraction of observed points lying in valid segments.
    pub explained_fraction: f64,
    /// Number of distinct value levels across segments.
    pub distinct_levels: usize,
    /// Number of detected level changes.
    pub step_count: usize,
    /// Number of detected spikes.
    pub spike_count: usize,
    /// Whether the observed history is effectively one constant value.
    pub is_constant: bool,
    /// Whether the history alternates between exactly two levels.
    pub is_binary: bool,
    /// Number of observed points scanned.
    pub n_points: usize,
}

impl StepFeatures {
    fn empty() -> Self {
        Self {
            magnitudes: Vec::new(),
            intervals: Vec::new(),
            magnitude_cv: f64::NAN,
            interval_cv: f64::NAN,
            quality: f64::NAN,
            explained_fraction: 0.0,
            distinct_levels: 0,
            step_count: 0,
            spike_count: 0,
            is_constant: false,
            is_binary: false,
            n_points: 0,
        }
    }
}

/// Scan the observed history of a series for step structure.
pub fn scan_steps(series: &MonthlySeries, config: &StepScanConfig) -> StepFeatures {
    let observed = series.observed();
    let n = observed.len();
    if n == 0 {
        return StepFeatures::empty();
    }

    let threshold = config.relative_threshold;
    let floor = config.magnitude_floor;
    let rel = |delta: f64, reference: f64| delta.abs() / reference.abs().max(floor);

    // Segments as (start axis index, values). The reference value for the
    // jump distances is the last non-spike observation, so a spike does not
    // poison the classification of its successor.
    let mut segments: Vec<(usize, Vec<f64>)> = vec![(observed[0].0, vec![observed[0].1])];
    let mut change_points: Vec<(usize, f64)> = Vec::new(); // (axis index, signed delta)
    let mut spike_count = 0usize;
    let mut prev = observed[0].1;

    for i in 1..n {
        let (axis_idx, value) = observed[i];
        let immediate = rel(value - prev, prev);

        if immediate > threshold {
            let persists = if i + 1 < n {
                rel(observed[i + 1].1 - prev, prev) > threshold
            } else {
                // The final point has no successor to confirm reversion;
                // treat its jump as a new level.
                true
            };

            if persists {
                change_points.push((axis_idx, value - prev));
                segments.push((axis_idx, vec![value]));
                prev = value;
            } else {
                spike_count += 1;
                // prev deliberately not updated.
            }
        } else {
            segments.last_mut().expect("at least one segment").1.push(value);
            prev = value;
        }
    }

    let step_count = change_points.len();
    let magnitudes: Vec<f64> = change_points.iter().map(|(_, d)| *d).collect();
    let intervals: Vec<f64> = change_points
        .windows(2)
        .map(|w| (w[1].0 - w[0].0) as f64)
        .collect();

    let abs_magnitudes: Vec<f64> = magnitudes.iter().map(|m| m.abs()).collect();
    let magnitude_cv = stats::coefficient_of_variation(&abs_magnitudes);
    let interval_cv = stats::coefficient_of_variation(&intervals);

    // Segment quality: 1/(1+cv) per valid segment, cv floored against
    // near-zero means.
    let mut quality_terms = Vec::new();
    let mut explained_points = 0usize;
    for (_, values) in &segments {
        if values.len() < 2 {
            continue;
        }
        explained_points += values.len();
        let mean = stats::mean(values);
        let cv = stats::std_dev(values) / mean.abs().max(floor);
        if cv.is_finite() {
            quality_terms.push(1.0 / (1.0 + cv));
        }
    }
    let quality = if quality_terms.is_empty() {
        f64::NAN
    } else {
        stats::mean(&quality_terms)
    };
    let explained_fraction = explained_points as f64 / n as f64;

    // Distinct levels: cluster segment means by the same relative threshold.
    let mut levels: Vec<f64> = segments.iter().map(|(_, v)| stats::mean(v)).collect();
    levels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut distinct_levels = 0usize;
    let mut cluster_rep = f64::NAN;
    for level in &levels {
        if distinct_levels == 0 || rel(level - cluster_rep, cluster_rep) > threshold {
            distinct_levels += 1;
            cluster_rep = *level;
        }
    }

    let values_only: Vec<f64> = observed.iter().map(|(_, v)| *v).collect();
    let spread = {
        let max = values_only.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = values_only.iter().cloned().fold(f64::INFINITY, f64::min);
        (max - min).abs() / stats::mean(&values_only).abs().max(floor)
    };
    let is_constant = spread <= threshold;
    let is_binary = distinct_levels == 2 && step_count >= 1;

    StepFeatures {
        magnitudes,
        intervals,
        magnitude_cv,
        interval_cv,
        quality,
        explained_fraction,
        distinct_levels,
        step_count,
        spike_count,
        is_constant,
        is_binary,
        n_points: n,
    }
}
