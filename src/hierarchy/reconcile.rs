//! Cross-sectional reconciliation of hierarchical base forecasts.
//!
//! Given independent base forecasts for every node of one tree, the
//! reconciled forecasts are the projection S (S' W⁻¹ S)⁻¹ S' W⁻¹ ŷ of the
//! stacked base forecasts, which makes every parent equal the elementwise
//! sum of its children while minimizing total adjustment under the chosen
//! weighting. The weighting is a pure function of (base forecasts,
//! residual history, hierarchy structure), so methods can be swapped
//! without touching tree construction or base forecasting.

use crate::error::{ForecastError, Result};
use crate::hierarchy::tree::HierarchyTree;
use crate::utils::linalg::{invert_spd, mat_mul, mat_vec, solve_symmetric, transpose};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Covariance/weighting choice for the reconciliation projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightingMethod {
    /// Identity weighting; no variance information used.
    Ols,
    /// Weights by the number of bottom-level series under each node.
    Structural,
    /// Weights by the variance of each node's in-sample residuals.
    Wlsv,
    /// Shrinks the full residual covariance toward its diagonal.
    Shrinkage,
    /// Unshrunk full sample covariance; needs the most history.
    Sample,
}

/// Reconcile one tree's base forecasts.
///
/// `base_forecasts[i]` is node i's horizon-length base forecast;
/// `residuals[i]` its in-sample residual history keyed by month. Returns
/// per-node reconciled forecasts in arena order.
pub fn reconcile(
    tree: &HierarchyTree,
    base_forecasts: &[Vec<f64>],
    residuals: &[Vec<(NaiveDate, f64)>],
    method: WeightingMethod,
) -> Result<Vec<Vec<f64>>> {
    let m = tree.len();
    if base_forecasts.len() != m {
        return Err(ForecastError::DimensionMismatch {
            expected: m,
            got: base_forecasts.len(),
        });
    }
    if residuals.len() != m {
        return Err(ForecastError::DimensionMismatch {
            expected: m,
            got: residuals.len(),
        });
    }
    let horizon = base_forecasts.first().map(|f| f.len()).unwrap_or(0);
    if horizon == 0 {
        return Err(ForecastError::EmptyData);
    }
    for f in base_forecasts {
        if f.len() != horizon {
            return Err(ForecastError::DimensionMismatch {
                expected: horizon,
                got: f.len(),
            });
        }
    }
    tree.validate()?;

    let s = summing_matrix(tree);
    let b = tree.leaves().len();

    // A single node needs no reconciliation.
    if m == 1 {
        return Ok(vec![base_forecasts[0].clone()]);
    }

    let w = weight_matrix(tree, residuals, method);
    let w_inv = invert_spd(&w).ok_or_else(|| {
        ForecastError::ComputationError("weighting matrix is singular".to_string())
    })?;

    // A = S' W⁻¹ S (b x b), shared across horizon steps.
    let st = transpose(&s);
    let st_winv = mat_mul(&st, &w_inv);
    let a = mat_mul(&st_winv, &s);

    let mut reconciled = vec![vec![0.0; horizon]; m];
    for h in 0..horizon {
        let y_hat: Vec<f64> = base_forecasts.iter().map(|f| f[h]).collect();
        let rhs = mat_vec(&st_winv, &y_hat);
        let bottom = solve_symmetric(&a, &rhs).ok_or_else(|| {
            ForecastError::ComputationError("reconciliation system is singular".to_string())
        })?;
        debug_assert_eq!(bottom.len(), b);
        let projected = mat_vec(&s, &bottom);
        for (i, value) in projected.into_iter().enumerate() {
            reconciled[i][h] = value;
        }
    }
    Ok(reconciled)
}

/// Summing matrix mapping bottom-level forecasts to every node.
///
/// Rows follow the arena order; columns follow [`HierarchyTree::leaves`].
pub fn summing_matrix(tree: &HierarchyTree) -> Vec<Vec<f64>> {
    let leaves = tree.leaves();
    let m = tree.len();
    let mut s = vec![vec![0.0; leaves.len()]; m];

    for (col, &leaf) in leaves.iter().enumerate() {
        // A leaf contributes to itself and every ancestor.
        let mut current = Some(leaf);
        while let Some(idx) = current {
            s[idx][col] = 1.0;
            current = tree.nodes()[idx].parent;
        }
    }
    s
}

fn weight_matrix(
    tree: &HierarchyTree,
    residuals: &[Vec<(NaiveDate, f64)>],
    method: WeightingMethod,
) -> Vec<Vec<f64>> {
    let m = tree.len();
    match method {
        WeightingMethod::Ols => identity(m),
        WeightingMethod::Structural => {
            let s = summing_matrix(tree);
            diagonal(
                &s.iter()
                    .map(|row| row.iter().sum::<f64>().max(1.0))
                    .collect::<Vec<f64>>(),
            )
        }
        WeightingMethod::Wlsv => diagonal(&residual_variances(residuals)),
        WeightingMethod::Shrinkage | WeightingMethod::Sample => {
            match aligned_residual_matrix(residuals) {
                Some(rows) if rows.len() > m => {
                    let cov = covariance(&rows, m);
                    if method == WeightingMethod::Sample {
                        cov
                    } else {
                        shrink_toward_diagonal(&rows, &cov)
                    }
                }
                _ => {
                    // Too little jointly observed history for a full
                    // covariance estimate; degrade to the diagonal.
                    warn!(
                        nodes = m,
                        ?method,
                        "insufficient aligned residual history, using wlsv weights"
                    );
                    diagonal(&residual_variances(residuals))
                }
            }
        }
    }
}

fn identity(n: usize) -> Vec<Vec<f64>> {
    let mut out = vec![vec![0.0; n]; n];
    for (i, row) in out.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    out
}

fn diagonal(values: &[f64]) -> Vec<Vec<f64>> {
    let n = values.len();
    let mut out = vec![vec![0.0; n]; n];
    for (i, row) in out.iter_mut().enumerate() {
        row[i] = values[i].max(1e-8);
    }
    out
}

fn residual_variances(residuals: &[Vec<(NaiveDate, f64)>]) -> Vec<f64> {
    residuals
        .iter()
        .map(|r| {
            let values: Vec<f64> = r.iter().map(|(_, v)| *v).collect();
            let var = crate::utils::stats::variance(&values);
            if var.is_finite() {
                var
            } else {
                1.0
            }
        })
        .collect()
}

/// Rows of jointly observed residuals: one row per month present in every
/// node's residual history.
fn aligned_residual_matrix(residuals: &[Vec<(NaiveDate, f64)>]) -> Option<Vec<Vec<f64>>> {
    let mut common: Option<BTreeSet<NaiveDate>> = None;
    for node in residuals {
        let months: BTreeSet<NaiveDate> = node.iter().map(|(m, _)| *m).collect();
        common = Some(match common {
            Some(c) => c.intersection(&months).cloned().collect(),
            None => months,
        });
    }
    let common = common?;
    if common.is_empty() {
        return None;
    }

    let mut rows = Vec::with_capacity(common.len());
    for month in &common {
        let mut row = Vec::with_capacity(residuals.len());
        for node in residuals {
            let value = node
                .iter()
                .find(|(m, _)| m == month)
                .map(|(_, v)| *v)
                .expect("month is in every node's history");
            row.push(value);
        }
        rows.push(row);
    }
    Some(rows)
}

/// Sample covariance (n-1 denominator) of the aligned residual rows.
fn covariance(rows: &[Vec<f64>], m: usize) -> Vec<Vec<f64>> {
    let n = rows.len() as f64;
    let mut means = vec![0.0; m];
    for row in rows {
        for (j, v) in row.iter().enumerate() {
            means[j] += v;
        }
    }
    for mean in means.iter_mut() {
        *mean /= n;
    }

    let mut cov = vec![vec![0.0; m]; m];
    for row in rows {
        for i in 0..m {
            for j in 0..m {
                cov[i][j] += (row[i] - means[i]) * (row[j] - means[j]);
            }
        }
    }
    for row in cov.iter_mut() {
        for v in row.iter_mut() {
            *v /= n - 1.0;
        }
    }
    // Keep the diagonal strictly positive.
    for i in 0..m {
        cov[i][i] = cov[i][i].max(1e-8);
    }
    cov
}

/// Schäfer-Strimmer shrinkage of the covariance toward its diagonal.
///
/// The intensity is the ratio of the estimation variance of the
/// off-diagonal entries to their squared magnitude, clamped to [0, 1].
fn shrink_toward_diagonal(rows: &[Vec<f64>], cov: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let m = cov.len();
    let n = rows.len() as f64;

    let mut means = vec![0.0; m];
    for row in rows {
        for (j, v) in row.iter().enumerate() {
            means[j] += v;
        }
    }
    for mean in means.iter_mut() {
        *mean /= n;
    }

    // Var of each off-diagonal covariance estimate.
    let mut var_sum = 0.0;
    let mut sq_sum = 0.0;
    for i in 0..m {
        for j in 0..m {
            if i == j {
                continue;
            }
            let mut w_bar = 0.0;
            let mut w_sq = 0.0;
            for row in rows {
                let w = (row[i] - means[i]) * (row[j] - means[j]);
                w_bar += w;
                w_sq += w * w;
            }
            w_bar /= n;
            let var_ij = n / ((n - 1.0).powi(3)) * (w_sq - n * w_bar * w_bar).max(0.0);
            var_sum += var_ij;
            sq_sum += cov[i][j] * cov[i][j];
        }
    }

    let lambda = if sq_sum > 0.0 {
        (var_sum / sq_sum).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let mut out = vec![vec![0.0; m]; m];
    for i in 0..m {
        for j in 0..m {
            out[i][j] = if i == j {
                cov[i][j]
            } else {
                (1.0 - lambda) * cov[i][j]
            };
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MonthlySeries;
    use crate::trend::EligibilityVerdict;
    use crate::hierarchy::tree::TreeOutcome;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn m(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    fn build_tree() -> HierarchyTree {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            "601100".to_string(),
            MonthlySeries::from_values(m(2021, 1), vec![Some(100.0); 36]).unwrap(),
        );
        accounts.insert(
            "601200".to_string(),
            MonthlySeries::from_values(m(2021, 1), vec![Some(200.0); 36]).unwrap(),
        );
        accounts.insert(
            "602100".to_string(),
            MonthlySeries::from_values(m(2021, 1), vec![Some(400.0); 36]).unwrap(),
        );
        let outcome = HierarchyTree::build("60", &accounts, |_| EligibilityVerdict::default())
            .unwrap();
        match outcome {
            TreeOutcome::Built { tree, .. } => tree,
            TreeOutcome::RootRejected(_) => panic!("root should be eligible"),
        }
    }

    /// Deterministic pseudo-residuals: distinct per node, non-degenerate.
    fn synthetic_residuals(tree: &HierarchyTree, months: usize) -> Vec<Vec<(NaiveDate, f64)>> {
        (0..tree.len())
            .map(|node| {
                (0..months)
                    .map(|i| {
                        // Distinct step per node keeps the joint residual
                        // covariance well conditioned.
                        let wobble = ((i * (3 + node) + node * 13) % 11) as f64 - 5.0;
                        (crate::core::add_months(m(2021, 1), i as i32), wobble)
                    })
                    .collect()
            })
            .collect()
    }

    fn base_forecasts(tree: &HierarchyTree, horizon: usize) -> Vec<Vec<f64>> {
        // Deliberately incoherent: each node forecasts its own level plus
        // a node-specific offset.
        (0..tree.len())
            .map(|node| {
                (0..horizon)
                    .map(|h| 100.0 * (node + 1) as f64 + 5.0 * h as f64 + 3.0 * node as f64)
                    .collect()
            })
            .collect()
    }

    fn assert_coherent(tree: &HierarchyTree, reconciled: &[Vec<f64>], horizon: usize) {
        for (idx, node) in tree.nodes().iter().enumerate() {
            if node.is_leaf() {
                continue;
            }
            for h in 0..horizon {
                let child_sum: f64 = node
                    .children
                    .iter()
                    .map(|c| reconciled[*c][h])
                    .sum();
                assert_relative_eq!(
                    reconciled[idx][h],
                    child_sum,
                    epsilon = 1e-6,
                    max_relative = 1e-6
                );
            }
        }
    }

    #[test]
    fn all_methods_produce_coherent_forecasts() {
        let tree = build_tree();
        let horizon = 12;
        let base = base_forecasts(&tree, horizon);
        let residuals = synthetic_residuals(&tree, 30);

        for method in [
            WeightingMethod::Ols,
            WeightingMethod::Structural,
            WeightingMethod::Wlsv,
            WeightingMethod::Shrinkage,
            WeightingMethod::Sample,
        ] {
            let reconciled = reconcile(&tree, &base, &residuals, method).unwrap();
            assert_eq!(reconciled.len(), tree.len());
            assert_coherent(&tree, &reconciled, horizon);
        }
    }

    #[test]
    fn coherent_input_is_left_unchanged_under_ols() {
        let tree = build_tree();
        let horizon = 6;
        let s = summing_matrix(&tree);
        let leaves = tree.leaves();

        // Build base forecasts that are already coherent.
        let bottom: Vec<Vec<f64>> = leaves
            .iter()
            .enumerate()
            .map(|(i, _)| (0..horizon).map(|h| 50.0 * (i + 1) as f64 + h as f64).collect())
            .collect();
        let mut base = vec![vec![0.0; horizon]; tree.len()];
        for h in 0..horizon {
            let y: Vec<f64> = bottom.iter().map(|b| b[h]).collect();
            for (i, v) in mat_vec(&s, &y).into_iter().enumerate() {
                base[i][h] = v;
            }
        }

        let residuals = synthetic_residuals(&tree, 24);
        let reconciled =
            reconcile(&tree, &base, &residuals, WeightingMethod::Ols).unwrap();
        for i in 0..tree.len() {
            for h in 0..horizon {
                assert_relative_eq!(reconciled[i][h], base[i][h], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn summing_matrix_shape() {
        let tree = build_tree();
        let s = summing_matrix(&tree);
        let leaves = tree.leaves();
        assert_eq!(s.len(), tree.len());
        assert_eq!(s[0].len(), leaves.len());
        // Root row sums every leaf.
        assert_relative_eq!(s[0].iter().sum::<f64>(), leaves.len() as f64);
        // Each leaf row is a unit vector.
        for (col, &leaf) in leaves.iter().enumerate() {
            assert_relative_eq!(s[leaf][col], 1.0);
            assert_relative_eq!(s[leaf].iter().sum::<f64>(), 1.0);
        }
    }

    #[test]
    fn singleton_tree_passes_through() {
        let tree = HierarchyTree::singleton(
            "601100",
            MonthlySeries::from_values(m(2021, 1), vec![Some(10.0); 24]).unwrap(),
        );
        let base = vec![vec![1.0, 2.0, 3.0]];
        let residuals = vec![vec![(m(2021, 1), 0.5), (m(2021, 2), -0.5)]];
        let reconciled =
            reconcile(&tree, &base, &residuals, WeightingMethod::Shrinkage).unwrap();
        assert_eq!(reconciled, base);
    }

    #[test]
    fn mismatched_input_is_rejected() {
        let tree = build_tree();
        let base = vec![vec![1.0; 12]; tree.len() - 1];
        let residuals = synthetic_residuals(&tree, 24);
        assert!(matches!(
            reconcile(&tree, &base, &residuals, WeightingMethod::Ols),
            Err(ForecastError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn short_residual_history_degrades_gracefully() {
        // Fewer aligned rows than nodes: shrinkage and sample must still
        // produce coherent output via the diagonal fallback.
        let tree = build_tree();
        let base = base_forecasts(&tree, 12);
        let residuals = synthetic_residuals(&tree, 3);

        for method in [WeightingMethod::Shrinkage, WeightingMethod::Sample] {
            let reconciled = reconcile(&tree, &base, &residuals, method).unwrap();
            assert_coherent(&tree, &reconciled, 12);
        }
    }
}
