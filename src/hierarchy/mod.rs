//! Hierarchy construction and forecast reconciliation.

mod reconcile;
mod tree;

pub use reconcile::{reconcile, summing_matrix, WeightingMethod};
pub use tree::{HierarchyConfig, HierarchyNode, HierarchyTree, TreeOutcome};
