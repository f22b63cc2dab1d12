//! Prefix hierarchy over accounts, arena-allocated.
//!
//! Nodes live in a flat vector with index-based parent/child links, which
//! keeps the tree trivially cloneable and serializable across the
//! reconciliation passes.

use crate::core::MonthlySeries;
use crate::error::{ForecastError, Result};
use crate::trend::{EligibilityVerdict, RejectionReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Hierarchy construction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    /// Whether hierarchical forecasting is enabled at all; when disabled
    /// every account becomes its own singleton tree.
    pub enabled: bool,
    /// Number of leading digits forming the root groups.
    pub root_prefix_len: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_prefix_len: 3,
        }
    }
}

/// One aggregation node: a group of accounts sharing a numeric prefix.
#[derive(Debug, Clone)]
pub struct HierarchyNode {
    pub prefix: String,
    /// Sorted member account identifiers.
    pub accounts: Vec<String>,
    /// Elementwise sum of the member series.
    pub series: MonthlySeries,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl HierarchyNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Outcome of building one root group.
#[derive(Debug, Clone)]
pub enum TreeOutcome {
    /// The root aggregation is eligible; deeper refinements that failed
    /// eligibility are recorded as (prefix, reasons).
    Built {
        tree: HierarchyTree,
        rejected_refinements: Vec<(String, Vec<RejectionReason>)>,
    },
    /// The root aggregation itself failed eligibility; every member
    /// account is routed to the statistical fallback.
    RootRejected(Vec<RejectionReason>),
}

/// An arena of hierarchy nodes, root at index 0, DFS pre-order.
#[derive(Debug, Clone)]
pub struct HierarchyTree {
    nodes: Vec<HierarchyNode>,
}

impl HierarchyTree {
    /// Build the tree for one root group by successive prefix refinement.
    ///
    /// The prefix is extended one digit at a time; a node is split only
    /// when every resulting sub-aggregation passes the eligibility check,
    /// so children always partition their parent's account set. Runs of
    /// single-child refinements are collapsed into the longer prefix. The
    /// resulting depth varies per account family depending on how finely
    /// data quality permits disaggregation.
    pub fn build<F>(
        root_prefix: &str,
        accounts: &BTreeMap<String, MonthlySeries>,
        eligibility: F,
    ) -> Result<TreeOutcome>
    where
        F: Fn(&MonthlySeries) -> EligibilityVerdict,
    {
        if accounts.is_empty() {
            return Err(ForecastError::EmptyData);
        }
        let root_series = MonthlySeries::sum_of(accounts.values())?;
        let verdict = eligibility(&root_series);
        if !verdict.is_eligible() {
            return Ok(TreeOutcome::RootRejected(verdict.rejections));
        }

        let mut tree = HierarchyTree { nodes: Vec::new() };
        let mut rejected = Vec::new();
        let member_names: Vec<String> = accounts.keys().cloned().collect();
        tree.nodes.push(HierarchyNode {
            prefix: root_prefix.to_string(),
            accounts: member_names,
            series: root_series,
            parent: None,
            children: Vec::new(),
        });
        tree.refine(0, accounts, &eligibility, &mut rejected)?;

        Ok(TreeOutcome::Built {
            tree,
            rejected_refinements: rejected,
        })
    }

    /// A degenerate single-node tree for one account.
    pub fn singleton(account: &str, series: MonthlySeries) -> Self {
        HierarchyTree {
            nodes: vec![HierarchyNode {
                prefix: account.to_string(),
                accounts: vec![account.to_string()],
                series,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    fn refine<F>(
        &mut self,
        node_idx: usize,
        accounts: &BTreeMap<String, MonthlySeries>,
        eligibility: &F,
        rejected: &mut Vec<(String, Vec<RejectionReason>)>,
    ) -> Result<()>
    where
        F: Fn(&MonthlySeries) -> EligibilityVerdict,
    {
        let members = self.nodes[node_idx].accounts.clone();
        if members.len() < 2 {
            return Ok(());
        }

        // Extend the prefix until the group actually branches; a single
        // shared digit adds no information.
        let mut prefix_len = self.nodes[node_idx].prefix.len() + 1;
        let groups = loop {
            if members.iter().any(|a| a.len() < prefix_len) {
                // Some account is exhausted before the group branches.
                return Ok(());
            }
            let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for account in &members {
                groups
                    .entry(account[..prefix_len].to_string())
                    .or_default()
                    .push(account.clone());
            }
            if groups.len() > 1 {
                break groups;
            }
            prefix_len += 1;
        };

        // All sub-aggregations must pass eligibility for the split to be
        // sound; a partial split would leave the children not summing to
        // the parent.
        let mut children = Vec::with_capacity(groups.len());
        let mut all_eligible = true;
        for (sub_prefix, group_accounts) in &groups {
            let series =
                MonthlySeries::sum_of(group_accounts.iter().map(|a| &accounts[a]))?;
            let verdict = eligibility(&series);
            if verdict.is_eligible() {
                children.push((sub_prefix.clone(), group_accounts.clone(), series));
            } else {
                debug!(prefix = %sub_prefix, rejections = ?verdict.rejections, "refinement rejected");
                rejected.push((sub_prefix.clone(), verdict.rejections));
                all_eligible = false;
            }
        }
        if !all_eligible {
            return Ok(());
        }

        for (sub_prefix, group_accounts, series) in children {
            let child_idx = self.nodes.len();
            self.nodes.push(HierarchyNode {
                prefix: sub_prefix,
                accounts: group_accounts,
                series,
                parent: Some(node_idx),
                children: Vec::new(),
            });
            self.nodes[node_idx].children.push(child_idx);
            self.refine(child_idx, accounts, eligibility, rejected)?;
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[HierarchyNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> &HierarchyNode {
        &self.nodes[0]
    }

    /// Indices of leaf nodes, in arena order.
    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].is_leaf())
            .collect()
    }

    /// Verify that every non-leaf node's children exactly partition its
    /// account set.
    ///
    /// A violation is a structural inconsistency (classification or
    /// prefix-table defect) and is fatal for the tree.
    pub fn validate(&self) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.is_leaf() {
                continue;
            }
            let mut covered: Vec<&String> = node
                .children
                .iter()
                .flat_map(|c| self.nodes[*c].accounts.iter())
                .collect();
            covered.sort();
            let mut expected: Vec<&String> = node.accounts.iter().collect();
            expected.sort();
            if covered != expected {
                return Err(ForecastError::HierarchyMismatch {
                    prefix: node.prefix.clone(),
                    detail: format!(
                        "children of node {idx} cover {} accounts, parent has {}",
                        covered.len(),
                        expected.len()
                    ),
                });
            }
        }
        Ok(())
    }
}
