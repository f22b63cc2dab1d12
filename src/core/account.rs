//! Account classification by numeric prefix.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The four forecastable account families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    /// Fixed expenses: forecast by carrying the prior year forward.
    FixedExpense,
    /// Variable expenses: trend/seasonality or statistical fallback.
    VariableExpense,
    /// Revenue accounts: may pass through the trading-day normalizer.
    Revenue,
    /// Forecastable accounts without a more specific type.
    UntypedForecastable,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccountType::FixedExpense => "fixed_expenses",
            AccountType::VariableExpense => "variable_expenses",
            AccountType::Revenue => "revenue",
            AccountType::UntypedForecastable => "forecastable",
        };
        write!(f, "{name}")
    }
}

/// Static prefix table mapping account numbers to their type.
///
/// Loaded once per deployment and immutable thereafter. Lookup order is
/// fixed → variable → revenue → untyped, matching the source prefix table's
/// precedence, so a shorter revenue prefix (e.g. "7") cannot shadow a more
/// specific expense prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationTable {
    fixed: Vec<String>,
    variable: Vec<String>,
    revenue: Vec<String>,
    untyped: Vec<String>,
}

impl ClassificationTable {
    /// Build a table from (prefix, type) entries.
    ///
    /// Prefix 603 (stock variation) is forced to fixed regardless of the
    /// table's own claim; it is not a real recurring charge.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, AccountType)>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (prefix, account_type) in entries {
            let prefix = prefix.into();
            let account_type = if prefix == "603" {
                AccountType::FixedExpense
            } else {
                account_type
            };
            match account_type {
                AccountType::FixedExpense => table.fixed.push(prefix),
                AccountType::VariableExpense => table.variable.push(prefix),
                AccountType::Revenue => table.revenue.push(prefix),
                AccountType::UntypedForecastable => table.untyped.push(prefix),
            }
        }
        table
    }

    /// Classify an account number by its prefix.
    pub fn classify(&self, account: &str) -> Option<AccountType> {
        let starts_with_any =
            |prefixes: &[String]| prefixes.iter().any(|p| account.starts_with(p.as_str()));

        if starts_with_any(&self.fixed) {
            Some(AccountType::FixedExpense)
        } else if starts_with_any(&self.variable) {
            Some(AccountType::VariableExpense)
        } else if starts_with_any(&self.revenue) {
            Some(AccountType::Revenue)
        } else if starts_with_any(&self.untyped) {
            Some(AccountType::UntypedForecastable)
        } else {
            None
        }
    }
}
