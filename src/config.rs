use crate::error::{MetricEngineError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Metric names the special-case kinds read from when a definition names no dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MetricRoles {
    pub revenue: String,
    pub ebitda: String,
    pub total_debt: String,
    pub book_equity: String,
    pub interest_expense: String,
}

impl Default for MetricRoles {
    fn default() -> Self {
        Self {
            revenue: "Revenue".to_string(),
            ebitda: "Adjusted EBITDA".to_string(),
            total_debt: "Total Debt".to_string(),
            book_equity: "Book Equity".to_string(),
            interest_expense: "Interest Expense".to_string(),
        }
    }
}

/// Display names that select a metric kind or display format when mapping records are loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct KindRules {
    pub yoy_growth: Vec<String>,
    pub margin: Vec<String>,
    pub interest_coverage: Vec<String>,
    pub leverage: Vec<String>,
    pub book_capital: Vec<String>,
    pub percentage_display: Vec<String>,
    pub multiple_display: Vec<String>,
}

impl Default for KindRules {
    fn default() -> Self {
        Self {
            yoy_growth: strings(&["% YoY Growth"]),
            margin: strings(&["% Margin"]),
            interest_coverage: strings(&["EBITDA / Int. Exp."]),
            leverage: strings(&["Total Debt / EBITDA", "Total Debt + Leases / EBITDA"]),
            book_capital: strings(&[
                "Total Debt / Book Capital",
                "Total Debt + Leases / Book Capital",
            ]),
            percentage_display: strings(&[
                "% YoY Growth",
                "% Margin",
                "Total Debt / Book Capital",
                "Total Debt + Leases / Book Capital",
            ]),
            multiple_display: strings(&[
                "EBITDA / Int. Exp.",
                "Total Debt / EBITDA",
                "Total Debt + Leases / EBITDA",
                "EBITDAR / Interest + Rent",
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BookCapitalAccounts {
    /// Summed into the numerator; an absent account counts as zero.
    pub debt_accounts: Vec<String>,
    /// Candidates for the equity account, first match wins.
    pub equity_accounts: Vec<String>,
}

impl Default for BookCapitalAccounts {
    fn default() -> Self {
        Self {
            debt_accounts: strings(&["NotesPayable", "LineOfCredit"]),
            equity_accounts: strings(&["StockholdersEquity"]),
        }
    }
}

/// EBITDA rebuilt from its components when no EBITDA tag carries a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EbitdaFallback {
    /// Formula tokens that stand for EBITDA itself.
    pub ebitda_accounts: Vec<String>,
    /// Net income, interest, taxes and D&A tags. Missing components count as zero.
    pub components: Vec<String>,
}

impl Default for EbitdaFallback {
    fn default() -> Self {
        Self {
            ebitda_accounts: strings(&["EBITDA"]),
            components: strings(&[
                "NetIncomeLoss",
                "InterestExpenseNonoperating",
                "IncomeTaxExpenseBenefit",
                "DepreciationAndAmortization",
            ]),
        }
    }
}

impl EbitdaFallback {
    pub fn is_ebitda(&self, token: &str) -> bool {
        self.ebitda_accounts.iter().any(|a| a == token)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Annual columns, in output order.
    pub fiscal_years: Vec<i32>,
    pub roles: MetricRoles,
    pub kind_rules: KindRules,
    /// Point-in-time metrics whose trailing value is the current interim value.
    pub stock_metrics: Vec<String>,
    /// Account tag -> synonyms tried when the tag has no value.
    pub account_aliases: BTreeMap<String, Vec<String>>,
    pub book_capital: BookCapitalAccounts,
    pub interest_expense_accounts: Vec<String>,
    /// Used by growth metrics when no revenue metric was computed.
    pub revenue_accounts: Vec<String>,
    pub lineage_file_prefix: String,
    pub ebitda_fallback: EbitdaFallback,
    /// Number of latest fiscal years a comparable average spans.
    pub average_years: usize,
    /// Comparable metrics whose name starts with this are fiscal-year averages.
    pub average_prefix: String,
    pub comparable_file_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut account_aliases = BTreeMap::new();
        account_aliases.insert(
            "InterestExpenseNonoperating".to_string(),
            strings(&["InterestExpense"]),
        );

        Self {
            fiscal_years: vec![2024, 2023, 2022, 2021, 2020],
            roles: MetricRoles::default(),
            kind_rules: KindRules::default(),
            stock_metrics: strings(&["Cash - End of Period", "Total Debt", "Book Equity"]),
            account_aliases,
            book_capital: BookCapitalAccounts::default(),
            interest_expense_accounts: strings(&["InterestExpenseNonoperating"]),
            revenue_accounts: strings(&["Revenues"]),
            lineage_file_prefix: "HFA".to_string(),
            ebitda_fallback: EbitdaFallback::default(),
            average_years: 3,
            average_prefix: "3Y Avg".to_string(),
            comparable_file_prefix: "COMP".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fiscal_years.is_empty() {
            return Err(MetricEngineError::Config(
                "at least one fiscal year is required".to_string(),
            ));
        }

        let unique: BTreeSet<i32> = self.fiscal_years.iter().copied().collect();
        if unique.len() != self.fiscal_years.len() {
            return Err(MetricEngineError::Config(format!(
                "fiscal years contain duplicates: {:?}",
                self.fiscal_years
            )));
        }

        let roles = [
            ("revenue", &self.roles.revenue),
            ("ebitda", &self.roles.ebitda),
            ("total_debt", &self.roles.total_debt),
            ("book_equity", &self.roles.book_equity),
            ("interest_expense", &self.roles.interest_expense),
        ];
        for (role, name) in roles {
            if name.trim().is_empty() {
                return Err(MetricEngineError::Config(format!(
                    "metric role '{}' must name a metric",
                    role
                )));
            }
        }

        if self.book_capital.debt_accounts.is_empty() {
            return Err(MetricEngineError::Config(
                "book capital needs at least one debt account".to_string(),
            ));
        }

        if self.average_years == 0 {
            return Err(MetricEngineError::Config(
                "average_years must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The `average_years` latest fiscal years, newest first.
    pub fn average_window(&self) -> Vec<i32> {
        let mut years = self.fiscal_years.clone();
        years.sort_unstable_by(|a, b| b.cmp(a));
        years.truncate(self.average_years);
        years
    }

    /// Fiscal year the trailing-twelve-month rollup is anchored on.
    pub fn latest_fiscal_year(&self) -> Option<i32> {
        self.fiscal_years.iter().copied().max()
    }

    pub fn is_stock_metric(&self, name: &str) -> bool {
        self.stock_metrics.iter().any(|m| m == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.latest_fiscal_year(), Some(2024));
        assert!(config.is_stock_metric("Total Debt"));
        assert!(!config.is_stock_metric("Revenue"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"fiscal_years": [2023, 2022], "roles": {"ebitda": "EBITDA"}}"#)
                .unwrap();
        assert_eq!(config.fiscal_years, vec![2023, 2022]);
        assert_eq!(config.roles.ebitda, "EBITDA");
        assert_eq!(config.roles.revenue, "Revenue");
        assert_eq!(config.lineage_file_prefix, "HFA");
    }

    #[test]
    fn test_validation_errors() {
        let result = EngineConfig::from_json_str(r#"{"fiscal_years": []}"#);
        assert!(matches!(result, Err(MetricEngineError::Config(_))));

        let result = EngineConfig::from_json_str(r#"{"fiscal_years": [2024, 2024]}"#);
        assert!(matches!(result, Err(MetricEngineError::Config(_))));

        let result = EngineConfig::from_json_str(r#"{"roles": {"revenue": " "}}"#);
        assert!(matches!(result, Err(MetricEngineError::Config(_))));

        let result = EngineConfig::from_json_str(r#"{"average_years": 0}"#);
        assert!(matches!(result, Err(MetricEngineError::Config(_))));
    }

    #[test]
    fn test_average_window_takes_latest_years() {
        let config = EngineConfig {
            fiscal_years: vec![2021, 2024, 2022, 2023],
            ..EngineConfig::default()
        };
        assert_eq!(config.average_window(), vec![2024, 2023, 2022]);
        assert!(config.ebitda_fallback.is_ebitda("EBITDA"));
        assert_eq!(config.comparable_file_prefix, "COMP");
    }
}
