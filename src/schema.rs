use crate::config::EngineConfig;
use crate::error::{MetricEngineError, Result};
use crate::utils::{quarter_label, same_day_prior_year};
use chrono::{Datelike, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum StatementKind {
    #[serde(rename = "income")]
    Income,
    #[serde(rename = "balance")]
    Balance,
    #[serde(rename = "cashflow")]
    CashFlow,
}

impl StatementKind {
    /// Lookup order used by the stores: income, balance, cash flow.
    pub const ALL: [StatementKind; 3] = [Self::Income, Self::Balance, Self::CashFlow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Balance => "balance",
            Self::CashFlow => "cashflow",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.csv", self.as_str())
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum FilingType {
    #[serde(rename = "10-K")]
    #[schemars(description = "Annual report; statement columns are 4-digit fiscal years")]
    Annual,

    #[serde(rename = "10-Q")]
    #[schemars(description = "Quarterly report; statement columns are ISO period-end dates")]
    Interim,
}

impl FilingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Annual => "10-K",
            Self::Interim => "10-Q",
        }
    }
}

impl fmt::Display for FilingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column key of a parsed statement table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PeriodKey {
    Year(i32),
    Date(NaiveDate),
}

impl PeriodKey {
    pub fn year(&self) -> i32 {
        match self {
            Self::Year(y) => *y,
            Self::Date(d) => d.year(),
        }
    }

    /// Label used in lineage source references: `2024` or `Q1 2025`.
    pub fn source_label(&self) -> String {
        match self {
            Self::Year(y) => y.to_string(),
            Self::Date(d) => quarter_label(*d),
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Year(y) => write!(f, "{}", y),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = MetricEngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
            let year = s
                .parse::<i32>()
                .map_err(|e| MetricEngineError::InvalidPeriod(format!("{}: {}", s, e)))?;
            return Ok(Self::Year(year));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self::Date)
            .map_err(|_| {
                MetricEngineError::InvalidPeriod(format!(
                    "'{}' is neither a 4-digit year nor a YYYY-MM-DD date",
                    s
                ))
            })
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = MetricEngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A column of the computed metric table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    FiscalYear(i32),
    /// Cumulative interim figure through the given period-end date.
    YearToDate(NaiveDate),
    /// Trailing twelve months ending at the given interim date.
    TrailingTwelveMonths(NaiveDate),
    /// Mean of per-year values over the fiscal years `first..=last`.
    FiscalAverage { first: i32, last: i32 },
}

impl Period {
    pub fn label(&self) -> String {
        match self {
            Self::FiscalYear(y) => y.to_string(),
            Self::YearToDate(d) => format!("YTD {}", d.year()),
            Self::TrailingTwelveMonths(d) => format!("LTM {}", d.year()),
            Self::FiscalAverage { first, last } => format!("Avg {}-{}", first, last),
        }
    }

    /// Key used to look this period up in a statement table.
    pub fn store_key(&self) -> PeriodKey {
        match self {
            Self::FiscalYear(y) => PeriodKey::Year(*y),
            Self::YearToDate(d) | Self::TrailingTwelveMonths(d) => PeriodKey::Date(*d),
            Self::FiscalAverage { last, .. } => PeriodKey::Year(*last),
        }
    }

    /// The same period one year earlier, used as the growth baseline.
    pub fn prior_year(&self) -> Option<Period> {
        match self {
            Self::FiscalYear(y) => Some(Self::FiscalYear(y - 1)),
            Self::YearToDate(d) => same_day_prior_year(*d).map(Self::YearToDate),
            Self::TrailingTwelveMonths(_) | Self::FiscalAverage { .. } => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum MetricKind {
    #[schemars(description = "Arithmetic formula over statement accounts and earlier metrics")]
    Generic,

    #[schemars(description = "Percentage change of the revenue metric against the prior year")]
    YoYGrowth,

    #[schemars(description = "First dependency divided by the second, as a percentage")]
    MarginRatio,

    #[schemars(description = "EBITDA metric divided by the interest expense account")]
    InterestCoverage,

    #[schemars(description = "Total debt metric divided by the EBITDA metric")]
    LeverageRatio,

    #[schemars(description = "Raw debt accounts over debt plus book equity, as a percentage")]
    BookCapitalRatio,

    #[schemars(description = "Value of the first matching source account, unchanged")]
    PassThrough,
}

impl MetricKind {
    /// Kinds whose trailing value is recomputed from the trailing values of their inputs.
    pub fn is_ratio(&self) -> bool {
        matches!(
            self,
            Self::MarginRatio | Self::InterestCoverage | Self::LeverageRatio | Self::BookCapitalRatio
        )
    }

    pub fn default_display(&self) -> DisplayFormat {
        match self {
            Self::YoYGrowth | Self::MarginRatio | Self::BookCapitalRatio => DisplayFormat::Percentage,
            Self::InterestCoverage | Self::LeverageRatio => DisplayFormat::Multiple,
            Self::Generic | Self::PassThrough => DisplayFormat::Thousands,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DisplayFormat {
    /// `7.5%`, negatives `(7.5%)`
    Percentage,
    /// `3.25x`, negatives `(3.25x)`
    Multiple,
    /// Scaled by 1000 with comma grouping, negatives parenthesized
    Thousands,
}

/// One derived metric. Loaded once per run and treated as read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub formula: Option<String>,
    pub dependency_names: Vec<String>,
    pub source_account_candidates: Vec<String>,
    pub kind: MetricKind,
    pub display: DisplayFormat,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            formula: None,
            dependency_names: Vec::new(),
            source_account_candidates: Vec::new(),
            kind,
            display: kind.default_display(),
        }
    }

    pub fn generic(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Generic).with_formula(formula)
    }

    pub fn pass_through(name: impl Into<String>, account: impl Into<String>) -> Self {
        Self::new(name, MetricKind::PassThrough).with_sources([account.into()])
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    /// Dependencies form an ordered set: repeats are dropped, first position wins.
    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.dependency_names.contains(&name) {
                self.dependency_names.push(name);
            }
        }
        self
    }

    pub fn with_sources<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_account_candidates
            .extend(accounts.into_iter().map(Into::into));
        self
    }

    pub fn with_display(mut self, display: DisplayFormat) -> Self {
        self.display = display;
        self
    }

    /// Resolves kind and display format from the display name once, at load time.
    pub fn from_mapping_item(item: &MappingItem, config: &EngineConfig) -> Self {
        let calculation = item.calculation.trim();
        let rules = &config.kind_rules;
        let name = item.metric.as_str();

        let kind = if rules.yoy_growth.iter().any(|n| n == name) {
            MetricKind::YoYGrowth
        } else if rules.margin.iter().any(|n| n == name) && item.dependency_names.len() == 2 {
            MetricKind::MarginRatio
        } else if rules.interest_coverage.iter().any(|n| n == name) {
            MetricKind::InterestCoverage
        } else if rules.leverage.iter().any(|n| n == name) {
            MetricKind::LeverageRatio
        } else if rules.book_capital.iter().any(|n| n == name) {
            MetricKind::BookCapitalRatio
        } else if calculation.is_empty() && !item.financial_statement_keys.is_empty() {
            MetricKind::PassThrough
        } else {
            MetricKind::Generic
        };

        let display = if rules.percentage_display.iter().any(|n| n == name) {
            DisplayFormat::Percentage
        } else if rules.multiple_display.iter().any(|n| n == name) {
            DisplayFormat::Multiple
        } else {
            kind.default_display()
        };

        let mut definition = Self::new(name, kind)
            .with_dependencies(item.dependency_names.iter().cloned())
            .with_sources(item.financial_statement_keys.iter().cloned())
            .with_display(display);
        if !calculation.is_empty() {
            definition.formula = Some(calculation.to_string());
        }
        definition
    }
}

/// A metric record as emitted by the external mapping step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MappingItem {
    #[serde(alias = "aqrr_key")]
    #[schemars(description = "Display name of the metric, exactly as it appears in the canonical schema")]
    pub metric: String,

    #[serde(default)]
    #[schemars(
        description = "Arithmetic over statement account tags and earlier metric names using + - * / and parentheses. Use Tag[YYYY-MM-DD] to pin a tag to a specific interim date. Leave empty for a direct pass-through of the first statement key, or write 'Not available'."
    )]
    pub calculation: String,

    #[serde(default, alias = "aqrr_keys")]
    #[schemars(description = "Names of earlier metrics this metric is derived from, in order")]
    pub dependency_names: Vec<String>,

    #[serde(default)]
    #[schemars(description = "Statement account tags consulted by this metric, in order of preference")]
    pub financial_statement_keys: Vec<String>,
}

/// `{ticker: {filing_type: [[MappingItem, ...]]}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MetricMapping {
    pub tickers: BTreeMap<String, BTreeMap<String, Vec<Vec<MappingItem>>>>,
}

impl MetricMapping {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn items_for(&self, ticker: &str, filing: FilingType) -> Result<&[MappingItem]> {
        let filings = self.tickers.get(ticker).ok_or_else(|| {
            MetricEngineError::MappingNotFound(format!("ticker '{}' has no mapping", ticker))
        })?;
        let groups = filings.get(filing.as_str()).ok_or_else(|| {
            MetricEngineError::MappingNotFound(format!(
                "filing type '{}' not mapped for ticker '{}'",
                filing, ticker
            ))
        })?;
        match groups.first() {
            Some(items) if !items.is_empty() => Ok(items.as_slice()),
            _ => Err(MetricEngineError::MappingNotFound(format!(
                "empty mapping for {} {}",
                ticker, filing
            ))),
        }
    }

    pub fn definitions_for(
        &self,
        ticker: &str,
        filing: FilingType,
        config: &EngineConfig,
    ) -> Result<Vec<MetricDefinition>> {
        Ok(self
            .items_for(ticker, filing)?
            .iter()
            .map(|item| MetricDefinition::from_mapping_item(item, config))
            .collect())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(Vec<MappingItem>)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

/// Ordered display names the output table must conform to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CanonicalSchema {
    #[serde(alias = "aqrr_keys")]
    pub metric_names: Vec<String>,
}

impl CanonicalSchema {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metric_names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
