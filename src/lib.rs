//! # Financial Metric Engine
//!
//! Evaluates a declarative set of derived financial metrics over parsed statement tables and
//! produces a schema-ordered metric table together with a complete audit trail of every value.
//!
//! ## Core Concepts
//!
//! - **Statement store**: income, balance and cash-flow tables keyed by account and period,
//!   with a static alias table for synonym tags
//! - **Metric definitions**: an ordered list of formulas or special kinds (growth, margins,
//!   coverage, leverage, book capital); a metric may only reference metrics declared before it
//! - **Temporal rollup**: `LTM = FY + YTD current - YTD prior` for flow metrics, the current
//!   year-to-date value for stock metrics, and ratios recomputed from rolled-up inputs
//! - **Comparable metrics**: per-ticker formulas evaluated over trailing account values or
//!   averaged across the latest fiscal years
//! - **Lineage**: every committed cell records its formula, operand values and raw sources
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_metric_engine::*;
//!
//! let config = EngineConfig::default();
//! let mapping = MetricMapping::from_json_str(&std::fs::read_to_string("mapping.json")?)?;
//! let request = BuildRequest::from_mapping(
//!     "ELME",
//!     chrono::Local::now().naive_local(),
//!     CanonicalSchema::from_json_str(&std::fs::read_to_string("schema.json")?)?,
//!     &mapping,
//!     &config,
//!     load_statement_dir("data/10-K", FilingType::Annual, AliasTable::default())?,
//!     InterimFiling::new(load_statement_dir("data/10-Q_2025_Q1", FilingType::Interim, AliasTable::default())?, q1_2025),
//!     InterimFiling::new(load_statement_dir("data/10-Q_2024_Q1", FilingType::Interim, AliasTable::default())?, q1_2024),
//! )?;
//!
//! let output = build_historical_analysis(&config, &request)?;
//! println!("{}", output.table.to_csv()?);
//! output.lineage.write_to_dir("logs")?;
//! ```

pub mod align;
pub mod comparable;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod formatting;
pub mod ingestion;
pub mod lineage;
pub mod ltm;
pub mod rollup;
pub mod schema;
pub mod store;
pub mod table;
pub mod utils;

pub use align::SchemaAligner;
pub use comparable::{
    build_comparable_analysis, ComparableAnalysisBuilder, ComparableMetric, ComparableOutput,
    ComparableRequest, ComparableTable, ComparableValue, ComparableWindow,
};
pub use config::{BookCapitalAccounts, EbitdaFallback, EngineConfig, KindRules, MetricRoles};
pub use engine::{CellState, EngineRun, MetricEngine, RunEntry};
pub use error::{BuildFailure, MetricEngineError, Result};
pub use expression::{evaluate, BinaryOperator, DatedToken, Expr, Formula};
pub use formatting::format_value;
pub use ingestion::*;
pub use lineage::{
    CalculationStep, LineageDraft, LineageLog, LineageRecord, MetricKey, SourceLocation,
    SourceRef,
};
pub use ltm::{LtmResolver, Reading};
pub use rollup::{RollupInputs, RollupPeriods, TemporalRollup};
pub use schema::*;
pub use store::{AccountSeries, AliasTable, Resolution, StatementTable, TimeIndexedStore};
pub use table::{ComputedMetricRow, MetricTable};
pub use utils::*;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// One interim filing: its statements and the period-end date its YTD figures run to.
#[derive(Debug, Clone)]
pub struct InterimFiling {
    pub store: TimeIndexedStore,
    pub period_end: NaiveDate,
}

impl InterimFiling {
    pub fn new(store: TimeIndexedStore, period_end: NaiveDate) -> Self {
        Self { store, period_end }
    }

    pub fn period(&self) -> Period {
        Period::YearToDate(self.period_end)
    }
}

/// Everything one build for one ticker consumes.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub ticker: String,
    pub run_timestamp: NaiveDateTime,
    pub canonical_schema: CanonicalSchema,
    pub annual_definitions: Vec<MetricDefinition>,
    pub interim_definitions: Vec<MetricDefinition>,
    pub annual_store: TimeIndexedStore,
    pub ytd_current: InterimFiling,
    pub ytd_prior: InterimFiling,
}

impl BuildRequest {
    /// Resolves the `10-K` and `10-Q` definition lists for `ticker` from a mapping file.
    #[allow(clippy::too_many_arguments)]
    pub fn from_mapping(
        ticker: impl Into<String>,
        run_timestamp: NaiveDateTime,
        canonical_schema: CanonicalSchema,
        mapping: &MetricMapping,
        config: &EngineConfig,
        annual_store: TimeIndexedStore,
        ytd_current: InterimFiling,
        ytd_prior: InterimFiling,
    ) -> Result<Self> {
        let ticker = ticker.into();
        let annual_definitions = mapping.definitions_for(&ticker, FilingType::Annual, config)?;
        let interim_definitions = mapping.definitions_for(&ticker, FilingType::Interim, config)?;

        Ok(Self {
            ticker,
            run_timestamp,
            canonical_schema,
            annual_definitions,
            interim_definitions,
            annual_store,
            ytd_current,
            ytd_prior,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub ticker: String,
    pub table: MetricTable,
    pub lineage: LineageLog,
}

impl BuildOutput {
    pub fn write_lineage(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        self.lineage.write_to_dir(dir)
    }
}

pub struct HistoricalAnalysisBuilder {
    config: EngineConfig,
}

impl HistoricalAnalysisBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs the annual and both interim evaluations, rolls them up to LTM and aligns the result
    /// to the canonical schema. On a fatal error the lineage committed so far is returned
    /// inside the failure.
    pub fn build(&self, request: &BuildRequest) -> std::result::Result<BuildOutput, BuildFailure> {
        info!("Building historical analysis for {}", request.ticker);

        let mut lineage = LineageLog::new(request.ticker.clone(), request.run_timestamp)
            .with_file_prefix(self.config.lineage_file_prefix.clone());

        match self.build_into(request, &mut lineage) {
            Ok(table) => {
                info!(
                    "Built {} rows x {} columns for {} ({} lineage records)",
                    table.rows.len(),
                    table.columns.len(),
                    request.ticker,
                    lineage.len()
                );
                Ok(BuildOutput {
                    ticker: request.ticker.clone(),
                    table,
                    lineage,
                })
            }
            Err(source) => {
                warn!("Build failed for {}: {}", request.ticker, source);
                Err(BuildFailure {
                    ticker: request.ticker.clone(),
                    source,
                    lineage,
                })
            }
        }
    }

    fn build_into(&self, request: &BuildRequest, lineage: &mut LineageLog) -> Result<MetricTable> {
        self.config.validate()?;
        validate_filings(&request.annual_store, &request.ytd_current, &request.ytd_prior)?;
        let stores = ConfiguredStores::new(
            &self.config,
            &request.annual_store,
            &request.ytd_current,
            &request.ytd_prior,
        );

        let annual_periods: Vec<Period> = self
            .config
            .fiscal_years
            .iter()
            .map(|y| Period::FiscalYear(*y))
            .collect();
        debug!(
            "Annual periods: {:?}; interim periods: {} and {}",
            self.config.fiscal_years,
            request.ytd_prior.period_end,
            request.ytd_current.period_end
        );

        let annual = MetricEngine::new(&self.config, &request.annual_definitions).run(
            &stores.annual,
            &annual_periods,
            lineage,
        )?;

        let interim = MetricEngine::new(&self.config, &request.interim_definitions);
        let ytd_current = interim.run(&stores.current, &[request.ytd_current.period()], lineage)?;
        let ytd_prior = interim.run(&stores.prior, &[request.ytd_prior.period()], lineage)?;

        let inputs = RollupInputs {
            annual: &annual,
            ytd_current: &ytd_current,
            ytd_prior: &ytd_prior,
            annual_store: &stores.annual,
            current_store: &stores.current,
            prior_store: &stores.prior,
        };
        let rolled = TemporalRollup::new(&self.config).rollup(&inputs, lineage)?;

        let rows = SchemaAligner::align(&request.canonical_schema.metric_names, rolled.rows);
        Ok(MetricTable::new(rolled.columns, rows))
    }
}

pub fn build_historical_analysis(
    config: &EngineConfig,
    request: &BuildRequest,
) -> std::result::Result<BuildOutput, BuildFailure> {
    HistoricalAnalysisBuilder::new(config.clone()).build(request)
}

/// The request's stores, consulting the active configuration's alias table on every lookup.
pub(crate) struct ConfiguredStores {
    pub annual: TimeIndexedStore,
    pub current: TimeIndexedStore,
    pub prior: TimeIndexedStore,
}

impl ConfiguredStores {
    pub(crate) fn new(
        config: &EngineConfig,
        annual: &TimeIndexedStore,
        ytd_current: &InterimFiling,
        ytd_prior: &InterimFiling,
    ) -> Self {
        let aliases = AliasTable::from(config);
        Self {
            annual: annual.clone().with_aliases(aliases.clone()),
            current: ytd_current.store.clone().with_aliases(aliases.clone()),
            prior: ytd_prior.store.clone().with_aliases(aliases),
        }
    }
}

pub(crate) fn validate_filings(
    annual_store: &TimeIndexedStore,
    ytd_current: &InterimFiling,
    ytd_prior: &InterimFiling,
) -> Result<()> {
    if annual_store.filing() != FilingType::Annual {
        return Err(MetricEngineError::Config(format!(
            "annual store holds {} data",
            annual_store.filing()
        )));
    }
    for interim in [ytd_current, ytd_prior] {
        if interim.store.filing() != FilingType::Interim {
            return Err(MetricEngineError::Config(format!(
                "interim store for {} holds {} data",
                interim.period_end,
                interim.store.filing()
            )));
        }
    }

    annual_store.require_complete()?;
    ytd_current.store.require_complete()?;
    ytd_prior.store.require_complete()?;

    let (current, prior) = (ytd_current.period_end, ytd_prior.period_end);
    if prior >= current {
        return Err(MetricEngineError::InvalidPeriod(format!(
            "prior year-to-date period {} must precede {}",
            prior, current
        )));
    }
    if prior.year() == current.year() {
        return Err(MetricEngineError::InvalidPeriod(format!(
            "year-to-date periods {} and {} fall in the same year",
            prior, current
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn complete(filing: FilingType, income: StatementTable) -> TimeIndexedStore {
        TimeIndexedStore::new(filing)
            .with_table(StatementKind::Income, income)
            .with_table(StatementKind::Balance, StatementTable::new())
            .with_table(StatementKind::CashFlow, StatementTable::new())
    }

    fn request() -> BuildRequest {
        let annual = StatementTable::new()
            .with_value("Revenues", PeriodKey::Year(2024), 400.0)
            .with_value("Revenues", PeriodKey::Year(2023), 320.0);
        let current = StatementTable::new().with_value("Revenues", PeriodKey::Date(date(2025, 3, 31)), 110.0);
        let prior = StatementTable::new().with_value("Revenues", PeriodKey::Date(date(2024, 3, 31)), 90.0);

        let definitions = vec![
            MetricDefinition::pass_through("Revenue", "Revenues"),
            MetricDefinition::new("% YoY Growth", MetricKind::YoYGrowth).with_dependencies(["Revenue"]),
        ];

        BuildRequest {
            ticker: "ELME".to_string(),
            run_timestamp: date(2025, 5, 1).and_hms_opt(8, 0, 0).unwrap(),
            canonical_schema: CanonicalSchema::new(["Revenue", "% YoY Growth", "Rent"]),
            annual_definitions: definitions.clone(),
            interim_definitions: definitions,
            annual_store: complete(FilingType::Annual, annual),
            ytd_current: InterimFiling::new(complete(FilingType::Interim, current), date(2025, 3, 31)),
            ytd_prior: InterimFiling::new(complete(FilingType::Interim, prior), date(2024, 3, 31)),
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            fiscal_years: vec![2024, 2023],
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_end_to_end_build() {
        let output = build_historical_analysis(&config(), &request()).unwrap();
        let table = &output.table;

        assert_eq!(
            table.column_labels(),
            vec!["2024", "2023", "YTD 2024", "YTD 2025", "LTM 2025"]
        );
        let names: Vec<&str> = table.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Revenue", "% YoY Growth", "Rent"]);

        let ltm = Period::TrailingTwelveMonths(date(2025, 3, 31));
        assert_eq!(table.value("Revenue", &ltm), Some(420.0));
        let growth = table.value("% YoY Growth", &Period::FiscalYear(2024)).unwrap();
        assert!((growth - 25.0).abs() < 1e-9);
        assert_eq!(table.value("Rent", &Period::FiscalYear(2024)), None);

        assert_eq!(output.lineage.file_name(), "HFA_ELME_20250501_080000.json");
        assert!(output.lineage.metrics["Revenue"].contains_key("LTM 2025"));
    }

    #[test]
    fn test_missing_statement_table_is_fatal() {
        let mut req = request();
        req.ytd_prior.store = TimeIndexedStore::interim();
        let failure = build_historical_analysis(&config(), &req).unwrap_err();
        assert!(matches!(
            failure.source,
            MetricEngineError::MissingStatementTable { .. }
        ));
        assert_eq!(failure.ticker, "ELME");
    }

    #[test]
    fn test_config_aliases_reach_the_stores() {
        let mut aliased = config();
        aliased
            .account_aliases
            .insert("SalesRevenueNet".to_string(), vec!["Revenues".to_string()]);

        let mut req = request();
        req.annual_definitions = vec![MetricDefinition::pass_through("Revenue", "SalesRevenueNet")];
        req.interim_definitions = req.annual_definitions.clone();
        req.annual_store = req.annual_store.with_aliases(AliasTable::empty());

        let output = build_historical_analysis(&aliased, &req).unwrap();
        assert_eq!(output.table.value("Revenue", &Period::FiscalYear(2024)), Some(400.0));
        let ltm = Period::TrailingTwelveMonths(date(2025, 3, 31));
        assert_eq!(output.table.value("Revenue", &ltm), Some(420.0));

        let without = build_historical_analysis(&config(), &req).unwrap();
        assert_eq!(without.table.value("Revenue", &Period::FiscalYear(2024)), None);
    }

    #[test]
    fn test_interim_dates_must_be_ordered() {
        let mut req = request();
        std::mem::swap(&mut req.ytd_current, &mut req.ytd_prior);
        let failure = build_historical_analysis(&config(), &req).unwrap_err();
        assert!(matches!(failure.source, MetricEngineError::InvalidPeriod(_)));
    }
}
