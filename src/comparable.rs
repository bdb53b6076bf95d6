//! Comparable-company metrics: one value per metric per ticker, either over the trailing
//! twelve months or averaged across the latest fiscal years.

use crate::config::EngineConfig;
use crate::error::{BuildFailure, MetricEngineError, Result};
use crate::expression::Formula;
use crate::lineage::{LineageDraft, LineageLog, MetricKey};
use crate::ltm::{LtmResolver, Reading};
use crate::rollup::RollupPeriods;
use crate::schema::{DisplayFormat, MappingItem, Period};
use crate::store::TimeIndexedStore;
use crate::{validate_filings, ConfiguredStores, InterimFiling};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ComparableWindow {
    #[schemars(description = "Formula evaluated once with every token read as its trailing value")]
    Trailing,

    #[schemars(description = "Formula evaluated per fiscal year, then averaged over the years with a value")]
    FiscalAverage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ComparableMetric {
    pub name: String,
    pub formula: String,
    pub window: ComparableWindow,
    pub display: DisplayFormat,
}

impl ComparableMetric {
    pub fn trailing(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            window: ComparableWindow::Trailing,
            display: DisplayFormat::Thousands,
        }
    }

    pub fn fiscal_average(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            window: ComparableWindow::FiscalAverage,
            ..Self::trailing(name, formula)
        }
    }

    pub fn with_display(mut self, display: DisplayFormat) -> Self {
        self.display = display;
        self
    }

    /// An empty calculation falls back to the first statement key.
    pub fn from_mapping_item(item: &MappingItem, config: &EngineConfig) -> Self {
        let name = item.metric.as_str();
        let rules = &config.kind_rules;
        let formula = match item.calculation.trim() {
            "" => item
                .financial_statement_keys
                .first()
                .map(|k| k.rsplit('.').next().unwrap_or(k).to_string())
                .unwrap_or_else(|| "Not available".to_string()),
            text => text.to_string(),
        };

        let display = if name.ends_with('%') || rules.percentage_display.iter().any(|n| n == name) {
            DisplayFormat::Percentage
        } else if formula.contains('/') || rules.multiple_display.iter().any(|n| n == name) {
            DisplayFormat::Multiple
        } else {
            DisplayFormat::Thousands
        };

        let metric = if name.starts_with(config.average_prefix.as_str()) {
            Self::fiscal_average(name, formula)
        } else {
            Self::trailing(name, formula)
        };
        metric.with_display(display)
    }
}

#[derive(Debug, Clone)]
pub struct ComparableRequest {
    pub ticker: String,
    pub run_timestamp: NaiveDateTime,
    pub metrics: Vec<ComparableMetric>,
    pub annual_store: TimeIndexedStore,
    pub ytd_current: InterimFiling,
    pub ytd_prior: InterimFiling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparableValue {
    pub key: MetricKey,
    pub period: Period,
    pub value: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ComparableOutput {
    pub ticker: String,
    pub values: Vec<ComparableValue>,
    pub lineage: LineageLog,
}

impl ComparableOutput {
    /// Value of the first metric called `name`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|v| v.key.name == name)?.value
    }

    pub fn write_lineage(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        self.lineage.write_to_dir(dir)
    }
}

pub struct ComparableAnalysisBuilder {
    config: EngineConfig,
}

impl ComparableAnalysisBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn build(
        &self,
        request: &ComparableRequest,
    ) -> std::result::Result<ComparableOutput, BuildFailure> {
        info!("Building comparable metrics for {}", request.ticker);

        let mut lineage = LineageLog::new(request.ticker.clone(), request.run_timestamp)
            .with_file_prefix(self.config.comparable_file_prefix.clone());

        match self.build_into(request, &mut lineage) {
            Ok(values) => {
                info!(
                    "Built {} comparable metrics for {}",
                    values.len(),
                    request.ticker
                );
                Ok(ComparableOutput {
                    ticker: request.ticker.clone(),
                    values,
                    lineage,
                })
            }
            Err(source) => {
                warn!("Comparable build failed for {}: {}", request.ticker, source);
                Err(BuildFailure {
                    ticker: request.ticker.clone(),
                    source,
                    lineage,
                })
            }
        }
    }

    fn build_into(
        &self,
        request: &ComparableRequest,
        lineage: &mut LineageLog,
    ) -> Result<Vec<ComparableValue>> {
        self.config.validate()?;
        validate_filings(&request.annual_store, &request.ytd_current, &request.ytd_prior)?;
        let stores = ConfiguredStores::new(
            &self.config,
            &request.annual_store,
            &request.ytd_current,
            &request.ytd_prior,
        );

        let year = self.config.latest_fiscal_year().ok_or_else(|| {
            MetricEngineError::Config("no fiscal year to anchor the trailing period".to_string())
        })?;
        let periods = RollupPeriods {
            fiscal_year: Period::FiscalYear(year),
            ytd_current: request.ytd_current.period(),
            ytd_prior: request.ytd_prior.period(),
            ltm: Period::TrailingTwelveMonths(request.ytd_current.period_end),
        };
        let resolver = LtmResolver::new(
            &self.config,
            &stores.annual,
            &stores.current,
            &stores.prior,
            periods,
        );

        let years = self.config.average_window();
        let average = match (years.last(), years.first()) {
            (Some(first), Some(last)) => Period::FiscalAverage {
                first: *first,
                last: *last,
            },
            _ => {
                return Err(MetricEngineError::Config(
                    "no fiscal years to average over".to_string(),
                ))
            }
        };

        let mut values: Vec<ComparableValue> = Vec::with_capacity(request.metrics.len());
        let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();

        for metric in &request.metrics {
            let seen = occurrences.entry(metric.name.as_str()).or_insert(0);
            let key = MetricKey::new(metric.name.clone(), *seen);
            *seen += 1;

            let mut draft = LineageDraft::default();
            let (period, value) = match metric.window {
                ComparableWindow::Trailing => (
                    periods.ltm,
                    self.trailing(metric, &values, &resolver, lineage, &mut draft)?,
                ),
                ComparableWindow::FiscalAverage => (
                    average,
                    self.fiscal_average(metric, &years, &resolver, &mut draft)?,
                ),
            };

            debug!("{} [{}] = {:?}", key, period, value);
            lineage.commit(&key, &period, draft, value, metric.display)?;
            values.push(ComparableValue { key, period, value });
        }

        Ok(values)
    }

    fn parse(&self, metric: &ComparableMetric, draft: &mut LineageDraft) -> Option<Formula> {
        let text = metric.formula.as_str();
        if text.contains("Not available") {
            draft.set_calculation("Not available");
            return None;
        }
        draft.set_calculation(text);
        match Formula::parse(text) {
            Ok(formula) => Some(formula),
            Err(e) => {
                warn!("Skipping formula for '{}': {}", metric.name, e);
                draft.note(format!("formula rejected: {}", e));
                None
            }
        }
    }

    /// Tokens naming an earlier trailing metric bind its value; all others are read as
    /// trailing account values.
    fn trailing(
        &self,
        metric: &ComparableMetric,
        earlier: &[ComparableValue],
        resolver: &LtmResolver<'_>,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let Some(formula) = self.parse(metric, draft) else {
            return Ok(None);
        };
        let ltm = resolver.periods().ltm;

        let mut bindings = BTreeMap::new();
        let mut inputs = BTreeMap::new();
        for token in formula.tokens() {
            let prior = earlier
                .iter()
                .rev()
                .find(|v| &v.key.name == token && v.period == ltm && token != &metric.name);
            let value = match prior {
                Some(found) => {
                    if let Some(sources) = lineage.sources_for(&found.key, &found.period) {
                        draft.absorb(sources, None);
                    }
                    found.value
                }
                None => resolver.token(token, Reading::Trailing, draft),
            };
            if value.is_none() {
                draft.note(format!("{} missing for {}; treated as 0", token, ltm));
            }
            bindings.insert(token.clone(), value.unwrap_or(0.0));
            inputs.insert(token.clone(), value);
        }

        for dated in formula.dated_tokens() {
            let name = dated.binding_name();
            let value = resolver.dated(dated, draft);
            if value.is_none() {
                draft.note(format!("{} missing; treated as 0", name));
            }
            bindings.insert(name.clone(), value.unwrap_or(0.0));
            inputs.insert(name, value);
        }

        let value = formula.evaluate(&bindings)?;
        let note = value
            .is_none()
            .then(|| "division by zero or non-finite result".to_string());
        draft.add_step(formula.text(), inputs, value, note);
        Ok(value)
    }

    /// Mean of the per-year values that exist. Years whose formula has no value are skipped.
    fn fiscal_average(
        &self,
        metric: &ComparableMetric,
        years: &[i32],
        resolver: &LtmResolver<'_>,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let Some(formula) = self.parse(metric, draft) else {
            return Ok(None);
        };

        let mut per_year = BTreeMap::new();
        for &year in years {
            let mut bindings = BTreeMap::new();
            let mut inputs = BTreeMap::new();
            for token in formula.tokens() {
                let value = resolver.token(token, Reading::FiscalYear(year), draft);
                bindings.insert(token.clone(), value.unwrap_or(0.0));
                inputs.insert(format!("{}[{}]", token, year), value);
            }
            for dated in formula.dated_tokens() {
                let name = dated.binding_name();
                let value = resolver.dated(dated, draft);
                bindings.insert(name.clone(), value.unwrap_or(0.0));
                inputs.insert(name, value);
            }

            let value = formula.evaluate(&bindings)?;
            if value.is_none() {
                draft.note(format!("{} has no value for {}; left out of the average", metric.name, year));
            }
            draft.add_step(format!("{} [{}]", formula.text(), year), inputs, value, None);
            per_year.insert(year.to_string(), value);
        }

        let present: Vec<f64> = per_year.values().flatten().copied().collect();
        let value = (!present.is_empty()).then(|| present.iter().sum::<f64>() / present.len() as f64);
        draft.add_step(
            format!("Average of {} years", present.len()),
            per_year,
            value,
            None,
        );
        Ok(value)
    }
}

pub fn build_comparable_analysis(
    config: &EngineConfig,
    request: &ComparableRequest,
) -> std::result::Result<ComparableOutput, BuildFailure> {
    ComparableAnalysisBuilder::new(config.clone()).build(request)
}

/// One row per ticker, one column per metric name.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparableTable {
    pub metric_names: Vec<String>,
    pub rows: Vec<(String, Vec<Option<f64>>)>,
}

impl ComparableTable {
    /// Columns follow the first output's metric order; names only later outputs carry are
    /// appended.
    pub fn from_outputs(outputs: &[ComparableOutput]) -> Self {
        let mut metric_names: Vec<String> = Vec::new();
        for output in outputs {
            for v in &output.values {
                if !metric_names.contains(&v.key.name) {
                    metric_names.push(v.key.name.clone());
                }
            }
        }

        let rows = outputs
            .iter()
            .map(|output| {
                let values = metric_names.iter().map(|name| output.value(name)).collect();
                (output.ticker.clone(), values)
            })
            .collect();

        Self { metric_names, rows }
    }

    pub fn value(&self, ticker: &str, metric: &str) -> Option<f64> {
        let column = self.metric_names.iter().position(|n| n == metric)?;
        let (_, values) = self.rows.iter().find(|(t, _)| t == ticker)?;
        values.get(column).copied().flatten()
    }

    /// `Ticker,<metric names>` header; null cells are written empty.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec!["Ticker".to_string()];
        header.extend(self.metric_names.iter().cloned());
        writer.write_record(&header)?;

        for (ticker, values) in &self.rows {
            let mut record = vec![ticker.clone()];
            record.extend(
                values
                    .iter()
                    .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
