use crate::error::{MetricEngineError, Result};
use crate::formatting::format_value;
use crate::schema::{DisplayFormat, FilingType, Period, StatementKind};
use crate::utils::format_run_timestamp;
use chrono::NaiveDateTime;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Account tag actually matched (after alias expansion)
    pub row: String,
    /// Raw column key: `2024` or `2025-03-31`
    pub column: String,
}

/// Where one consumed value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub value: f64,
    pub filing_type: FilingType,
    pub table: StatementKind,
    pub period: String,
    pub location: SourceLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
}

impl SourceRef {
    pub fn account_id(&self) -> &str {
        &self.location.row
    }
}

/// An intermediate derivation: the formula as evaluated, its operand values, and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationStep {
    pub formula: String,
    pub inputs: BTreeMap<String, Option<f64>>,
    pub result: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub value: Option<f64>,
    #[serde(alias = "final_value")]
    pub formatted_value: Option<String>,
    pub calculation: String,
    pub sources: BTreeMap<String, SourceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<CalculationStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Identity of one metric-definition occurrence. The same display name may be declared more
/// than once; each occurrence gets its own lineage entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub occurrence: usize,
}

impl MetricKey {
    pub fn new(name: impl Into<String>, occurrence: usize) -> Self {
        Self {
            name: name.into(),
            occurrence,
        }
    }

    pub fn first(name: impl Into<String>) -> Self {
        Self::new(name, 0)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.occurrence == 0 {
            f.write_str(&self.name)
        } else {
            write!(f, "{} #{}", self.name, self.occurrence + 1)
        }
    }
}

/// A lineage record under construction for one metric/period cell.
#[derive(Debug, Clone, Default)]
pub struct LineageDraft {
    calculation: String,
    sources: BTreeMap<String, SourceRef>,
    steps: Vec<CalculationStep>,
    notes: Vec<String>,
}

impl LineageDraft {
    pub fn new(calculation: impl Into<String>) -> Self {
        Self {
            calculation: calculation.into(),
            ..Self::default()
        }
    }

    pub fn set_calculation(&mut self, calculation: impl Into<String>) {
        self.calculation = calculation.into();
    }

    pub fn calculation(&self) -> &str {
        &self.calculation
    }

    /// Records a raw source under `token`. An identical reference under the same token is kept
    /// once; a conflicting one is stored as `token #2`, `token #3`, ...
    pub fn add_source(&mut self, token: impl Into<String>, source: SourceRef) {
        let token = token.into();
        match self.sources.get(&token) {
            None => {
                self.sources.insert(token, source);
            }
            Some(existing) if *existing == source => {}
            Some(_) => {
                let mut n = 2;
                loop {
                    let key = format!("{} #{}", token, n);
                    match self.sources.get(&key) {
                        None => {
                            self.sources.insert(key, source);
                            return;
                        }
                        Some(existing) if *existing == source => return,
                        Some(_) => n += 1,
                    }
                }
            }
        }
    }

    /// Pulls in the already-recorded sources of a dependency. Sources from a different period
    /// are qualified as `token[period label]`.
    pub fn absorb(&mut self, sources: &BTreeMap<String, SourceRef>, period: Option<&Period>) {
        for (token, source) in sources {
            let key = match period {
                Some(p) => format!("{}[{}]", token, p.label()),
                None => token.clone(),
            };
            self.add_source(key, source.clone());
        }
    }

    pub fn add_step(
        &mut self,
        formula: impl Into<String>,
        inputs: BTreeMap<String, Option<f64>>,
        result: Option<f64>,
        note: Option<String>,
    ) {
        self.steps.push(CalculationStep {
            formula: formula.into(),
            inputs,
            result,
            note,
        });
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn sources(&self) -> &BTreeMap<String, SourceRef> {
        &self.sources
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

/// Append-only provenance for one build, keyed externally by ticker and run timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageLog {
    pub ticker: String,
    pub timestamp: String,
    #[serde(skip)]
    file_prefix: String,
    pub metrics: BTreeMap<String, BTreeMap<String, LineageRecord>>,
}

impl LineageLog {
    pub fn new(ticker: impl Into<String>, run_timestamp: NaiveDateTime) -> Self {
        Self {
            ticker: ticker.into(),
            timestamp: format_run_timestamp(run_timestamp),
            file_prefix: "HFA".to_string(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Finalizes a metric/period cell. A cell can be committed exactly once.
    pub fn commit(
        &mut self,
        key: &MetricKey,
        period: &Period,
        draft: LineageDraft,
        value: Option<f64>,
        display: DisplayFormat,
    ) -> Result<()> {
        let label = period.label();
        let periods = self.metrics.entry(key.to_string()).or_default();
        if periods.contains_key(&label) {
            return Err(MetricEngineError::LineageAlreadyCommitted {
                metric: key.to_string(),
                period: label,
            });
        }

        debug!("lineage {} [{}] = {:?}", key, label, value);
        periods.insert(
            label,
            LineageRecord {
                value,
                formatted_value: format_value(value, display),
                calculation: draft.calculation,
                sources: draft.sources,
                steps: draft.steps,
                notes: draft.notes,
            },
        );
        Ok(())
    }

    pub fn record(&self, key: &MetricKey, period: &Period) -> Option<&LineageRecord> {
        self.metrics.get(&key.to_string())?.get(&period.label())
    }

    pub fn sources_for(&self, key: &MetricKey, period: &Period) -> Option<&BTreeMap<String, SourceRef>> {
        self.record(key, period).map(|r| &r.sources)
    }

    pub fn len(&self) -> usize {
        self.metrics.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn file_name(&self) -> String {
        let prefix = if self.file_prefix.is_empty() {
            "HFA"
        } else {
            self.file_prefix.as_str()
        };
        format!("{}_{}_{}.json", prefix, self.ticker, self.timestamp)
    }

    /// Persists the log as a new file in `dir`. Existing logs are never overwritten.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = dir.as_ref().join(self.file_name());
        let json = self.to_json()?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(json.as_bytes())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn source(account: &str, value: f64, year: i32) -> SourceRef {
        SourceRef {
            value,
            filing_type: FilingType::Annual,
            table: StatementKind::Income,
            period: year.to_string(),
            location: SourceLocation {
                row: account.to_string(),
                column: year.to_string(),
            },
            caveat: None,
        }
    }

    fn run_timestamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    #[test]
    fn test_metric_key_display() {
        assert_eq!(MetricKey::first("Revenue").to_string(), "Revenue");
        assert_eq!(MetricKey::new("% Margin", 1).to_string(), "% Margin #2");
    }

    #[test]
    fn test_conflicting_sources_are_suffixed() {
        let mut draft = LineageDraft::new("Revenues");
        draft.add_source("Revenues", source("Revenues", 100.0, 2023));
        draft.add_source("Revenues", source("Revenues", 100.0, 2023));
        draft.add_source("Revenues", source("Revenues", 120.0, 2024));
        assert_eq!(draft.sources().len(), 2);
        assert!(draft.sources().contains_key("Revenues #2"));
    }

    #[test]
    fn test_absorb_qualifies_other_periods() {
        let mut upstream = BTreeMap::new();
        upstream.insert("Revenues".to_string(), source("Revenues", 100.0, 2023));

        let mut draft = LineageDraft::new("growth");
        draft.absorb(&upstream, Some(&Period::FiscalYear(2023)));
        draft.absorb(&upstream, None);
        assert!(draft.sources().contains_key("Revenues[2023]"));
        assert!(draft.sources().contains_key("Revenues"));
    }

    #[test]
    fn test_commit_once() {
        let mut log = LineageLog::new("ELME", run_timestamp());
        let key = MetricKey::first("Revenue");
        let period = Period::FiscalYear(2024);

        log.commit(&key, &period, LineageDraft::new("Revenues"), Some(120_000.0), DisplayFormat::Thousands)
            .unwrap();
        let record = log.record(&key, &period).unwrap();
        assert_eq!(record.formatted_value.as_deref(), Some("120"));

        let err = log
            .commit(&key, &period, LineageDraft::new("Revenues"), Some(1.0), DisplayFormat::Thousands)
            .unwrap_err();
        assert!(matches!(err, MetricEngineError::LineageAlreadyCommitted { .. }));
        assert_eq!(log.record(&key, &period).unwrap().value, Some(120_000.0));
    }

    #[test]
    fn test_serialized_tree_shape() {
        let mut log = LineageLog::new("ELME", run_timestamp());
        let mut draft = LineageDraft::new("Revenues");
        draft.add_source("Revenues", source("Revenues", 120.0, 2024));
        log.commit(
            &MetricKey::first("Revenue"),
            &Period::FiscalYear(2024),
            draft,
            Some(120.0),
            DisplayFormat::Thousands,
        )
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&log.to_json().unwrap()).unwrap();
        assert_eq!(value["ticker"], "ELME");
        assert_eq!(value["timestamp"], "20250314_093000");
        let record = &value["metrics"]["Revenue"]["2024"];
        assert_eq!(record["calculation"], "Revenues");
        assert_eq!(record["sources"]["Revenues"]["filing_type"], "10-K");
        assert_eq!(record["sources"]["Revenues"]["table"], "income");
        assert_eq!(record["sources"]["Revenues"]["location"]["row"], "Revenues");
        assert!(record.get("steps").is_none());
    }

    #[test]
    fn test_file_name() {
        let log = LineageLog::new("ELME", run_timestamp());
        assert_eq!(log.file_name(), "HFA_ELME_20250314_093000.json");
        let log = log.with_file_prefix("CAP");
        assert_eq!(log.file_name(), "CAP_ELME_20250314_093000.json");
    }
}
