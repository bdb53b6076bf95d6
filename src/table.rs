use crate::error::Result;
use crate::schema::Period;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One row per metric-definition occurrence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputedMetricRow {
    pub name: String,
    pub values: BTreeMap<Period, Option<f64>>,
}

impl ComputedMetricRow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    /// A row with every listed period present and null.
    pub fn empty(name: impl Into<String>, periods: &[Period]) -> Self {
        let mut row = Self::new(name);
        for period in periods {
            row.values.insert(*period, None);
        }
        row
    }

    pub fn with_value(mut self, period: Period, value: Option<f64>) -> Self {
        self.values.insert(period, value);
        self
    }

    pub fn get(&self, period: &Period) -> Option<f64> {
        self.values.get(period).copied().flatten()
    }

    pub fn set(&mut self, period: Period, value: Option<f64>) {
        self.values.insert(period, value);
    }
}

/// The finished, schema-ordered output of a build.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    pub columns: Vec<Period>,
    pub rows: Vec<ComputedMetricRow>,
}

impl MetricTable {
    pub fn new(columns: Vec<Period>, rows: Vec<ComputedMetricRow>) -> Self {
        Self { columns, rows }
    }

    pub fn column_labels(&self) -> Vec<String> {
        self.columns.iter().map(Period::label).collect()
    }

    /// Value of the first row called `name`.
    pub fn value(&self, name: &str, period: &Period) -> Option<f64> {
        self.rows.iter().find(|r| r.name == name)?.get(period)
    }

    pub fn rows_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ComputedMetricRow> {
        self.rows.iter().filter(move |r| r.name == name)
    }

    /// `Metric,<labels>` header; null cells are written empty.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec!["Metric".to_string()];
        header.extend(self.column_labels());
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![row.name.clone()];
            record.extend(self.columns.iter().map(|period| {
                row.get(period).map(|v| v.to_string()).unwrap_or_default()
            }));
            writer.write_record(&record)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Array of `{"Metric": name, "<label>": value|null, ...}` objects.
    pub fn to_json_value(&self) -> Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut object = Map::new();
                object.insert("Metric".to_string(), Value::String(row.name.clone()));
                for period in &self.columns {
                    let cell = row
                        .get(period)
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null);
                    object.insert(period.label(), cell);
                }
                Value::Object(object)
            })
            .collect();
        Value::Array(rows)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_json_value())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn table() -> MetricTable {
        let ytd = Period::YearToDate(NaiveDate::from_ymd_opt(2025, 3, 31).unwrap());
        let columns = vec![Period::FiscalYear(2024), ytd];
        let rows = vec![
            ComputedMetricRow::new("Revenue")
                .with_value(Period::FiscalYear(2024), Some(120.0))
                .with_value(ytd, Some(30.5)),
            ComputedMetricRow::empty("% Margin", &columns),
        ];
        MetricTable::new(columns, rows)
    }

    #[test]
    fn test_csv_output() {
        let csv = table().to_csv().unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Metric,2024,YTD 2025");
        assert_eq!(lines[1], "Revenue,120,30.5");
        assert_eq!(lines[2], "% Margin,,");
    }

    #[test]
    fn test_json_output() {
        let value = table().to_json_value();
        assert_eq!(value[0]["Metric"], "Revenue");
        assert_eq!(value[0]["2024"], 120.0);
        assert!(value[1]["YTD 2025"].is_null());
    }

    #[test]
    fn test_value_lookup() {
        let table = table();
        assert_eq!(table.value("Revenue", &Period::FiscalYear(2024)), Some(120.0));
        assert_eq!(table.value("% Margin", &Period::FiscalYear(2024)), None);
        assert_eq!(table.rows_named("Revenue").count(), 1);
    }
}
