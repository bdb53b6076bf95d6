use crate::schema::Period;
use crate::table::ComputedMetricRow;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Reorders computed rows to a canonical list of display names.
pub struct SchemaAligner;

impl SchemaAligner {
    /// Each canonical name consumes the next unconsumed row with that name, in declaration
    /// order. Names with no row left get an all-null row spanning every period seen. Repeated
    /// names are never merged.
    pub fn align(canonical_names: &[String], rows: Vec<ComputedMetricRow>) -> Vec<ComputedMetricRow> {
        let periods: Vec<Period> = rows
            .iter()
            .flat_map(|r| r.values.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut by_name: BTreeMap<String, VecDeque<ComputedMetricRow>> = BTreeMap::new();
        for row in rows {
            by_name.entry(row.name.clone()).or_default().push_back(row);
        }

        let mut aligned = Vec::with_capacity(canonical_names.len());
        for name in canonical_names {
            match by_name.get_mut(name).and_then(VecDeque::pop_front) {
                Some(row) => aligned.push(row),
                None => {
                    debug!("No computed row left for '{}'; emitting nulls", name);
                    aligned.push(ComputedMetricRow::empty(name.clone(), &periods));
                }
            }
        }

        for (name, leftover) in &by_name {
            if !leftover.is_empty() {
                warn!(
                    "{} computed row(s) named '{}' are not in the canonical schema",
                    leftover.len(),
                    name
                );
            }
        }

        aligned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn row(name: &str, value: f64) -> ComputedMetricRow {
        ComputedMetricRow::new(name).with_value(Period::FiscalYear(2024), Some(value))
    }

    #[test]
    fn test_duplicates_consumed_in_order() {
        let rows = vec![row("A", 1.0), row("A", 2.0), row("B", 3.0)];
        let aligned = SchemaAligner::align(&names(&["A", "B", "A"]), rows);

        let values: Vec<Option<f64>> = aligned
            .iter()
            .map(|r| r.get(&Period::FiscalYear(2024)))
            .collect();
        assert_eq!(values, vec![Some(1.0), Some(3.0), Some(2.0)]);
        assert_eq!(aligned[2].name, "A");
    }

    #[test]
    fn test_missing_names_backfilled_with_nulls() {
        let rows = vec![row("A", 1.0)];
        let aligned = SchemaAligner::align(&names(&["A", "A", "C"]), rows);

        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned[1].name, "A");
        assert_eq!(aligned[1].values.get(&Period::FiscalYear(2024)), Some(&None));
        assert_eq!(aligned[2].name, "C");
        assert_eq!(aligned[2].get(&Period::FiscalYear(2024)), None);
    }

    #[test]
    fn test_unlisted_rows_dropped() {
        let rows = vec![row("A", 1.0), row("Z", 9.0)];
        let aligned = SchemaAligner::align(&names(&["A"]), rows);
        assert_eq!(aligned.len(), 1);
    }
}
