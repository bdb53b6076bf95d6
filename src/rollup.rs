use crate::config::EngineConfig;
use crate::engine::{divide, record_ratio_step, EngineRun, RunEntry};
use crate::error::{MetricEngineError, Result};
use crate::expression::Formula;
use crate::lineage::{LineageDraft, LineageLog, MetricKey};
use crate::ltm::{LtmResolver, Reading};
use crate::schema::{DisplayFormat, MetricDefinition, MetricKind, Period};
use crate::store::TimeIndexedStore;
use crate::table::{ComputedMetricRow, MetricTable};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// Completed runs (and their stores) for the latest fiscal year and both interim periods.
pub struct RollupInputs<'r> {
    pub annual: &'r EngineRun,
    pub ytd_current: &'r EngineRun,
    pub ytd_prior: &'r EngineRun,
    pub annual_store: &'r TimeIndexedStore,
    pub current_store: &'r TimeIndexedStore,
    pub prior_store: &'r TimeIndexedStore,
}

/// The trailing-twelve-month period anchors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollupPeriods {
    pub fiscal_year: Period,
    pub ytd_current: Period,
    pub ytd_prior: Period,
    pub ltm: Period,
}

struct Combined<'r> {
    key: MetricKey,
    definition: &'r MetricDefinition,
    annual: Option<&'r RunEntry>,
    current: Option<&'r RunEntry>,
    prior: Option<&'r RunEntry>,
}

fn value_of(entry: Option<&RunEntry>, period: &Period) -> Option<f64> {
    entry.and_then(|e| e.value(period))
}

/// The entry named `name` declared closest before `index`.
fn nearest_earlier(combined: &[Combined<'_>], index: usize, name: &str) -> Option<usize> {
    combined[..index].iter().rposition(|c| c.key.name == name)
}

fn year_to_date(run: &EngineRun) -> Result<Period> {
    run.periods()
        .iter()
        .copied()
        .find(|p| matches!(p, Period::YearToDate(_)))
        .ok_or_else(|| {
            MetricEngineError::InvalidPeriod(format!(
                "{} run has no year-to-date period",
                run.filing()
            ))
        })
}

/// Derives the LTM column from one annual run and two interim runs.
pub struct TemporalRollup<'a> {
    config: &'a EngineConfig,
}

impl<'a> TemporalRollup<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn periods(&self, inputs: &RollupInputs<'_>) -> Result<RollupPeriods> {
        let year = self.config.latest_fiscal_year().ok_or_else(|| {
            MetricEngineError::Config("no fiscal year to anchor the trailing period".to_string())
        })?;
        let ytd_current = year_to_date(inputs.ytd_current)?;
        let ytd_prior = year_to_date(inputs.ytd_prior)?;
        let Period::YearToDate(end) = ytd_current else {
            return Err(MetricEngineError::InvalidPeriod(ytd_current.to_string()));
        };

        Ok(RollupPeriods {
            fiscal_year: Period::FiscalYear(year),
            ytd_current,
            ytd_prior,
            ltm: Period::TrailingTwelveMonths(end),
        })
    }

    /// Rows carry every annual period, both YTD periods and LTM. Annual rows come first in
    /// declaration order; metrics only present in the interim runs are appended after them.
    pub fn rollup(&self, inputs: &RollupInputs<'_>, lineage: &mut LineageLog) -> Result<MetricTable> {
        let periods = self.periods(inputs)?;
        let combined = combine(inputs);
        let resolver = LtmResolver::new(
            self.config,
            inputs.annual_store,
            inputs.current_store,
            inputs.prior_store,
            periods,
        );
        info!(
            "Rolling up {} metrics to {}",
            combined.len(),
            periods.ltm.label()
        );

        let mut ltm: Vec<Option<f64>> = vec![None; combined.len()];
        let mut done = vec![false; combined.len()];

        for (i, metric) in combined.iter().enumerate() {
            if metric.definition.kind.is_ratio() || self.reevaluates(metric.definition) {
                continue;
            }
            let mut draft = LineageDraft::default();
            let value = self.first_pass(metric, &periods, lineage, &mut draft);
            ltm[i] = value;
            done[i] = true;
            debug!("{} [{}] = {:?}", metric.key, periods.ltm, value);
            lineage.commit(&metric.key, &periods.ltm, draft, value, metric.definition.display)?;
        }

        for i in 0..combined.len() {
            if done[i] {
                continue;
            }
            let metric = &combined[i];
            let mut draft = LineageDraft::default();
            let value = if metric.definition.kind.is_ratio() {
                self.recompute_ratio(i, &combined, &ltm, &done, &resolver, lineage, &mut draft)
            } else {
                self.reevaluate(i, &combined, &ltm, &done, &resolver, lineage, &mut draft)?
            };
            ltm[i] = value;
            done[i] = true;
            debug!("{} [{}] = {:?}", metric.key, periods.ltm, value);
            lineage.commit(&metric.key, &periods.ltm, draft, value, metric.definition.display)?;
        }

        let mut columns = inputs.annual.periods().to_vec();
        columns.extend([periods.ytd_prior, periods.ytd_current, periods.ltm]);

        let rows = combined
            .iter()
            .zip(ltm)
            .map(|(metric, ltm_value)| {
                let mut row = ComputedMetricRow::new(metric.key.name.clone());
                for period in inputs.annual.periods() {
                    row.set(*period, value_of(metric.annual, period));
                }
                row.set(periods.ytd_prior, value_of(metric.prior, &periods.ytd_prior));
                row.set(periods.ytd_current, value_of(metric.current, &periods.ytd_current));
                row.set(periods.ltm, ltm_value);
                row
            })
            .collect();

        Ok(MetricTable::new(columns, rows))
    }

    fn first_pass(
        &self,
        metric: &Combined<'_>,
        periods: &RollupPeriods,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        if metric.definition.kind == MetricKind::YoYGrowth {
            draft.set_calculation("Previous year data not available");
            draft.note("growth has no trailing-period baseline");
            return None;
        }

        let current = value_of(metric.current, &periods.ytd_current);
        if self.config.is_stock_metric(&metric.key.name) {
            draft.set_calculation(format!("{} value (stock metric)", periods.ytd_current.label()));
            absorb(draft, lineage, &metric.key, &periods.ytd_current);
            return current;
        }

        let annual = value_of(metric.annual, &periods.fiscal_year);
        let prior = value_of(metric.prior, &periods.ytd_prior);
        draft.set_calculation(format!(
            "{} + {} - {}",
            periods.fiscal_year.label(),
            periods.ytd_current.label(),
            periods.ytd_prior.label()
        ));
        for period in [periods.fiscal_year, periods.ytd_current, periods.ytd_prior] {
            absorb(draft, lineage, &metric.key, &period);
        }

        let value = match (annual, current, prior) {
            (Some(a), Some(b), Some(c)) => Some(a + b - c),
            _ => {
                draft.note("LTM needs the fiscal-year and both year-to-date values");
                None
            }
        };

        let mut inputs = BTreeMap::new();
        inputs.insert(periods.fiscal_year.label(), annual);
        inputs.insert(periods.ytd_current.label(), current);
        inputs.insert(periods.ytd_prior.label(), prior);
        let formula = draft.calculation().to_string();
        draft.add_step(formula, inputs, value, None);
        value
    }

    /// Generic formulas shaped like a ratio are re-evaluated over trailing inputs. Summing
    /// three ratios has no meaning.
    fn reevaluates(&self, definition: &MetricDefinition) -> bool {
        if definition.kind != MetricKind::Generic || self.config.is_stock_metric(&definition.name) {
            return false;
        }
        match definition.formula.as_deref() {
            Some(text) if !text.contains("Not available") => {
                text.contains('/')
                    || matches!(
                        definition.display,
                        DisplayFormat::Percentage | DisplayFormat::Multiple
                    )
            }
            _ => false,
        }
    }

    /// Trailing value of an earlier metric, absorbing its sources.
    #[allow(clippy::too_many_arguments)]
    fn earlier_ltm(
        &self,
        j: usize,
        combined: &[Combined<'_>],
        ltm: &[Option<f64>],
        done: &[bool],
        periods: &RollupPeriods,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        let name = &combined[j].key.name;
        if !done[j] {
            draft.note(format!("{} has no trailing value yet", name));
            return None;
        }
        absorb(draft, lineage, &combined[j].key, &periods.ltm);
        ltm[j]
    }

    /// Evaluates the formula once over trailing values: earlier metrics bind their LTM,
    /// accounts bind their trailing read from the stores.
    #[allow(clippy::too_many_arguments)]
    fn reevaluate(
        &self,
        index: usize,
        combined: &[Combined<'_>],
        ltm: &[Option<f64>],
        done: &[bool],
        resolver: &LtmResolver<'_>,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let metric = &combined[index];
        let periods = resolver.periods();
        let Some(text) = metric.definition.formula.as_deref() else {
            return Ok(None);
        };
        draft.set_calculation(text);

        let formula = match Formula::parse(text) {
            Ok(formula) => formula,
            Err(e) => {
                warn!("Skipping trailing formula for '{}': {}", metric.key, e);
                draft.note(format!("formula rejected: {}", e));
                return Ok(None);
            }
        };

        let mut bindings = BTreeMap::new();
        let mut step_inputs = BTreeMap::new();
        for token in formula.tokens() {
            let value = match nearest_earlier(combined, index, token) {
                Some(j) if token != &metric.key.name => {
                    self.earlier_ltm(j, combined, ltm, done, periods, lineage, draft)
                }
                _ => resolver.account(std::slice::from_ref(token), token, Reading::Trailing, draft),
            };
            if value.is_none() {
                draft.note(format!("{} missing for {}; treated as 0", token, periods.ltm));
            }
            bindings.insert(token.clone(), value.unwrap_or(0.0));
            step_inputs.insert(token.clone(), value);
        }

        for dated in formula.dated_tokens() {
            let name = dated.binding_name();
            let value = resolver.dated(dated, draft);
            if value.is_none() {
                draft.note(format!("{} missing; treated as 0", name));
            }
            bindings.insert(name.clone(), value.unwrap_or(0.0));
            step_inputs.insert(name, value);
        }

        let value = formula.evaluate(&bindings)?;
        let note = value
            .is_none()
            .then(|| "division by zero or non-finite result".to_string());
        draft.add_step(text, step_inputs, value, note);
        Ok(value)
    }

    #[allow(clippy::too_many_arguments)]
    fn recompute_ratio(
        &self,
        index: usize,
        combined: &[Combined<'_>],
        ltm: &[Option<f64>],
        done: &[bool],
        resolver: &LtmResolver<'_>,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        let metric = &combined[index];
        let periods = resolver.periods();
        let roles = &self.config.roles;
        let deps = &metric.definition.dependency_names;

        let operand = |name: &str, draft: &mut LineageDraft| -> Option<f64> {
            match nearest_earlier(combined, index, name) {
                Some(j) => self.earlier_ltm(j, combined, ltm, done, periods, lineage, draft),
                None => {
                    draft.note(format!(
                        "metric '{}' is not declared before {}; treated as missing",
                        name, metric.key
                    ));
                    None
                }
            }
        };

        match metric.definition.kind {
            MetricKind::MarginRatio => {
                let (Some(num_name), Some(den_name)) = (
                    deps.first().map(String::as_str),
                    deps.get(1).map(String::as_str),
                ) else {
                    draft.note("margin needs two dependencies");
                    return None;
                };
                draft.set_calculation(format!("{} / {} * 100", num_name, den_name));
                let num = operand(num_name, draft);
                let den = operand(den_name, draft);
                let value = divide(num, den, den_name, draft).map(|r| r * 100.0);
                record_ratio_step(draft, &[(num_name, num), (den_name, den)], value);
                value
            }
            MetricKind::InterestCoverage => {
                let ebitda_name = deps.first().unwrap_or(&roles.ebitda).as_str();
                let interest_name = roles.interest_expense.as_str();
                draft.set_calculation(format!("{} / {}", ebitda_name, interest_name));
                let ebitda = operand(ebitda_name, draft);

                let interest = if nearest_earlier(combined, index, interest_name).is_some() {
                    operand(interest_name, draft)
                } else {
                    let candidates = if metric.definition.source_account_candidates.is_empty() {
                        &self.config.interest_expense_accounts
                    } else {
                        &metric.definition.source_account_candidates
                    };
                    let token = candidates.first().map(String::as_str).unwrap_or("InterestExpense");
                    resolver.account(candidates, token, Reading::Trailing, draft)
                };

                let value = divide(Some(ebitda.unwrap_or(0.0)), interest, interest_name, draft);
                record_ratio_step(
                    draft,
                    &[(ebitda_name, ebitda), (interest_name, interest)],
                    value,
                );
                value
            }
            MetricKind::LeverageRatio => {
                let debt_name = deps.first().unwrap_or(&roles.total_debt).as_str();
                let ebitda_name = deps.get(1).unwrap_or(&roles.ebitda).as_str();
                draft.set_calculation(format!("{} / {}", debt_name, ebitda_name));
                let debt = operand(debt_name, draft);
                let ebitda = operand(ebitda_name, draft);
                let value = divide(Some(debt.unwrap_or(0.0)), ebitda, ebitda_name, draft);
                record_ratio_step(draft, &[(debt_name, debt), (ebitda_name, ebitda)], value);
                value
            }
            MetricKind::BookCapitalRatio => {
                let has = |name: &str| nearest_earlier(combined, index, name).is_some();
                if !has(roles.total_debt.as_str()) || !has(roles.book_equity.as_str()) {
                    // Balance-sheet ratio: the latest interim value stands for the trailing period.
                    draft.set_calculation(format!(
                        "{} value (balance sheet ratio)",
                        periods.ytd_current.label()
                    ));
                    absorb(draft, lineage, &metric.key, &periods.ytd_current);
                    return value_of(metric.current, &periods.ytd_current);
                }

                draft.set_calculation(format!(
                    "{d} / ({d} + {e}) * 100",
                    d = roles.total_debt,
                    e = roles.book_equity
                ));
                let debt = operand(roles.total_debt.as_str(), draft);
                let equity = operand(roles.book_equity.as_str(), draft);
                let value = match (debt, equity) {
                    (Some(d), Some(e)) => divide(Some(d), Some(d + e), "book capital", draft)
                        .map(|r| r * 100.0),
                    _ => {
                        draft.note("book capital needs both debt and equity values");
                        None
                    }
                };
                record_ratio_step(
                    draft,
                    &[(roles.total_debt.as_str(), debt), (roles.book_equity.as_str(), equity)],
                    value,
                );
                value
            }
            _ => None,
        }
    }
}

/// Trailing-period sources are already qualified by period, so they are taken as-is.
fn absorb(draft: &mut LineageDraft, lineage: &LineageLog, key: &MetricKey, period: &Period) {
    if let Some(sources) = lineage.sources_for(key, period) {
        let qualifier = (!matches!(period, Period::TrailingTwelveMonths(_))).then_some(period);
        draft.absorb(sources, qualifier);
    }
}

fn combine<'r>(inputs: &RollupInputs<'r>) -> Vec<Combined<'r>> {
    let mut combined: Vec<Combined<'r>> = inputs
        .annual
        .entries()
        .iter()
        .map(|entry| Combined {
            key: entry.key.clone(),
            definition: &entry.definition,
            annual: Some(entry),
            current: inputs.ytd_current.entry(&entry.key),
            prior: inputs.ytd_prior.entry(&entry.key),
        })
        .collect();

    for entry in inputs.ytd_current.entries() {
        if inputs.annual.entry(&entry.key).is_none() {
            combined.push(Combined {
                key: entry.key.clone(),
                definition: &entry.definition,
                annual: None,
                current: Some(entry),
                prior: inputs.ytd_prior.entry(&entry.key),
            });
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MetricEngine;
    use crate::schema::{PeriodKey, StatementKind};
    use crate::store::StatementTable;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn complete(store: TimeIndexedStore, kind: StatementKind, table: StatementTable) -> TimeIndexedStore {
        StatementKind::ALL.iter().fold(store, |s, k| {
            if *k == kind {
                s.with_table(*k, table.clone())
            } else {
                s.with_table(*k, StatementTable::new())
            }
        })
    }

    struct Fixture {
        config: EngineConfig,
        annual_store: TimeIndexedStore,
        current_store: TimeIndexedStore,
        prior_store: TimeIndexedStore,
    }

    fn fixture(annual: &[(&str, f64)], current: &[(&str, f64)], prior: &[(&str, f64)]) -> Fixture {
        let config = EngineConfig {
            fiscal_years: vec![2024],
            ..EngineConfig::default()
        };

        let mut a = StatementTable::new();
        for (k, v) in annual {
            a.insert(*k, PeriodKey::Year(2024), Some(*v));
        }
        let mut c = StatementTable::new();
        for (k, v) in current {
            c.insert(*k, PeriodKey::Date(date(2025, 3, 31)), Some(*v));
        }
        let mut p = StatementTable::new();
        for (k, v) in prior {
            p.insert(*k, PeriodKey::Date(date(2024, 3, 31)), Some(*v));
        }

        Fixture {
            config,
            annual_store: complete(TimeIndexedStore::annual(), StatementKind::Income, a),
            current_store: complete(TimeIndexedStore::interim(), StatementKind::Income, c),
            prior_store: complete(TimeIndexedStore::interim(), StatementKind::Income, p),
        }
    }

    fn roll(fx: &Fixture, defs: &[MetricDefinition]) -> (MetricTable, LineageLog) {
        let ts = date(2025, 5, 1).and_hms_opt(0, 0, 0).unwrap();
        let mut lineage = LineageLog::new("TEST", ts);
        let engine = MetricEngine::new(&fx.config, defs);

        let annual = engine
            .run(&fx.annual_store, &[Period::FiscalYear(2024)], &mut lineage)
            .unwrap();
        let current = engine
            .run(&fx.current_store, &[Period::YearToDate(date(2025, 3, 31))], &mut lineage)
            .unwrap();
        let prior = engine
            .run(&fx.prior_store, &[Period::YearToDate(date(2024, 3, 31))], &mut lineage)
            .unwrap();

        let inputs = RollupInputs {
            annual: &annual,
            ytd_current: &current,
            ytd_prior: &prior,
            annual_store: &fx.annual_store,
            current_store: &fx.current_store,
            prior_store: &fx.prior_store,
        };
        let table = TemporalRollup::new(&fx.config)
            .rollup(&inputs, &mut lineage)
            .unwrap();
        (table, lineage)
    }

    fn ltm() -> Period {
        Period::TrailingTwelveMonths(date(2025, 3, 31))
    }

    #[test]
    fn test_flow_identity() {
        let fx = fixture(&[("Revenues", 400.0)], &[("Revenues", 110.0)], &[("Revenues", 90.0)]);
        let defs = vec![MetricDefinition::pass_through("Revenue", "Revenues")];
        let (table, lineage) = roll(&fx, &defs);

        assert_eq!(table.value("Revenue", &ltm()), Some(420.0));
        assert_eq!(
            table.column_labels(),
            vec!["2024", "YTD 2024", "YTD 2025", "LTM 2025"]
        );

        let record = lineage.record(&MetricKey::first("Revenue"), &ltm()).unwrap();
        assert_eq!(record.calculation, "2024 + YTD 2025 - YTD 2024");
        assert!(record.sources.contains_key("Revenues[2024]"));
        assert!(record.sources.contains_key("Revenues[YTD 2025]"));
        assert!(record.sources.contains_key("Revenues[YTD 2024]"));
    }

    #[test]
    fn test_flow_null_operand() {
        let fx = fixture(&[("Revenues", 400.0)], &[("Revenues", 110.0)], &[]);
        let defs = vec![MetricDefinition::pass_through("Revenue", "Revenues")];
        let (table, _) = roll(&fx, &defs);
        assert_eq!(table.value("Revenue", &ltm()), None);
    }

    #[test]
    fn test_stock_metric_takes_current_ytd() {
        let fx = fixture(
            &[("NotesPayable", 500.0)],
            &[("NotesPayable", 650.0)],
            &[("NotesPayable", 480.0)],
        );
        let defs = vec![MetricDefinition::pass_through("Total Debt", "NotesPayable")];
        let (table, lineage) = roll(&fx, &defs);

        assert_eq!(table.value("Total Debt", &ltm()), Some(650.0));
        let record = lineage.record(&MetricKey::first("Total Debt"), &ltm()).unwrap();
        assert_eq!(record.calculation, "YTD 2025 value (stock metric)");
    }

    #[test]
    fn test_margin_recomputed_from_ltm_inputs() {
        let fx = fixture(
            &[("Revenues", 400.0), ("GrossProfit", 100.0)],
            &[("Revenues", 110.0), ("GrossProfit", 40.0)],
            &[("Revenues", 10.0), ("GrossProfit", 0.0)],
        );
        let defs = vec![
            MetricDefinition::pass_through("Revenue", "Revenues"),
            MetricDefinition::pass_through("Gross Profit", "GrossProfit"),
            MetricDefinition::new("% Margin", MetricKind::MarginRatio)
                .with_dependencies(["Gross Profit", "Revenue"]),
        ];
        let (table, _) = roll(&fx, &defs);
        // (100 + 40 - 0) / (400 + 110 - 10) * 100
        let margin = table.value("% Margin", &ltm()).unwrap();
        assert!((margin - 28.0).abs() < 1e-9);
    }

    #[test]
    fn test_interest_coverage_zero_denominator() {
        let fx = fixture(
            &[("OperatingIncomeLoss", 40.0), ("InterestExpense", 5.0)],
            &[("OperatingIncomeLoss", 20.0), ("InterestExpense", 2.0)],
            &[("OperatingIncomeLoss", 10.0), ("InterestExpense", 7.0)],
        );
        let defs = vec![
            MetricDefinition::pass_through("Adjusted EBITDA", "OperatingIncomeLoss"),
            MetricDefinition::pass_through("Interest Expense", "InterestExpense"),
            MetricDefinition::new("EBITDA / Int. Exp.", MetricKind::InterestCoverage),
        ];
        let (table, lineage) = roll(&fx, &defs);

        assert_eq!(table.value("Adjusted EBITDA", &ltm()), Some(50.0));
        assert_eq!(table.value("Interest Expense", &ltm()), Some(0.0));
        assert_eq!(table.value("EBITDA / Int. Exp.", &ltm()), None);

        let record = lineage
            .record(&MetricKey::first("EBITDA / Int. Exp."), &ltm())
            .unwrap();
        assert!(record.notes.iter().any(|n| n.contains("zero")));
        assert!(record.sources.contains_key("OperatingIncomeLoss[2024]"));
        assert!(record.sources.contains_key("InterestExpense[YTD 2024]"));
    }

    #[test]
    fn test_interest_coverage_from_accounts() {
        let fx = fixture(
            &[("OperatingIncomeLoss", 40.0), ("InterestExpense", 8.0)],
            &[("OperatingIncomeLoss", 20.0), ("InterestExpense", 4.0)],
            &[("OperatingIncomeLoss", 10.0), ("InterestExpense", 2.0)],
        );
        let defs = vec![
            MetricDefinition::pass_through("Adjusted EBITDA", "OperatingIncomeLoss"),
            MetricDefinition::new("EBITDA / Int. Exp.", MetricKind::InterestCoverage),
        ];
        let (table, _) = roll(&fx, &defs);
        assert_eq!(table.value("EBITDA / Int. Exp.", &ltm()), Some(5.0));
    }

    #[test]
    fn test_generic_ratio_recomputed_from_trailing_inputs() {
        let fx = fixture(
            &[("E", 80.0), ("I", 10.0), ("R", 0.0)],
            &[("E", 20.0), ("I", 2.0), ("R", 0.0)],
            &[("E", 20.0), ("I", 4.0), ("R", 0.0)],
        );
        let defs = vec![
            MetricDefinition::pass_through("E", "E"),
            MetricDefinition::pass_through("I", "I"),
            MetricDefinition::generic("EBITDAR / Interest + Rent", "(E + R) / (I + R)")
                .with_display(DisplayFormat::Multiple),
            MetricDefinition::generic("Cover Check", "E / (I - I)"),
        ];
        let (table, lineage) = roll(&fx, &defs);

        assert_eq!(table.value("E", &ltm()), Some(80.0));
        assert_eq!(table.value("I", &ltm()), Some(8.0));
        // 80 / 8, not 8.0 + 10.0 - 5.0
        assert_eq!(table.value("EBITDAR / Interest + Rent", &ltm()), Some(10.0));
        assert_eq!(table.value("Cover Check", &ltm()), None);

        let record = lineage
            .record(&MetricKey::first("EBITDAR / Interest + Rent"), &ltm())
            .unwrap();
        assert_eq!(record.calculation, "(E + R) / (I + R)");
        assert_eq!(record.formatted_value.as_deref(), Some("10.00x"));
        assert!(record.sources.contains_key("E[2024]"));
        assert!(record.sources.contains_key("R[YTD 2024]"));
    }

    #[test]
    fn test_single_dependency_margin_is_not_summed() {
        let fx = fixture(
            &[("Revenues", 400.0), ("GrossProfit", 100.0)],
            &[("Revenues", 110.0), ("GrossProfit", 40.0)],
            &[("Revenues", 10.0), ("GrossProfit", 0.0)],
        );
        let item = crate::schema::MappingItem {
            metric: "% Margin".to_string(),
            calculation: "GrossProfit / Revenues * 100".to_string(),
            dependency_names: vec!["Gross Profit".to_string()],
            financial_statement_keys: Vec::new(),
        };
        let margin = MetricDefinition::from_mapping_item(&item, &fx.config);
        assert_eq!(margin.kind, MetricKind::Generic);

        let (table, _) = roll(&fx, &[margin]);
        let value = table.value("% Margin", &ltm()).unwrap();
        assert!((value - 28.0).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_dependency_binds_nearest_earlier() {
        let fx = fixture(
            &[("Revenues", 400.0), ("GrossProfit", 100.0), ("GrossProfitRestated", 200.0)],
            &[("Revenues", 110.0), ("GrossProfit", 40.0), ("GrossProfitRestated", 60.0)],
            &[("Revenues", 10.0), ("GrossProfit", 0.0), ("GrossProfitRestated", 10.0)],
        );
        let defs = vec![
            MetricDefinition::pass_through("Revenue", "Revenues"),
            MetricDefinition::pass_through("Gross Profit", "GrossProfit"),
            MetricDefinition::pass_through("Gross Profit", "GrossProfitRestated"),
            MetricDefinition::new("% Margin", MetricKind::MarginRatio)
                .with_dependencies(["Gross Profit", "Revenue"]),
        ];
        let (table, lineage) = roll(&fx, &defs);

        let annual = table.value("% Margin", &Period::FiscalYear(2024)).unwrap();
        assert!((annual - 50.0).abs() < 1e-9);
        // 250 / 500, the same row the annual cell read
        let trailing = table.value("% Margin", &ltm()).unwrap();
        assert!((trailing - 50.0).abs() < 1e-9);

        let record = lineage.record(&MetricKey::first("% Margin"), &ltm()).unwrap();
        assert!(record.sources.contains_key("GrossProfitRestated[2024]"));
        assert!(!record.sources.contains_key("GrossProfit[2024]"));
    }

    #[test]
    fn test_yoy_has_no_trailing_value() {
        let fx = fixture(&[("Revenues", 400.0)], &[("Revenues", 110.0)], &[("Revenues", 100.0)]);
        let defs = vec![
            MetricDefinition::pass_through("Revenue", "Revenues"),
            MetricDefinition::new("% YoY Growth", MetricKind::YoYGrowth).with_dependencies(["Revenue"]),
        ];
        let (table, lineage) = roll(&fx, &defs);
        assert_eq!(table.value("% YoY Growth", &ltm()), None);
        let record = lineage.record(&MetricKey::first("% YoY Growth"), &ltm()).unwrap();
        assert!(!record.notes.is_empty());
    }
}
