use crate::config::EngineConfig;
use crate::error::{MetricEngineError, Result};
use crate::expression::Formula;
use crate::lineage::{LineageDraft, LineageLog, MetricKey};
use crate::schema::{FilingType, MetricDefinition, MetricKind, Period, PeriodKey};
use crate::store::TimeIndexedStore;
use crate::table::ComputedMetricRow;
use log::{debug, info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellState {
    Pending,
    Evaluating,
    Resolved(Option<f64>),
}

/// Memoized results for one metric-definition occurrence.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub key: MetricKey,
    pub definition: MetricDefinition,
    cells: BTreeMap<Period, CellState>,
}

impl RunEntry {
    fn new(key: MetricKey, definition: MetricDefinition, periods: &[Period]) -> Self {
        let cells = periods.iter().map(|p| (*p, CellState::Pending)).collect();
        Self {
            key,
            definition,
            cells,
        }
    }

    pub fn state(&self, period: &Period) -> CellState {
        self.cells
            .get(period)
            .copied()
            .unwrap_or(CellState::Pending)
    }

    pub fn value(&self, period: &Period) -> Option<f64> {
        match self.state(period) {
            CellState::Resolved(v) => v,
            _ => None,
        }
    }

    pub fn to_row(&self) -> ComputedMetricRow {
        let mut row = ComputedMetricRow::new(self.key.name.clone());
        for period in self.cells.keys() {
            row.set(*period, self.value(period));
        }
        row
    }
}

/// The fully evaluated metrics of one filing, exposed read-only.
#[derive(Debug, Clone)]
pub struct EngineRun {
    filing: FilingType,
    periods: Vec<Period>,
    entries: Vec<RunEntry>,
}

impl EngineRun {
    pub fn filing(&self) -> FilingType {
        self.filing
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    pub fn entries(&self) -> &[RunEntry] {
        &self.entries
    }

    pub fn entry(&self, key: &MetricKey) -> Option<&RunEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }

    pub fn value(&self, key: &MetricKey, period: &Period) -> Option<f64> {
        self.entry(key)?.value(period)
    }

    pub fn rows(&self) -> Vec<ComputedMetricRow> {
        self.entries.iter().map(RunEntry::to_row).collect()
    }
}

enum Located {
    Earlier(usize),
    Later,
    Absent,
}

/// Evaluates an ordered list of metric definitions over a set of periods.
pub struct MetricEngine<'a> {
    config: &'a EngineConfig,
    definitions: &'a [MetricDefinition],
}

impl<'a> MetricEngine<'a> {
    pub fn new(config: &'a EngineConfig, definitions: &'a [MetricDefinition]) -> Self {
        Self {
            config,
            definitions,
        }
    }

    /// Evaluates every metric once per period in declaration order, committing a lineage
    /// record per cell. Structural faults abort the run; `lineage` keeps what was committed.
    pub fn run(
        &self,
        store: &TimeIndexedStore,
        periods: &[Period],
        lineage: &mut LineageLog,
    ) -> Result<EngineRun> {
        info!(
            "Evaluating {} metrics over {} period(s) from {} data",
            self.definitions.len(),
            periods.len(),
            store.filing()
        );

        let mut run = EngineRun {
            filing: store.filing(),
            periods: periods.to_vec(),
            entries: Vec::with_capacity(self.definitions.len()),
        };
        let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();

        for (index, definition) in self.definitions.iter().enumerate() {
            let seen = occurrences.entry(definition.name.as_str()).or_insert(0);
            let key = MetricKey::new(definition.name.clone(), *seen);
            *seen += 1;

            self.check_definition(index)?;
            run.entries
                .push(RunEntry::new(key.clone(), definition.clone(), periods));

            for period in periods {
                run.entries[index]
                    .cells
                    .insert(*period, CellState::Evaluating);

                let mut draft = LineageDraft::default();
                let value = self
                    .evaluate_cell(&run, index, *period, store, lineage, &mut draft)?
                    .filter(|v| v.is_finite());

                run.entries[index]
                    .cells
                    .insert(*period, CellState::Resolved(value));
                debug!("{} [{}] = {:?}", key, period, value);
                lineage.commit(&key, period, draft, value, definition.display)?;
            }
        }

        Ok(run)
    }

    fn check_definition(&self, index: usize) -> Result<()> {
        let definition = &self.definitions[index];
        if definition.kind == MetricKind::MarginRatio && definition.dependency_names.len() != 2 {
            return Err(MetricEngineError::InvalidDefinition {
                metric: definition.name.clone(),
                details: format!(
                    "margin needs exactly two dependencies, found {}",
                    definition.dependency_names.len()
                ),
            });
        }
        Ok(())
    }

    fn locate(&self, index: usize, name: &str) -> Located {
        if let Some(j) = (0..index).rev().find(|&j| self.definitions[j].name == name) {
            Located::Earlier(j)
        } else if self.definitions[index..].iter().any(|d| d.name == name) {
            Located::Later
        } else {
            Located::Absent
        }
    }

    fn unresolved(&self, index: usize, dependency: &str) -> MetricEngineError {
        MetricEngineError::UnresolvedDependency {
            metric: self.definitions[index].name.clone(),
            dependency: dependency.to_string(),
        }
    }

    fn memoized(&self, run: &EngineRun, index: usize, j: usize, at: &Period) -> Result<Option<f64>> {
        match run.entries[j].state(at) {
            CellState::Resolved(v) => Ok(v),
            CellState::Pending | CellState::Evaluating => {
                Err(self.unresolved(index, &self.definitions[j].name))
            }
        }
    }

    /// Value of an earlier metric at `at`, absorbing its recorded sources into `draft`.
    /// A metric declared at or after `index` is always fatal; one not declared at all is
    /// fatal only when `strict`.
    #[allow(clippy::too_many_arguments)]
    fn metric_input(
        &self,
        run: &EngineRun,
        lineage: &LineageLog,
        index: usize,
        name: &str,
        at: Period,
        cell: Period,
        draft: &mut LineageDraft,
        strict: bool,
    ) -> Result<Option<f64>> {
        match self.locate(index, name) {
            Located::Earlier(j) => {
                let value = self.memoized(run, index, j, &at)?;
                if let Some(sources) = lineage.sources_for(&run.entries[j].key, &at) {
                    let qualifier = (at != cell).then_some(&at);
                    draft.absorb(sources, qualifier);
                }
                if value.is_none() {
                    draft.note(format!("{} has no value for {}", name, at));
                }
                Ok(value)
            }
            Located::Later => Err(self.unresolved(index, name)),
            Located::Absent if strict => Err(self.unresolved(index, name)),
            Located::Absent => {
                draft.note(format!("metric '{}' is not defined; treated as missing", name));
                Ok(None)
            }
        }
    }

    fn evaluate_cell(
        &self,
        run: &EngineRun,
        index: usize,
        period: Period,
        store: &TimeIndexedStore,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let definition = &self.definitions[index];
        match definition.kind {
            MetricKind::YoYGrowth => self.yoy_growth(run, index, period, store, lineage, draft),
            MetricKind::MarginRatio => self.margin(run, index, period, lineage, draft),
            MetricKind::InterestCoverage => {
                self.interest_coverage(run, index, period, store, lineage, draft)
            }
            MetricKind::LeverageRatio => self.leverage(run, index, period, lineage, draft),
            MetricKind::BookCapitalRatio => Ok(self.book_capital(period, store, draft)),
            MetricKind::PassThrough => Ok(self.pass_through(definition, period, store, draft)),
            MetricKind::Generic => self.generic(run, index, period, store, lineage, draft),
        }
    }

    fn yoy_growth(
        &self,
        run: &EngineRun,
        index: usize,
        period: Period,
        store: &TimeIndexedStore,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let definition = &self.definitions[index];
        let explicit = definition.dependency_names.first();
        let base = explicit.unwrap_or(&self.config.roles.revenue).as_str();

        let Some(prior) = period.prior_year().filter(|p| run.periods.contains(p)) else {
            draft.set_calculation("Previous year data not available");
            draft.note(format!("no prior-year baseline for {}", period));
            return Ok(None);
        };

        draft.set_calculation(format!(
            "({b}[{cur}] - {b}[{prev}]) / {b}[{prev}] * 100",
            b = base,
            cur = period.label(),
            prev = prior.label()
        ));

        let (current, previous) = match self.locate(index, base) {
            Located::Absent if explicit.is_none() => {
                let candidates = if definition.source_account_candidates.is_empty() {
                    &self.config.revenue_accounts
                } else {
                    &definition.source_account_candidates
                };
                let mut read = |at: Period| {
                    let res = store.resolve(candidates, at.store_key());
                    if let Some(source) = res.source {
                        draft.add_source(
                            format!("{}[{}]", source.account_id(), at.label()),
                            source,
                        );
                    }
                    res.value
                };
                (read(period), read(prior))
            }
            _ => {
                let strict = explicit.is_some();
                let current =
                    self.metric_input(run, lineage, index, base, period, period, draft, strict)?;
                let previous =
                    self.metric_input(run, lineage, index, base, prior, period, draft, strict)?;
                (current, previous)
            }
        };

        let value = match (current, previous) {
            (Some(c), Some(p)) if p != 0.0 => Some((c - p) / p * 100.0),
            (_, Some(p)) if p == 0.0 => {
                draft.note(format!("{} for {} is zero; growth undefined", base, prior));
                None
            }
            _ => None,
        };

        let mut inputs = BTreeMap::new();
        inputs.insert(format!("{}[{}]", base, period.label()), current);
        inputs.insert(format!("{}[{}]", base, prior.label()), previous);
        let formula = draft.calculation().to_string();
        draft.add_step(formula, inputs, value, None);
        Ok(value)
    }

    fn margin(
        &self,
        run: &EngineRun,
        index: usize,
        period: Period,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let deps = &self.definitions[index].dependency_names;
        let (numerator, denominator) = (deps[0].as_str(), deps[1].as_str());
        draft.set_calculation(format!("{} / {} * 100", numerator, denominator));

        let num = self.metric_input(run, lineage, index, numerator, period, period, draft, true)?;
        let den =
            self.metric_input(run, lineage, index, denominator, period, period, draft, true)?;

        let value = divide(num, den, denominator, draft).map(|r| r * 100.0);
        record_ratio_step(draft, &[(numerator, num), (denominator, den)], value);
        Ok(value)
    }

    fn interest_coverage(
        &self,
        run: &EngineRun,
        index: usize,
        period: Period,
        store: &TimeIndexedStore,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let definition = &self.definitions[index];
        let explicit = definition.dependency_names.first();
        let ebitda_name = explicit.unwrap_or(&self.config.roles.ebitda).as_str();

        let candidates = if definition.source_account_candidates.is_empty() {
            &self.config.interest_expense_accounts
        } else {
            &definition.source_account_candidates
        };
        let interest_token = candidates.first().map(String::as_str).unwrap_or("InterestExpense");
        draft.set_calculation(format!("{} / {}", ebitda_name, interest_token));

        let ebitda = self.metric_input(
            run,
            lineage,
            index,
            ebitda_name,
            period,
            period,
            draft,
            explicit.is_some(),
        )?;

        let res = store.resolve(candidates, period.store_key());
        if let Some(source) = res.source {
            draft.add_source(interest_token, source);
        }

        let value = divide(Some(ebitda.unwrap_or(0.0)), res.value, interest_token, draft);
        record_ratio_step(
            draft,
            &[(ebitda_name, ebitda), (interest_token, res.value)],
            value,
        );
        Ok(value)
    }

    fn leverage(
        &self,
        run: &EngineRun,
        index: usize,
        period: Period,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let deps = &self.definitions[index].dependency_names;
        let debt_name = deps.first().unwrap_or(&self.config.roles.total_debt).as_str();
        let ebitda_name = deps.get(1).unwrap_or(&self.config.roles.ebitda).as_str();
        draft.set_calculation(format!("{} / {}", debt_name, ebitda_name));

        let debt =
            self.metric_input(run, lineage, index, debt_name, period, period, draft, !deps.is_empty())?;
        let ebitda = self.metric_input(
            run,
            lineage,
            index,
            ebitda_name,
            period,
            period,
            draft,
            deps.len() > 1,
        )?;

        let value = divide(Some(debt.unwrap_or(0.0)), ebitda, ebitda_name, draft);
        record_ratio_step(draft, &[(debt_name, debt), (ebitda_name, ebitda)], value);
        Ok(value)
    }

    fn book_capital(
        &self,
        period: Period,
        store: &TimeIndexedStore,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        let accounts = &self.config.book_capital;
        let debt_expr = accounts.debt_accounts.join(" + ");
        let equity_token = accounts
            .equity_accounts
            .first()
            .map(String::as_str)
            .unwrap_or("StockholdersEquity");
        draft.set_calculation(format!(
            "({d}) / ({d} + {e}) * 100",
            d = debt_expr,
            e = equity_token
        ));

        let mut inputs = BTreeMap::new();
        let mut debt = 0.0;
        for account in &accounts.debt_accounts {
            let res = store.resolve(std::slice::from_ref(account), period.store_key());
            if let Some(source) = res.source {
                draft.add_source(account.clone(), source);
            }
            debt += res.value.unwrap_or(0.0);
            inputs.insert(account.clone(), res.value);
        }

        let equity = store.resolve(&accounts.equity_accounts, period.store_key());
        if let Some(source) = equity.source {
            draft.add_source(equity_token, source);
        }
        inputs.insert(equity_token.to_string(), equity.value);

        let denominator = debt + equity.value.unwrap_or(0.0);
        let value = if denominator == 0.0 {
            draft.note("book capital (debt + equity) is zero");
            None
        } else {
            Some(debt / denominator * 100.0)
        };

        let formula = draft.calculation().to_string();
        draft.add_step(formula, inputs, value, None);
        value
    }

    fn pass_through(
        &self,
        definition: &MetricDefinition,
        period: Period,
        store: &TimeIndexedStore,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        let candidates = &definition.source_account_candidates;
        let Some(first) = candidates.first() else {
            draft.set_calculation("");
            draft.note("no formula or source account configured");
            return None;
        };

        let res = store.resolve(candidates, period.store_key());
        match res.source {
            Some(source) => {
                draft.set_calculation(source.account_id().to_string());
                draft.add_source(source.account_id().to_string(), source);
            }
            None => {
                draft.set_calculation(first.clone());
                draft.note(format!("{} has no value for {}", candidates.join(" | "), period));
            }
        }
        res.value
    }

    fn generic(
        &self,
        run: &EngineRun,
        index: usize,
        period: Period,
        store: &TimeIndexedStore,
        lineage: &LineageLog,
        draft: &mut LineageDraft,
    ) -> Result<Option<f64>> {
        let definition = &self.definitions[index];
        let Some(text) = definition.formula.as_deref() else {
            return Ok(self.pass_through(definition, period, store, draft));
        };

        if text.contains("Not available") {
            draft.set_calculation("Not available");
            return Ok(None);
        }
        draft.set_calculation(text);

        let formula = match Formula::parse(text) {
            Ok(formula) => formula,
            Err(e) => {
                warn!("Skipping formula for '{}' ({}): {}", definition.name, period, e);
                draft.note(format!("formula rejected: {}", e));
                return Ok(None);
            }
        };

        let mut bindings = BTreeMap::new();
        let mut inputs = BTreeMap::new();

        for token in formula.tokens() {
            let resolved = match self.locate(index, token) {
                Located::Earlier(_) | Located::Later if token != &definition.name => {
                    self.metric_input(run, lineage, index, token, period, period, draft, true)?
                }
                _ => {
                    let res = store.resolve(std::slice::from_ref(token), period.store_key());
                    if let Some(source) = res.source {
                        draft.add_source(token.clone(), source);
                    }
                    res.value
                }
            };
            if resolved.is_none() {
                draft.note(format!("{} missing for {}; treated as 0", token, period));
            }
            bindings.insert(token.clone(), resolved.unwrap_or(0.0));
            inputs.insert(token.clone(), resolved);
        }

        for dated in formula.dated_tokens() {
            let name = dated.binding_name();
            let res = store.resolve(std::slice::from_ref(&dated.account), PeriodKey::Date(dated.date));
            if let Some(source) = res.source {
                draft.add_source(name.clone(), source);
            }
            if res.value.is_none() {
                draft.note(format!("{} missing; treated as 0", name));
            }
            bindings.insert(name.clone(), res.value.unwrap_or(0.0));
            inputs.insert(name, res.value);
        }

        let value = formula.evaluate(&bindings)?;
        let note = value
            .is_none()
            .then(|| "division by zero or non-finite result".to_string());
        draft.add_step(text, inputs, value, note);
        Ok(value)
    }
}

/// `num / den`, or `None` with a lineage note when the denominator is zero or missing.
pub(crate) fn divide(
    num: Option<f64>,
    den: Option<f64>,
    den_name: &str,
    draft: &mut LineageDraft,
) -> Option<f64> {
    match den {
        None => {
            draft.note(format!("denominator {} is null", den_name));
            None
        }
        Some(d) if d == 0.0 => {
            draft.note(format!("denominator {} is zero", den_name));
            None
        }
        Some(d) => num.map(|n| n / d).filter(|r| r.is_finite()),
    }
}

pub(crate) fn record_ratio_step(draft: &mut LineageDraft, operands: &[(&str, Option<f64>)], value: Option<f64>) {
    let inputs = operands
        .iter()
        .map(|(name, v)| (name.to_string(), *v))
        .collect();
    let formula = draft.calculation().to_string();
    draft.add_step(formula, inputs, value, None);
}
