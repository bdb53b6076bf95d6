//! Trailing and fiscal-year reads of raw statement accounts, for values no metric run
//! computed: formula tokens in trailing re-evaluation and comparable-company metrics.

use crate::config::EngineConfig;
use crate::expression::DatedToken;
use crate::lineage::LineageDraft;
use crate::rollup::RollupPeriods;
use crate::schema::{Period, PeriodKey, StatementKind};
use crate::store::TimeIndexedStore;
use log::debug;
use std::collections::BTreeMap;

/// Where a token is read from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// `FY + YTD current - YTD prior`, or the current YTD value for balance-sheet accounts.
    Trailing,
    FiscalYear(i32),
}

pub struct LtmResolver<'r> {
    config: &'r EngineConfig,
    annual: &'r TimeIndexedStore,
    current: &'r TimeIndexedStore,
    prior: &'r TimeIndexedStore,
    periods: RollupPeriods,
}

impl<'r> LtmResolver<'r> {
    pub fn new(
        config: &'r EngineConfig,
        annual: &'r TimeIndexedStore,
        current: &'r TimeIndexedStore,
        prior: &'r TimeIndexedStore,
        periods: RollupPeriods,
    ) -> Self {
        Self {
            config,
            annual,
            current,
            prior,
            periods,
        }
    }

    pub fn periods(&self) -> &RollupPeriods {
        &self.periods
    }

    /// First candidate with data, read as `reading`. Sources are recorded as
    /// `token[period label]`.
    pub fn account<S: AsRef<str>>(
        &self,
        candidates: &[S],
        token: &str,
        reading: Reading,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        match reading {
            Reading::Trailing => self.trailing(candidates, token, draft),
            Reading::FiscalYear(year) => {
                let period = Period::FiscalYear(year);
                let value = self.read(self.annual, candidates, token, period, draft);
                if value.is_none() {
                    draft.note(format!("{} has no value for {}", token, year));
                }
                value
            }
        }
    }

    /// A formula token. EBITDA tokens with no value of their own are rebuilt from the
    /// configured components.
    pub fn token(&self, token: &str, reading: Reading, draft: &mut LineageDraft) -> Option<f64> {
        let fallback = &self.config.ebitda_fallback;
        if !fallback.is_ebitda(token) {
            return self.account(&[token], token, reading, draft);
        }

        let mut scratch = LineageDraft::default();
        if let Some(value) = self.account(&[token], token, reading, &mut scratch) {
            for (key, source) in scratch.sources() {
                draft.add_source(key.clone(), source.clone());
            }
            return Some(value);
        }
        self.ebitda_from_components(token, reading, draft)
    }

    /// Point value of a dated token, from the current interim filing and then the prior one.
    pub fn dated(&self, dated: &DatedToken, draft: &mut LineageDraft) -> Option<f64> {
        let name = dated.binding_name();
        for store in [self.current, self.prior] {
            let res = store.resolve(std::slice::from_ref(&dated.account), PeriodKey::Date(dated.date));
            if let Some(source) = res.source {
                draft.add_source(name.clone(), source);
                return res.value;
            }
        }
        None
    }

    fn trailing<S: AsRef<str>>(
        &self,
        candidates: &[S],
        token: &str,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        let p = self.periods;
        let current = self.current.resolve(candidates, p.ytd_current.store_key());
        if current
            .source
            .as_ref()
            .is_some_and(|s| s.table == StatementKind::Balance)
        {
            debug!("{} is a balance-sheet account; using {}", token, p.ytd_current);
            return self.read(self.current, candidates, token, p.ytd_current, draft);
        }

        let annual = self.read(self.annual, candidates, token, p.fiscal_year, draft);
        let current = self.read(self.current, candidates, token, p.ytd_current, draft);
        let prior = self.read(self.prior, candidates, token, p.ytd_prior, draft);

        let value = match (annual, current, prior) {
            (Some(a), Some(b), Some(c)) => Some(a + b - c),
            _ => {
                draft.note(format!("{} is missing for at least one period", token));
                None
            }
        };

        let mut inputs = BTreeMap::new();
        inputs.insert(format!("{}[{}]", token, p.fiscal_year.label()), annual);
        inputs.insert(format!("{}[{}]", token, p.ytd_current.label()), current);
        inputs.insert(format!("{}[{}]", token, p.ytd_prior.label()), prior);
        draft.add_step(
            format!(
                "{t}[{}] + {t}[{}] - {t}[{}]",
                p.fiscal_year.label(),
                p.ytd_current.label(),
                p.ytd_prior.label(),
                t = token
            ),
            inputs,
            value,
            None,
        );
        value
    }

    fn read<S: AsRef<str>>(
        &self,
        store: &TimeIndexedStore,
        candidates: &[S],
        token: &str,
        period: Period,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        let res = store.resolve(candidates, period.store_key());
        if let Some(source) = res.source {
            draft.add_source(format!("{}[{}]", token, period.label()), source);
        }
        res.value
    }

    /// Sum of the components; `None` only when every component is missing.
    fn ebitda_from_components(
        &self,
        token: &str,
        reading: Reading,
        draft: &mut LineageDraft,
    ) -> Option<f64> {
        let components = &self.config.ebitda_fallback.components;
        let mut inputs = BTreeMap::new();
        for component in components {
            let value = self.account(std::slice::from_ref(component), component, reading, draft);
            inputs.insert(component.clone(), value);
        }

        let value = inputs
            .values()
            .any(Option::is_some)
            .then(|| inputs.values().map(|v| v.unwrap_or(0.0)).sum::<f64>());
        draft.note(format!("{} rebuilt from its components", token));
        draft.add_step(components.join(" + "), inputs, value, None);
        value
    }
}
