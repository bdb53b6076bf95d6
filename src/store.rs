use crate::config::EngineConfig;
use crate::error::{MetricEngineError, Result};
use crate::lineage::{SourceLocation, SourceRef};
use crate::schema::{FilingType, PeriodKey, StatementKind};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type AccountSeries = BTreeMap<PeriodKey, Option<f64>>;

/// One parsed statement: account tag -> period -> value. Values never change once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementTable {
    accounts: BTreeMap<String, AccountSeries>,
}

impl StatementTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = (S, PeriodKey, Option<f64>)>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for (account, period, value) in rows {
            table.insert(account, period, value);
        }
        table
    }

    pub fn insert(&mut self, account: impl Into<String>, period: PeriodKey, value: Option<f64>) {
        self.accounts
            .entry(account.into())
            .or_default()
            .insert(period, value);
    }

    /// Replaces the whole series for `account`.
    pub fn set_series(&mut self, account: impl Into<String>, series: AccountSeries) {
        self.accounts.insert(account.into(), series);
    }

    pub fn with_value(mut self, account: impl Into<String>, period: PeriodKey, value: f64) -> Self {
        self.insert(account, period, Some(value));
        self
    }

    pub fn get(&self, account: &str, period: PeriodKey) -> Option<f64> {
        self.accounts.get(account)?.get(&period).copied().flatten()
    }

    pub fn series(&self, account: &str) -> Option<&AccountSeries> {
        self.accounts.get(account)
    }

    /// Value at the latest period key present for the account, if that cell holds a value.
    pub fn latest(&self, account: &str) -> Option<(PeriodKey, f64)> {
        let (period, value) = self.accounts.get(account)?.iter().next_back()?;
        value.map(|v| (*period, v))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.accounts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Static synonym relation consulted on every lookup, e.g.
/// `InterestExpenseNonoperating -> InterestExpense`.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasTable {
    fallbacks: BTreeMap<String, Vec<String>>,
}

impl AliasTable {
    pub fn new(fallbacks: BTreeMap<String, Vec<String>>) -> Self {
        Self { fallbacks }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    /// The account itself followed by its synonyms.
    pub fn expand<'a>(&'a self, account: &'a str) -> Vec<&'a str> {
        let mut names = vec![account];
        if let Some(synonyms) = self.fallbacks.get(account) {
            names.extend(synonyms.iter().map(String::as_str));
        }
        names
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for AliasTable {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.account_aliases.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Option<f64>,
    pub source: Option<SourceRef>,
}

impl Resolution {
    fn missing() -> Self {
        Self {
            value: None,
            source: None,
        }
    }
}

/// The income, balance and cash-flow tables of one filing.
#[derive(Debug, Clone)]
pub struct TimeIndexedStore {
    filing: FilingType,
    tables: Vec<(StatementKind, StatementTable)>,
    aliases: AliasTable,
}

impl TimeIndexedStore {
    pub fn new(filing: FilingType) -> Self {
        Self {
            filing,
            tables: Vec::new(),
            aliases: AliasTable::default(),
        }
    }

    pub fn annual() -> Self {
        Self::new(FilingType::Annual)
    }

    pub fn interim() -> Self {
        Self::new(FilingType::Interim)
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    /// Replaces any table already registered for `kind`.
    pub fn with_table(mut self, kind: StatementKind, table: StatementTable) -> Self {
        self.insert_table(kind, table);
        self
    }

    pub fn insert_table(&mut self, kind: StatementKind, table: StatementTable) {
        match self.tables.iter_mut().find(|(k, _)| *k == kind) {
            Some(slot) => slot.1 = table,
            None => {
                self.tables.push((kind, table));
                self.tables.sort_by_key(|(k, _)| *k);
            }
        }
    }

    pub fn filing(&self) -> FilingType {
        self.filing
    }

    pub fn table(&self, kind: StatementKind) -> Option<&StatementTable> {
        self.tables.iter().find(|(k, _)| *k == kind).map(|(_, t)| t)
    }

    /// An entirely missing statement table is a structural failure.
    pub fn require_complete(&self) -> Result<()> {
        for kind in StatementKind::ALL {
            if self.table(kind).is_none() {
                return Err(MetricEngineError::MissingStatementTable {
                    statement: kind.to_string(),
                    filing: self.filing.to_string(),
                });
            }
        }
        Ok(())
    }

    /// First non-null value among `candidates` at exactly `period`. Each candidate walks the
    /// tables in statement order, trying the account and then its synonyms within each table. Annual stores never fall back to another year. Interim stores fall
    /// back to the latest date recorded for the account, flagging the source with a caveat.
    pub fn resolve<S: AsRef<str>>(&self, candidates: &[S], period: PeriodKey) -> Resolution {
        let period = self.normalize(period);

        for candidate in candidates {
            for (kind, table) in &self.tables {
                for account in self.aliases.expand(candidate.as_ref()) {
                    if let Some(value) = table.get(account, period) {
                        return Resolution {
                            value: Some(value),
                            source: Some(self.source_ref(*kind, account, period, value, None)),
                        };
                    }
                }
            }
        }

        if self.filing == FilingType::Interim {
            for candidate in candidates {
                for (kind, table) in &self.tables {
                    for account in self.aliases.expand(candidate.as_ref()) {
                        if let Some((latest, value)) = table.latest(account) {
                            warn!(
                                "{} has no value at {}; using latest available {} from {} table",
                                account, period, latest, kind
                            );
                            let caveat = format!(
                                "exact period {} absent; used latest available {}",
                                period, latest
                            );
                            return Resolution {
                                value: Some(value),
                                source: Some(self.source_ref(
                                    *kind,
                                    account,
                                    latest,
                                    value,
                                    Some(caveat),
                                )),
                            };
                        }
                    }
                }
            }
        }

        Resolution::missing()
    }

    fn normalize(&self, period: PeriodKey) -> PeriodKey {
        match (self.filing, period) {
            (FilingType::Annual, PeriodKey::Date(_)) => PeriodKey::Year(period.year()),
            _ => period,
        }
    }

    fn source_ref(
        &self,
        kind: StatementKind,
        account: &str,
        period: PeriodKey,
        value: f64,
        caveat: Option<String>,
    ) -> SourceRef {
        SourceRef {
            value,
            filing_type: self.filing,
            table: kind,
            period: period.source_label(),
            location: SourceLocation {
                row: account.to_string(),
                column: period.to_string(),
            },
            caveat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> PeriodKey {
        PeriodKey::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn annual_store() -> TimeIndexedStore {
        let income = StatementTable::new()
            .with_value("Revenues", PeriodKey::Year(2024), 120.0)
            .with_value("Revenues", PeriodKey::Year(2023), 100.0)
            .with_value("InterestExpense", PeriodKey::Year(2024), 7.0);
        let mut balance = StatementTable::new();
        balance.insert("StockholdersEquity", PeriodKey::Year(2024), None);
        balance.insert("StockholdersEquity", PeriodKey::Year(2023), Some(55.0));

        TimeIndexedStore::annual()
            .with_table(StatementKind::Income, income)
            .with_table(StatementKind::Balance, balance)
            .with_table(StatementKind::CashFlow, StatementTable::new())
    }

    #[test]
    fn test_exact_annual_lookup_with_source() {
        let store = annual_store();
        let res = store.resolve(&["Revenues"], PeriodKey::Year(2024));
        assert_eq!(res.value, Some(120.0));

        let source = res.source.unwrap();
        assert_eq!(source.table, StatementKind::Income);
        assert_eq!(source.period, "2024");
        assert_eq!(source.location.row, "Revenues");
        assert_eq!(source.filing_type, FilingType::Annual);
        assert!(source.caveat.is_none());
    }

    #[test]
    fn test_annual_has_no_cross_year_fallback() {
        let store = annual_store();
        let res = store.resolve(&["StockholdersEquity"], PeriodKey::Year(2024));
        assert_eq!(res.value, None);
        assert!(res.source.is_none());
    }

    #[test]
    fn test_candidates_tried_in_order() {
        let store = annual_store();
        let res = store.resolve(&["SalesRevenueNet", "Revenues"], PeriodKey::Year(2023));
        assert_eq!(res.value, Some(100.0));
        assert_eq!(res.source.unwrap().account_id(), "Revenues");
    }

    #[test]
    fn test_alias_fallback_chain() {
        let store = annual_store();
        let res = store.resolve(&["InterestExpenseNonoperating"], PeriodKey::Year(2024));
        assert_eq!(res.value, Some(7.0));
        assert_eq!(res.source.unwrap().account_id(), "InterestExpense");

        let no_alias = annual_store().with_aliases(AliasTable::empty());
        let res = no_alias.resolve(&["InterestExpenseNonoperating"], PeriodKey::Year(2024));
        assert_eq!(res.value, None);
    }

    #[test]
    fn test_tables_are_searched_before_synonyms() {
        let income = StatementTable::new().with_value("InterestExpense", PeriodKey::Year(2024), 7.0);
        let balance = StatementTable::new().with_value(
            "InterestExpenseNonoperating",
            PeriodKey::Year(2024),
            9.0,
        );
        let store = TimeIndexedStore::annual()
            .with_table(StatementKind::Balance, balance)
            .with_table(StatementKind::Income, income);

        let res = store.resolve(&["InterestExpenseNonoperating"], PeriodKey::Year(2024));
        assert_eq!(res.value, Some(7.0));
        let source = res.source.unwrap();
        assert_eq!(source.table, StatementKind::Income);
        assert_eq!(source.account_id(), "InterestExpense");
    }

    #[test]
    fn test_interim_falls_back_to_latest_date() {
        let balance = StatementTable::new()
            .with_value("CashAndCashEquivalents", date(2024, 12, 31), 40.0)
            .with_value("CashAndCashEquivalents", date(2024, 9, 30), 35.0);
        let store = TimeIndexedStore::interim().with_table(StatementKind::Balance, balance);

        let res = store.resolve(&["CashAndCashEquivalents"], date(2025, 3, 31));
        assert_eq!(res.value, Some(40.0));
        let source = res.source.unwrap();
        assert_eq!(source.location.column, "2024-12-31");
        assert_eq!(source.period, "Q4 2024");
        assert!(source.caveat.unwrap().contains("2025-03-31"));
    }

    #[test]
    fn test_interim_exact_match_beats_fallback() {
        let income = StatementTable::new()
            .with_value("Revenues", date(2025, 3, 31), 30.0)
            .with_value("Revenues", date(2025, 6, 30), 61.0);
        let store = TimeIndexedStore::interim().with_table(StatementKind::Income, income);

        let res = store.resolve(&["Revenues"], date(2025, 3, 31));
        assert_eq!(res.value, Some(30.0));
        let source = res.source.unwrap();
        assert_eq!(source.period, "Q1 2025");
        assert!(source.caveat.is_none());
    }

    #[test]
    fn test_require_complete() {
        assert!(annual_store().require_complete().is_ok());

        let partial = TimeIndexedStore::interim()
            .with_table(StatementKind::Income, StatementTable::new());
        let err = partial.require_complete().unwrap_err();
        assert!(matches!(
            err,
            MetricEngineError::MissingStatementTable { ref statement, .. } if statement == "balance"
        ));
    }
}
