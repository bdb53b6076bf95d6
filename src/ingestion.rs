use crate::error::{MetricEngineError, Result};
use crate::schema::{FilingType, PeriodKey, StatementKind};
use crate::store::{AccountSeries, AliasTable, StatementTable, TimeIndexedStore};
use log::{debug, info, warn};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Parses a `key,<period>,<period>...` statement export.
///
/// Annual exports are keyed by fiscal year; a full date header in an annual export is reduced
/// to its year. Interim exports must use `YYYY-MM-DD` headers. Empty or non-numeric cells are
/// absent values, unparseable headers are skipped, and a repeated account row replaces the
/// earlier one.
pub fn read_keyed_csv<R: Read>(reader: R, filing: FilingType) -> Result<StatementTable> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let key_column = headers.iter().position(|h| h == "key").unwrap_or(0);

    let mut columns: Vec<(usize, PeriodKey)> = Vec::new();
    for (idx, header) in headers.iter().enumerate() {
        if idx == key_column {
            continue;
        }
        match (header.parse::<PeriodKey>(), filing) {
            (Ok(key @ PeriodKey::Date(_)), FilingType::Annual) => {
                columns.push((idx, PeriodKey::Year(key.year())))
            }
            (Ok(PeriodKey::Year(_)), FilingType::Interim) => {
                warn!("Skipping year column '{}' in interim statement", header)
            }
            (Ok(period), _) => columns.push((idx, period)),
            (Err(_), _) => debug!("Skipping non-period column '{}'", header),
        }
    }

    let mut table = StatementTable::new();
    for record in csv_reader.records() {
        let record = record?;
        let Some(account) = record.get(key_column).filter(|k| !k.is_empty()) else {
            continue;
        };
        let series: AccountSeries = columns
            .iter()
            .map(|(idx, period)| {
                let value = record
                    .get(*idx)
                    .filter(|v| !v.is_empty())
                    .and_then(|v| v.parse::<f64>().ok());
                (*period, value)
            })
            .collect();
        table.set_series(account, series);
    }

    Ok(table)
}

pub fn load_statement_table(path: impl AsRef<Path>, filing: FilingType) -> Result<StatementTable> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let table = read_keyed_csv(file, filing)?;
    debug!("Loaded {} accounts from {}", table.len(), path.display());
    Ok(table)
}

/// Loads `income.csv`, `balance.csv` and `cashflow.csv` from one filing directory.
pub fn load_statement_dir(
    dir: impl AsRef<Path>,
    filing: FilingType,
    aliases: AliasTable,
) -> Result<TimeIndexedStore> {
    let dir = dir.as_ref();
    let mut store = TimeIndexedStore::new(filing).with_aliases(aliases);

    for kind in StatementKind::ALL {
        let path = dir.join(kind.file_name());
        if !path.exists() {
            return Err(MetricEngineError::MissingStatementTable {
                statement: kind.to_string(),
                filing: filing.to_string(),
            });
        }
        store.insert_table(kind, load_statement_table(&path, filing)?);
    }

    info!("Loaded {} statements from {}", filing, dir.display());
    Ok(store)
}
