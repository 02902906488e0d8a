use std::collections::HashMap;

use common::{quote_ident, PATH_COLUMN, RECORDS_TABLE};
use rusqlite::params_from_iter;
use serde::Serialize;
use tracing::info;

use super::{schema, Store};
use crate::unify::UnifiedTable;
use crate::LibraryError;

#[derive(Clone, Debug, Default, Serialize)]
pub struct PersistReport {
    pub upserted: usize,
    pub batches: usize,
    pub columns_added: Vec<String>,
}

/// Writes the table into `alib`, keyed by path. Existing rows keep their
/// rowid and are overwritten column by column; columns the table does not
/// carry are set to null. Nothing here is recorded as an edit.
pub fn persist(
    store: &mut Store,
    table: &UnifiedTable,
    batch_size: usize,
) -> Result<PersistReport, LibraryError> {
    let mut report = PersistReport::default();

    {
        let tx = store.connection_mut().transaction()?;
        report.columns_added = schema::ensure_records_table(&tx, table.columns())?;
        schema::install_triggers(&tx)?;
        tx.commit()?;
    }
    if table.is_empty() {
        return Ok(report);
    }

    let destination = store.columns()?;
    let by_name: HashMap<String, usize> = table
        .columns()
        .iter()
        .enumerate()
        .map(|(index, name)| (name.to_lowercase(), index))
        .collect();
    let mapping: Vec<Option<usize>> = destination
        .iter()
        .map(|column| by_name.get(&column.to_lowercase()).copied())
        .collect();
    let sql = upsert_sql(&destination);

    for chunk in table.rows().chunks(batch_size.max(1)) {
        let tx = store.connection_mut().transaction()?;
        schema::drop_triggers(&tx)?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in chunk {
                let values = mapping
                    .iter()
                    .map(|index| index.and_then(|index| row[index].as_deref()));
                stmt.execute(params_from_iter(values))?;
            }
        }
        schema::install_triggers(&tx)?;
        tx.commit()?;

        report.upserted += chunk.len();
        report.batches += 1;
        info!(
            "Stored {}/{} records",
            report.upserted,
            table.len()
        );
    }

    Ok(report)
}

fn upsert_sql(columns: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|name| quote_ident(name)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("?{}", n)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|name| !name.eq_ignore_ascii_case(PATH_COLUMN))
        .map(|name| format!("{0} = excluded.{0}", quote_ident(name)))
        .collect();
    let action = if updates.is_empty() {
        "NOTHING".to_string()
    } else {
        format!("UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO {}",
        RECORDS_TABLE,
        names.join(", "),
        placeholders.join(", "),
        quote_ident(PATH_COLUMN),
        action
    )
}
