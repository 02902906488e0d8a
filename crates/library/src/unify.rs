use std::collections::{BTreeSet, HashSet};

use common::{Attributes, PATH_COLUMN};
use tracing::warn;

/// Records aligned to one column list. `columns[0]` is always the path
/// column; absent attributes are `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnifiedTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl UnifiedTable {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }
}

/// Builds the union of all attribute names and one row per record. When two
/// records carry the same path (overlapping roots) the first one wins.
pub fn unify(records: Vec<Attributes>) -> UnifiedTable {
    let mut names = BTreeSet::new();
    for record in &records {
        for name in record.keys() {
            if name != PATH_COLUMN {
                names.insert(name.clone());
            }
        }
    }

    let mut columns = Vec::with_capacity(names.len() + 1);
    columns.push(PATH_COLUMN.to_string());
    columns.extend(names);

    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let Some(path) = record.get(PATH_COLUMN).and_then(|value| value.to_stored()) else {
            warn!("Dropping record without a path");
            continue;
        };
        if !seen.insert(path.clone()) {
            warn!("Duplicate record for {:?}; keeping the first", path);
            continue;
        }
        let row: Vec<Option<String>> = columns
            .iter()
            .map(|column| record.get(column).and_then(|value| value.to_stored()))
            .collect();
        rows.push(row);
    }

    UnifiedTable { columns, rows }
}
