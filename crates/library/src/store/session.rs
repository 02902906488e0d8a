use common::{
    canonical_field_name, is_tracked_field, quote_ident, AttrValue, CHANGELOG_TABLE,
    CHANGE_CONTEXT_TABLE, PATH_COLUMN, RECORDS_TABLE,
};
use rusqlite::{params, Connection, Transaction};
use tracing::info;

use super::{schema, snapshot, Store};
use crate::LibraryError;

/// A cleanup job's unit of work. Every real field change made through the
/// session lands in the changelog under the job's name and bumps the row's
/// dirty counter. Dropping the session without `commit` discards all of it.
pub struct CleanupSession<'conn> {
    tx: Transaction<'conn>,
    job: String,
    changelog_start: i64,
}

impl<'conn> CleanupSession<'conn> {
    /// Takes the rollback snapshot if none exists yet, then opens the
    /// transaction.
    pub fn begin(store: &'conn mut Store, job: &str) -> Result<Self, LibraryError> {
        if !store.has_records_table()? {
            return Err(LibraryError::Setup(
                "the database holds no records yet; run an import first".to_string(),
            ));
        }
        if snapshot::ensure_snapshot(store.connection())? {
            info!("Took rollback snapshot before job {:?}", job);
        }

        let tx = store.connection_mut().transaction()?;
        set_job(&tx, Some(job))?;
        let changelog_start: i64 = tx.query_row(
            &format!("SELECT COALESCE(MAX(rowid), 0) FROM {}", CHANGELOG_TABLE),
            [],
            |row| row.get(0),
        )?;
        Ok(Self {
            tx,
            job: job.to_string(),
            changelog_start,
        })
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Sets one field of the record at `path`. `None` (or a blank value)
    /// clears it. Returns whether a record with that path exists. Unknown
    /// fields get a new column; internal fields are refused.
    pub fn set_field(
        &mut self,
        path: &str,
        field: &str,
        value: Option<&AttrValue>,
    ) -> Result<bool, LibraryError> {
        let column = match canonical_field_name(field) {
            Some(name) if name == field && is_tracked_field(&name) => name,
            _ => return Err(LibraryError::InvalidField(field.to_string())),
        };
        schema::ensure_column(&self.tx, &column)?;

        let stored = value.and_then(|value| value.to_stored());
        let changed = self.tx.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                RECORDS_TABLE,
                quote_ident(&column),
                quote_ident(PATH_COLUMN)
            ),
            params![stored, path],
        )?;
        Ok(changed > 0)
    }

    /// Changelog rows written by this session so far.
    pub fn changes(&self) -> Result<i64, LibraryError> {
        Ok(self.tx.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE rowid > ?1", CHANGELOG_TABLE),
            params![self.changelog_start],
            |row| row.get(0),
        )?)
    }

    pub fn commit(self) -> Result<i64, LibraryError> {
        let changes = self.changes()?;
        set_job(&self.tx, None)?;
        self.tx.commit()?;
        info!("Job {:?} committed {} field changes", self.job, changes);
        Ok(changes)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.tx
    }
}

fn set_job(conn: &Connection, job: Option<&str>) -> Result<(), LibraryError> {
    conn.execute(
        &format!("UPDATE {} SET job = ?1 WHERE id = 1", CHANGE_CONTEXT_TABLE),
        params![job],
    )?;
    Ok(())
}
