use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{
    quote_ident, CHANGELOG_TABLE, DIRPATH_COLUMN, DIRS_TABLE, DIRTY_COLUMN, PATH_COLUMN,
    RECORDS_TABLE,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::LibraryError;

mod persist;
pub mod schema;
mod session;
mod snapshot;

pub use persist::{persist, PersistReport};
pub use session::CleanupSession;
pub use snapshot::{drop_snapshot, ensure_snapshot, restore_from_snapshot, snapshot_exists};

/// Counts reported by `status`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub records: i64,
    pub dirty_records: i64,
    pub pending_edits: i64,
    pub dirty_dirs: i64,
    pub changelog_entries: i64,
    pub dirs_to_process: i64,
    pub snapshot: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangelogEntry {
    pub record_id: i64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub timestamp: String,
    pub job: Option<String>,
}

/// The relational store: one `alib` row per file plus the bookkeeping tables
/// around it.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Opens the database, creating the file when it does not exist yet.
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(LibraryError::Setup(format!(
                    "database directory {:?} does not exist",
                    parent
                )));
            }
        }
        let conn = Connection::open(path).map_err(|err| {
            LibraryError::Setup(format!("cannot open database {:?}: {}", path, err))
        })?;
        Self::prepare(conn, path)
    }

    /// Opens a database that must already exist.
    pub fn open_existing(path: &Path) -> Result<Self, LibraryError> {
        if !path.is_file() {
            return Err(LibraryError::Setup(format!(
                "database {:?} does not exist",
                path
            )));
        }
        Self::open(path)
    }

    pub fn open_in_memory() -> Result<Self, LibraryError> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn, Path::new(":memory:"))
    }

    fn prepare(conn: Connection, path: &Path) -> Result<Self, LibraryError> {
        conn.busy_timeout(Duration::from_secs(30))?;
        schema::ensure_support_tables(&conn)?;
        if schema::table_exists(&conn, RECORDS_TABLE)? {
            schema::install_triggers(&conn)?;
        }
        info!("Opened database {:?}", path);
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn has_records_table(&self) -> Result<bool, LibraryError> {
        schema::table_exists(&self.conn, RECORDS_TABLE)
    }

    pub fn columns(&self) -> Result<Vec<String>, LibraryError> {
        schema::table_columns(&self.conn, RECORDS_TABLE)
    }

    pub fn record_count(&self) -> Result<i64, LibraryError> {
        if !self.has_records_table()? {
            return Ok(0);
        }
        Ok(self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", RECORDS_TABLE),
            [],
            |row| row.get(0),
        )?)
    }

    /// Reads one stored value; `None` when the row or the value is absent.
    pub fn value(&self, path: &str, column: &str) -> Result<Option<String>, LibraryError> {
        let sql = format!(
            "SELECT CAST({} AS TEXT) FROM {} WHERE {} = ?1",
            quote_ident(column),
            RECORDS_TABLE,
            quote_ident(PATH_COLUMN)
        );
        let value = self
            .conn
            .query_row(&sql, params![path], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(value.flatten())
    }

    pub fn dirty_counter(&self, path: &str) -> Result<Option<i64>, LibraryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote_ident(DIRTY_COLUMN),
            RECORDS_TABLE,
            quote_ident(PATH_COLUMN)
        );
        let value = self
            .conn
            .query_row(&sql, params![path], |row| row.get::<_, Option<i64>>(0))
            .optional()?;
        Ok(value.flatten())
    }

    /// Paths with a non-null dirty counter whose path starts with `prefix`.
    pub fn dirty_paths(&self, prefix: &str) -> Result<Vec<String>, LibraryError> {
        if !self.has_records_table()? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {path} FROM {table}
             WHERE {dirty} IS NOT NULL AND substr({path}, 1, length(?1)) = ?1
             ORDER BY {path}",
            path = quote_ident(PATH_COLUMN),
            table = RECORDS_TABLE,
            dirty = quote_ident(DIRTY_COLUMN),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let paths = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    pub fn dirty_total(&self) -> Result<i64, LibraryError> {
        if !self.has_records_table()? {
            return Ok(0);
        }
        Ok(self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} IS NOT NULL",
                RECORDS_TABLE,
                quote_ident(DIRTY_COLUMN)
            ),
            [],
            |row| row.get(0),
        )?)
    }

    /// Resets the dirty counter once a file matches its record again.
    pub fn clear_dirty(&self, path: &str) -> Result<(), LibraryError> {
        self.conn.execute(
            &format!(
                "UPDATE {} SET {} = NULL WHERE {} = ?1",
                RECORDS_TABLE,
                quote_ident(DIRTY_COLUMN),
                quote_ident(PATH_COLUMN)
            ),
            params![path],
        )?;
        Ok(())
    }

    /// Queues directories for downstream tools.
    pub fn record_dirs<'a, I>(&mut self, dirs: I) -> Result<usize, LibraryError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "REPLACE INTO {} ({}) VALUES (?1)",
                DIRS_TABLE,
                quote_ident(DIRPATH_COLUMN)
            ))?;
            for dir in dirs {
                stmt.execute(params![dir])?;
                count += 1;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn dirs_to_process(&self) -> Result<Vec<String>, LibraryError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {dirpath} FROM {table} ORDER BY {dirpath}",
            dirpath = quote_ident(DIRPATH_COLUMN),
            table = DIRS_TABLE
        ))?;
        let dirs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dirs)
    }

    /// Changelog rows for one file, oldest first.
    pub fn changelog_for(&self, path: &str) -> Result<Vec<ChangelogEntry>, LibraryError> {
        let sql = format!(
            "SELECT c.alib_rowid, c.alib_column, c.old_value, c.new_value, c.timestamp, c.script
             FROM {changelog} c JOIN {table} a ON a.rowid = c.alib_rowid
             WHERE a.{path} = ?1
             ORDER BY c.rowid",
            changelog = CHANGELOG_TABLE,
            table = RECORDS_TABLE,
            path = quote_ident(PATH_COLUMN),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![path], |row| {
                Ok(ChangelogEntry {
                    record_id: row.get(0)?,
                    field: row.get(1)?,
                    old_value: row.get(2)?,
                    new_value: row.get(3)?,
                    timestamp: row.get(4)?,
                    job: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn status(&self) -> Result<StoreStatus, LibraryError> {
        let mut status = StoreStatus {
            changelog_entries: self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", CHANGELOG_TABLE),
                [],
                |row| row.get(0),
            )?,
            dirs_to_process: self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", DIRS_TABLE),
                [],
                |row| row.get(0),
            )?,
            snapshot: snapshot_exists(&self.conn)?,
            ..StoreStatus::default()
        };
        if !self.has_records_table()? {
            return Ok(status);
        }

        let sql = format!(
            "SELECT COUNT(*), COUNT({dirty}), COALESCE(SUM({dirty}), 0),
                    COUNT(DISTINCT CASE WHEN {dirty} IS NOT NULL THEN {dirpath} END)
             FROM {table}",
            dirty = quote_ident(DIRTY_COLUMN),
            dirpath = quote_ident(DIRPATH_COLUMN),
            table = RECORDS_TABLE,
        );
        let (records, dirty_records, pending_edits, dirty_dirs): (i64, i64, i64, i64) =
            self.conn.query_row(&sql, [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
        status.records = records;
        status.dirty_records = dirty_records;
        status.pending_edits = pending_edits;
        status.dirty_dirs = dirty_dirs;
        Ok(status)
    }
}
