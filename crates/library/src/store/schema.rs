use std::collections::HashSet;

use common::{
    is_tracked_field, quote_ident, CHANGELOG_TABLE, CHANGE_CONTEXT_TABLE, DIRS_TABLE,
    DIRPATH_COLUMN, DIRTY_COLUMN, PATH_COLUMN, RECORDS_TABLE,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::LibraryError;

const TRIGGER_PREFIX: &str = "changetrack_";

/// Columns every records table starts with, in creation order. Discovered
/// attributes are appended after these.
pub const BASE_COLUMNS: &[&str] = &[
    PATH_COLUMN,
    DIRPATH_COLUMN,
    "__dirname",
    "__filename",
    "__filename_no_ext",
    "__ext",
    "__filetype",
    "__file_size_bytes",
    "__file_mod_datetime",
    "__file_mod_datetime_raw",
    "__file_create_datetime",
    "__length",
    "__bitrate",
    "__frequency",
    "__channels",
    "__bitspersample",
    DIRTY_COLUMN,
    "title",
    "subtitle",
    "artist",
    "albumartist",
    "album",
    "discsubtitle",
    "composer",
    "arranger",
    "lyricist",
    "writer",
    "conductor",
    "performer",
    "ensemble",
    "producer",
    "engineer",
    "mixer",
    "remixer",
    "genre",
    "style",
    "mood",
    "date",
    "year",
    "originaldate",
    "releasetype",
    "compilation",
    "live",
    "label",
    "catalognumber",
    "barcode",
    "isrc",
    "tracknumber",
    "tracktotal",
    "discnumber",
    "disctotal",
    "work",
    "movement",
    "part",
    "comment",
    "lyrics",
    "musicbrainz_artistid",
    "musicbrainz_albumartistid",
    "musicbrainz_albumid",
    "musicbrainz_releasegroupid",
    "musicbrainz_trackid",
    "musicbrainz_workid",
    "replaygain_album_gain",
    "replaygain_album_peak",
    "replaygain_track_gain",
    "replaygain_track_peak",
];

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, LibraryError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Column names of `table` in declaration order; empty when it does not exist.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, LibraryError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Changelog, export queue and change context. Safe to run on every open.
pub fn ensure_support_tables(conn: &Connection) -> Result<(), LibraryError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {changelog} (
             alib_rowid INTEGER,
             alib_column TEXT,
             old_value TEXT,
             new_value TEXT,
             timestamp TEXT,
             script TEXT
         );
         CREATE TABLE IF NOT EXISTS {dirs} ({dirpath} TEXT PRIMARY KEY);
         CREATE TABLE IF NOT EXISTS {context} (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             job TEXT
         );
         INSERT OR IGNORE INTO {context} (id, job) VALUES (1, NULL);",
        changelog = CHANGELOG_TABLE,
        dirs = DIRS_TABLE,
        dirpath = quote_ident(DIRPATH_COLUMN),
        context = CHANGE_CONTEXT_TABLE,
    ))?;
    Ok(())
}

/// Makes sure the records table holds every base column plus `observed`.
/// Creates the table when missing, otherwise only adds columns. Returns the
/// columns that were created.
pub fn ensure_records_table(
    conn: &Connection,
    observed: &[String],
) -> Result<Vec<String>, LibraryError> {
    let mut required: Vec<String> = BASE_COLUMNS.iter().map(|name| name.to_string()).collect();
    let mut known: HashSet<String> = required.iter().map(|name| name.to_lowercase()).collect();
    for name in observed {
        if known.insert(name.to_lowercase()) {
            required.push(name.clone());
        }
    }

    let existing = table_columns(conn, RECORDS_TABLE)?;
    if existing.is_empty() {
        let definitions: Vec<String> = required.iter().map(|name| column_definition(name)).collect();
        conn.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            RECORDS_TABLE,
            definitions.join(", ")
        ))?;
        info!("Created {} with {} columns", RECORDS_TABLE, required.len());
        ensure_indexes(conn)?;
        return Ok(required);
    }

    let existing: HashSet<String> = existing.iter().map(|name| name.to_lowercase()).collect();
    let mut added = Vec::new();
    for name in required {
        if existing.contains(&name.to_lowercase()) {
            continue;
        }
        add_column(conn, &name)?;
        added.push(name);
    }
    if !added.is_empty() {
        info!("Added {} columns to {}: {:?}", added.len(), RECORDS_TABLE, added);
    }
    ensure_indexes(conn)?;
    Ok(added)
}

/// Adds a single column when missing and gives it a change trigger.
pub fn ensure_column(conn: &Connection, name: &str) -> Result<bool, LibraryError> {
    let exists = table_columns(conn, RECORDS_TABLE)?
        .iter()
        .any(|column| column.eq_ignore_ascii_case(name));
    if exists {
        return Ok(false);
    }
    add_column(conn, name)?;
    install_trigger(conn, name)?;
    Ok(true)
}

fn add_column(conn: &Connection, name: &str) -> Result<(), LibraryError> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {}",
        RECORDS_TABLE,
        column_definition(name)
    ))?;
    Ok(())
}

fn column_definition(name: &str) -> String {
    if name == PATH_COLUMN {
        format!("{} TEXT PRIMARY KEY", quote_ident(name))
    } else if name == DIRTY_COLUMN {
        format!("{} INTEGER", quote_ident(name))
    } else {
        format!("{} TEXT", quote_ident(name))
    }
}

/// The unique path index lets upserts target tables that were created
/// without a primary key.
fn ensure_indexes(conn: &Connection) -> Result<(), LibraryError> {
    conn.execute_batch(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_path_idx ON {table} ({path});
         CREATE INDEX IF NOT EXISTS {table}_dirty_idx ON {table} ({dirty});",
        table = RECORDS_TABLE,
        path = quote_ident(PATH_COLUMN),
        dirty = quote_ident(DIRTY_COLUMN),
    ))?;
    Ok(())
}

fn trigger_name(column: &str) -> String {
    quote_ident(&format!("{}{}", TRIGGER_PREFIX, column))
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// One trigger per tracked column. An update that really changes the value
/// appends a changelog row and bumps the row's dirty counter.
fn install_trigger(conn: &Connection, column: &str) -> Result<(), LibraryError> {
    if !is_tracked_field(column) {
        return Ok(());
    }
    let col = quote_ident(column);
    conn.execute_batch(&format!(
        "CREATE TRIGGER IF NOT EXISTS {name}
         AFTER UPDATE OF {col} ON {table}
         FOR EACH ROW WHEN OLD.{col} IS NOT NEW.{col}
         BEGIN
             INSERT INTO {changelog} (alib_rowid, alib_column, old_value, new_value, timestamp, script)
             VALUES (
                 NEW.rowid,
                 {literal},
                 OLD.{col},
                 NEW.{col},
                 strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                 (SELECT job FROM {context} WHERE id = 1)
             );
             UPDATE {table} SET {dirty} = COALESCE({dirty}, 0) + 1 WHERE rowid = NEW.rowid;
         END;",
        name = trigger_name(column),
        col = col,
        table = RECORDS_TABLE,
        changelog = CHANGELOG_TABLE,
        literal = sql_literal(column),
        context = CHANGE_CONTEXT_TABLE,
        dirty = quote_ident(DIRTY_COLUMN),
    ))?;
    Ok(())
}

/// Installs change triggers for every tracked column of the records table.
pub fn install_triggers(conn: &Connection) -> Result<usize, LibraryError> {
    let columns = table_columns(conn, RECORDS_TABLE)?;
    let mut installed = 0;
    for column in columns.iter().filter(|column| is_tracked_field(column)) {
        install_trigger(conn, column)?;
        installed += 1;
    }
    debug!("Change triggers present on {} columns", installed);
    Ok(installed)
}

/// Removes all change triggers. Ingestion runs without them so that
/// re-reading files never counts as an edit.
pub fn drop_triggers(conn: &Connection) -> Result<usize, LibraryError> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'trigger' AND tbl_name = ?1 AND substr(name, 1, length(?2)) = ?2",
        )?;
        let rows = stmt.query_map(params![RECORDS_TABLE, TRIGGER_PREFIX], |row| {
            row.get::<_, String>(0)
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for name in &names {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))?;
    }
    Ok(names.len())
}

#[cfg(test)]
mod tests {
    use super::{
        drop_triggers, ensure_column, ensure_records_table, ensure_support_tables,
        install_triggers, table_columns, BASE_COLUMNS,
    };
    use rusqlite::Connection;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_support_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn creates_base_columns_then_observed() {
        let conn = conn();
        let created =
            ensure_records_table(&conn, &["__path".to_string(), "roonid".to_string()]).unwrap();
        let columns = table_columns(&conn, "alib").unwrap();

        assert_eq!(columns.len(), BASE_COLUMNS.len() + 1);
        assert_eq!(columns[0], "__path");
        assert_eq!(columns.last().map(String::as_str), Some("roonid"));
        assert_eq!(created, columns);
    }

    #[test]
    fn existing_table_only_grows() {
        let conn = conn();
        ensure_records_table(&conn, &["roonid".to_string()]).unwrap();
        let added = ensure_records_table(&conn, &["ROONID".to_string(), "extra".to_string()])
            .unwrap();
        assert_eq!(added, vec!["extra".to_string()]);
        assert!(ensure_records_table(&conn, &[]).unwrap().is_empty());
        assert!(table_columns(&conn, "alib").unwrap().contains(&"roonid".to_string()));
    }

    #[test]
    fn trigger_logs_real_changes_only() {
        let conn = conn();
        ensure_records_table(&conn, &[]).unwrap();
        install_triggers(&conn).unwrap();
        conn.execute("INSERT INTO alib (__path, artist) VALUES ('/m/a.flac', 'X')", [])
            .unwrap();

        conn.execute("UPDATE alib SET artist = 'X' WHERE __path = '/m/a.flac'", [])
            .unwrap();
        conn.execute(
            "UPDATE alib SET artist = 'X2', album = 'A' WHERE __path = '/m/a.flac'",
            [],
        )
        .unwrap();

        let dirty: i64 = conn
            .query_row("SELECT sqlmodded FROM alib", [], |row| row.get(0))
            .unwrap();
        let logged: i64 = conn
            .query_row("SELECT COUNT(*) FROM changelog", [], |row| row.get(0))
            .unwrap();
        assert_eq!(dirty, 2);
        assert_eq!(logged, 2);
    }

    #[test]
    fn internal_columns_are_not_tracked() {
        let conn = conn();
        ensure_records_table(&conn, &[]).unwrap();
        install_triggers(&conn).unwrap();
        conn.execute("INSERT INTO alib (__path, __bitrate) VALUES ('/m/a.flac', '320')", [])
            .unwrap();
        conn.execute("UPDATE alib SET __bitrate = '128'", []).unwrap();

        let dirty: Option<i64> = conn
            .query_row("SELECT sqlmodded FROM alib", [], |row| row.get(0))
            .unwrap();
        assert_eq!(dirty, None);
    }

    #[test]
    fn dropped_triggers_stop_tracking() {
        let conn = conn();
        ensure_records_table(&conn, &[]).unwrap();
        let installed = install_triggers(&conn).unwrap();
        assert_eq!(drop_triggers(&conn).unwrap(), installed);

        conn.execute("INSERT INTO alib (__path, title) VALUES ('/m/a.flac', 'old')", [])
            .unwrap();
        conn.execute("UPDATE alib SET title = 'new'", []).unwrap();
        let logged: i64 = conn
            .query_row("SELECT COUNT(*) FROM changelog", [], |row| row.get(0))
            .unwrap();
        assert_eq!(logged, 0);
    }

    #[test]
    fn added_column_is_tracked_immediately() {
        let conn = conn();
        ensure_records_table(&conn, &[]).unwrap();
        install_triggers(&conn).unwrap();
        conn.execute("INSERT INTO alib (__path) VALUES ('/m/a.flac')", []).unwrap();

        assert!(ensure_column(&conn, "roonid").unwrap());
        assert!(!ensure_column(&conn, "roonid").unwrap());
        conn.execute("UPDATE alib SET roonid = '42'", []).unwrap();

        let (column, new_value): (String, String) = conn
            .query_row("SELECT alib_column, new_value FROM changelog", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(column, "roonid");
        assert_eq!(new_value, "42");
    }
}
