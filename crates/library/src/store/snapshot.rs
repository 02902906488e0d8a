use std::collections::HashSet;
use std::path::Path;

use common::{
    dir_prefix, is_tracked_field, quote_ident, PATH_COLUMN, RECORDS_TABLE, ROLLBACK_TABLE,
};
use rusqlite::{params, Connection};
use tracing::info;

use super::{schema, CleanupSession, Store};
use crate::LibraryError;

pub const ROLLBACK_JOB: &str = "rollback";

pub fn snapshot_exists(conn: &Connection) -> Result<bool, LibraryError> {
    schema::table_exists(conn, ROLLBACK_TABLE)
}

/// Copies the records table into the rollback table unless a snapshot is
/// already present. Returns whether a new snapshot was taken.
pub fn ensure_snapshot(conn: &Connection) -> Result<bool, LibraryError> {
    if snapshot_exists(conn)? {
        return Ok(false);
    }
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM {} ORDER BY {}",
        ROLLBACK_TABLE,
        RECORDS_TABLE,
        quote_ident(PATH_COLUMN)
    ))?;
    Ok(true)
}

pub fn drop_snapshot(conn: &Connection) -> Result<bool, LibraryError> {
    if !snapshot_exists(conn)? {
        return Ok(false);
    }
    conn.execute_batch(&format!("DROP TABLE {}", ROLLBACK_TABLE))?;
    Ok(true)
}

/// Puts every tracked field of the records under `dir` back to its snapshot
/// value. The restore is itself an edit: it is logged under the `rollback`
/// job and marks the restored rows dirty so the next export rewrites them.
pub fn restore_from_snapshot(store: &mut Store, dir: &Path) -> Result<i64, LibraryError> {
    if !snapshot_exists(store.connection())? {
        return Err(LibraryError::Setup(
            "no rollback snapshot is available".to_string(),
        ));
    }
    let snapshot_columns: HashSet<String> =
        schema::table_columns(store.connection(), ROLLBACK_TABLE)?
            .into_iter()
            .map(|name| name.to_lowercase())
            .collect();
    let columns: Vec<String> = store
        .columns()?
        .into_iter()
        .filter(|name| is_tracked_field(name) && snapshot_columns.contains(&name.to_lowercase()))
        .collect();
    let prefix = dir_prefix(dir);

    let session = CleanupSession::begin(store, ROLLBACK_JOB)?;
    let path = quote_ident(PATH_COLUMN);
    for column in &columns {
        let col = quote_ident(column);
        session.connection().execute(
            &format!(
                "UPDATE {table} SET {col} = (
                     SELECT r.{col} FROM {snapshot} r WHERE r.{path} = {table}.{path}
                 )
                 WHERE substr({path}, 1, length(?1)) = ?1
                   AND {path} IN (SELECT {path} FROM {snapshot})",
                table = RECORDS_TABLE,
                snapshot = ROLLBACK_TABLE,
                col = col,
                path = path,
            ),
            params![prefix],
        )?;
    }
    let changes = session.commit()?;
    info!("Restored {} field values under {:?}", changes, dir);
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::{drop_snapshot, ensure_snapshot, restore_from_snapshot, snapshot_exists};
    use crate::store::{persist, CleanupSession, Store};
    use crate::unify::unify;
    use crate::LibraryError;
    use common::{AttrValue, Attributes};
    use std::path::Path;

    fn store() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        let records = ["/m/a/1.flac", "/m/b/2.flac"]
            .iter()
            .map(|path| {
                let mut attrs = Attributes::new();
                attrs.insert("__path".to_string(), AttrValue::from(*path));
                attrs.insert("title".to_string(), AttrValue::from("orig"));
                attrs
            })
            .collect();
        persist(&mut store, &unify(records), 100).unwrap();
        store
    }

    fn edit_titles(store: &mut Store, value: &str) {
        let mut session = CleanupSession::begin(store, "retitle").unwrap();
        for path in ["/m/a/1.flac", "/m/b/2.flac"] {
            session
                .set_field(path, "title", Some(&AttrValue::from(value)))
                .unwrap();
        }
        session.commit().unwrap();
    }

    #[test]
    fn snapshot_is_taken_once() {
        let store = store();
        assert!(ensure_snapshot(store.connection()).unwrap());
        assert!(!ensure_snapshot(store.connection()).unwrap());
        assert!(drop_snapshot(store.connection()).unwrap());
        assert!(!snapshot_exists(store.connection()).unwrap());
    }

    #[test]
    fn later_jobs_keep_the_first_snapshot() {
        let mut store = store();
        edit_titles(&mut store, "first");
        edit_titles(&mut store, "second");
        let snapshot: String = store
            .connection()
            .query_row(
                "SELECT title FROM alib_rollback WHERE __path = '/m/a/1.flac'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(snapshot, "orig");
    }

    #[test]
    fn restore_is_limited_to_the_directory_and_tracked() {
        let mut store = store();
        edit_titles(&mut store, "edited");

        let changes = restore_from_snapshot(&mut store, Path::new("/m/a")).unwrap();

        assert_eq!(changes, 1);
        assert_eq!(store.value("/m/a/1.flac", "title").unwrap().as_deref(), Some("orig"));
        assert_eq!(store.value("/m/b/2.flac", "title").unwrap().as_deref(), Some("edited"));
        assert_eq!(store.dirty_counter("/m/a/1.flac").unwrap(), Some(2));
        let last = store.changelog_for("/m/a/1.flac").unwrap().pop().unwrap();
        assert_eq!(last.job.as_deref(), Some("rollback"));
        assert_eq!(last.new_value.as_deref(), Some("orig"));
    }

    #[test]
    fn restore_without_snapshot_fails() {
        let mut store = store();
        let result = restore_from_snapshot(&mut store, Path::new("/m"));
        assert!(matches!(result, Err(LibraryError::Setup(_))));
    }
}
