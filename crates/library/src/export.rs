use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::Path;

use common::{
    dir_prefix, is_tracked_field, path_to_string, quote_ident, split_multi, MTIME_RAW_COLUMN,
    PATH_COLUMN, RECORDS_TABLE,
};
use metadata::{parse_mtime_raw, TagBackend, TagUpdate};
use rusqlite::params_from_iter;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_EXPORT_BATCH_SIZE;
use crate::store::{drop_snapshot, Store};
use crate::LibraryError;

#[derive(Clone, Debug)]
pub struct ExportOptions {
    pub batch_size: usize,
    /// Put the recorded modification time back after writing.
    pub preserve_mtime: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_EXPORT_BATCH_SIZE,
            preserve_mtime: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub candidates: usize,
    pub skipped_missing: usize,
    pub exported: usize,
    pub failed: usize,
    pub dirs_recorded: usize,
    pub snapshot_dropped: bool,
}

struct PendingFile {
    path: String,
    mtime_raw: Option<String>,
    update: TagUpdate,
}

/// Writes modified records back into their files. A file whose write fails
/// (or that no longer exists) keeps its dirty counter and is retried by the
/// next export.
pub struct ExportPipeline<'a> {
    store: &'a mut Store,
    backend: &'a dyn TagBackend,
    options: ExportOptions,
}

impl<'a> ExportPipeline<'a> {
    pub fn new(store: &'a mut Store, backend: &'a dyn TagBackend, options: ExportOptions) -> Self {
        Self {
            store,
            backend,
            options,
        }
    }

    pub fn run(&mut self, dir: &Path) -> Result<ExportSummary, LibraryError> {
        if !dir.is_dir() {
            return Err(LibraryError::Setup(format!(
                "export directory {:?} does not exist",
                dir
            )));
        }
        let mut summary = ExportSummary::default();
        let prefix = dir_prefix(dir);
        let candidates = self.store.dirty_paths(&prefix)?;
        summary.candidates = candidates.len();
        if candidates.is_empty() {
            info!("No modified records under {:?}", dir);
            return Ok(summary);
        }

        let (present, missing): (Vec<String>, Vec<String>) = candidates
            .into_iter()
            .partition(|path| Path::new(path).is_file());
        for path in &missing {
            debug!("Skipping {:?}: file no longer exists", path);
        }
        summary.skipped_missing = missing.len();
        if !missing.is_empty() {
            warn!(
                "{} modified records under {:?} have no file on disk; left pending",
                missing.len(),
                dir
            );
        }

        let columns = self.store.columns()?;
        let has_mtime = columns.iter().any(|name| name == MTIME_RAW_COLUMN);
        let tag_columns: Vec<String> = columns
            .into_iter()
            .filter(|name| is_tracked_field(name))
            .collect();

        let batch_size = self.options.batch_size.max(1);
        let total_batches = present.len().div_ceil(batch_size);
        let mut dirs = BTreeSet::new();
        for (index, chunk) in present.chunks(batch_size).enumerate() {
            let files = self.load_batch(chunk, &tag_columns, has_mtime)?;
            for file in files {
                if self.export_file(&file)? {
                    summary.exported += 1;
                    if let Some(parent) = Path::new(&file.path).parent() {
                        dirs.insert(path_to_string(parent));
                    }
                } else {
                    summary.failed += 1;
                }
            }
            info!(
                "Export batch {}/{} done ({} written, {} failed)",
                index + 1,
                total_batches,
                summary.exported,
                summary.failed
            );
        }

        summary.dirs_recorded = self.store.record_dirs(dirs.iter().map(String::as_str))?;

        let remaining = self.store.dirty_total()?;
        if remaining == 0 {
            summary.snapshot_dropped = drop_snapshot(self.store.connection())?;
            if summary.snapshot_dropped {
                info!("All changes exported; rollback snapshot dropped");
            }
        } else {
            info!(
                "{} modified records remain; rollback snapshot kept",
                remaining
            );
        }

        info!(
            "Export finished: {} written, {} failed, {} missing",
            summary.exported, summary.failed, summary.skipped_missing
        );
        Ok(summary)
    }

    fn load_batch(
        &self,
        paths: &[String],
        tag_columns: &[String],
        has_mtime: bool,
    ) -> Result<Vec<PendingFile>, LibraryError> {
        let mut select = vec![quote_ident(PATH_COLUMN)];
        select.push(if has_mtime {
            format!("CAST({} AS TEXT)", quote_ident(MTIME_RAW_COLUMN))
        } else {
            "NULL".to_string()
        });
        select.extend(
            tag_columns
                .iter()
                .map(|name| format!("CAST({} AS TEXT)", quote_ident(name))),
        );
        let placeholders: Vec<String> = (1..=paths.len()).map(|n| format!("?{}", n)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IN ({}) ORDER BY {}",
            select.join(", "),
            RECORDS_TABLE,
            quote_ident(PATH_COLUMN),
            placeholders.join(", "),
            quote_ident(PATH_COLUMN)
        );

        let conn = self.store.connection();
        let mut stmt = conn.prepare(&sql)?;
        let files = stmt
            .query_map(params_from_iter(paths.iter()), |row| {
                let mut update = TagUpdate::new();
                for (offset, name) in tag_columns.iter().enumerate() {
                    let value: Option<String> = row.get(offset + 2)?;
                    let values = value
                        .map(|value| split_multi(&value))
                        .filter(|parts| !parts.is_empty());
                    update.insert(name.clone(), values);
                }
                Ok(PendingFile {
                    path: row.get(0)?,
                    mtime_raw: row.get(1)?,
                    update,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Returns `Ok(false)` when the file could not be written; only database
    /// failures are errors.
    fn export_file(&mut self, file: &PendingFile) -> Result<bool, LibraryError> {
        let path = Path::new(&file.path);
        if let Err(err) = self.backend.write(path, &file.update) {
            warn!("Failed to write tags to {:?}: {}", path, err);
            return Ok(false);
        }
        if self.options.preserve_mtime {
            if let Some(raw) = file.mtime_raw.as_deref() {
                if let Err(err) = restore_mtime(path, raw) {
                    warn!("Failed to restore modification time of {:?}: {}", path, err);
                }
            }
        }
        self.store.clear_dirty(&file.path)?;
        Ok(true)
    }
}

fn restore_mtime(path: &Path, raw: &str) -> io::Result<()> {
    let time = parse_mtime_raw(raw).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unparseable modification time {:?}", raw),
        )
    })?;
    File::options().write(true).open(path)?.set_modified(time)
}

#[cfg(test)]
mod tests {
    use super::restore_mtime;
    use std::fs;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn restores_recorded_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.flac");
        fs::write(&file, b"abc").unwrap();

        restore_mtime(&file, "1600000000.5").unwrap();

        let modified = fs::metadata(&file).unwrap().modified().unwrap();
        assert_eq!(modified, UNIX_EPOCH + Duration::new(1_600_000_000, 500_000_000));
        assert_eq!(fs::read(&file).unwrap(), b"abc");
    }

    #[test]
    fn bad_mtime_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.flac");
        fs::write(&file, b"abc").unwrap();
        assert!(restore_mtime(&file, "yesterday").is_err());
    }
}
