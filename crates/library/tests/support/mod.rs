//! Shared fixtures for the end-to-end pipeline tests.
//!
//! Files are real (empty-ish) files on disk so that scanning, existence checks
//! and modification times behave as in production; their tags live in the
//! in-memory [`FakeBackend`].

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use library::{
    run_import, ExportOptions, ExportPipeline, ExportSummary, ImportSummary, Store, SyncConfig,
};
use metadata::{MetadataError, RawTags, TagBackend, TagUpdate};
use tempfile::TempDir;

/// Tag storage keyed by canonical path. Files without an entry read as
/// corrupt.
#[derive(Default)]
pub struct FakeBackend {
    tags: Mutex<HashMap<PathBuf, Vec<(String, String)>>>,
    failing_writes: Mutex<HashSet<PathBuf>>,
    writes: Mutex<Vec<(PathBuf, TagUpdate)>>,
}

impl FakeBackend {
    pub fn set_tags(&self, path: &Path, tags: &[(&str, &str)]) {
        let entries = tags
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.tags.lock().unwrap().insert(canonical(path), entries);
    }

    pub fn forget(&self, path: &Path) {
        self.tags.lock().unwrap().remove(&canonical(path));
    }

    pub fn fail_writes_to(&self, path: &Path) {
        self.failing_writes.lock().unwrap().insert(canonical(path));
    }

    pub fn allow_writes_to(&self, path: &Path) {
        self.failing_writes.lock().unwrap().remove(&canonical(path));
    }

    pub fn writes(&self) -> Vec<(PathBuf, TagUpdate)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, path: &Path) -> Vec<TagUpdate> {
        let path = canonical(path);
        self.writes()
            .into_iter()
            .filter(|(written, _)| *written == path)
            .map(|(_, update)| update)
            .collect()
    }
}

impl TagBackend for FakeBackend {
    fn read(&self, path: &Path) -> Result<RawTags, MetadataError> {
        let tags = self.tags.lock().unwrap();
        match tags.get(&canonical(path)) {
            Some(entries) => Ok(RawTags {
                entries: entries.clone(),
                ..RawTags::default()
            }),
            None => Err(MetadataError::Unsupported(format!(
                "no tag block in {}",
                path.display()
            ))),
        }
    }

    fn write(&self, path: &Path, update: &TagUpdate) -> Result<(), MetadataError> {
        let path = canonical(path);
        if self.failing_writes.lock().unwrap().contains(&path) {
            return Err(MetadataError::Unsupported("read-only file".to_string()));
        }

        {
            let mut tags = self.tags.lock().unwrap();
            let entries = tags.entry(path.clone()).or_default();
            for (field, values) in update {
                entries.retain(|(name, _)| !name.eq_ignore_ascii_case(field));
                if let Some(values) = values {
                    for value in values {
                        entries.push((field.to_uppercase(), value.clone()));
                    }
                }
            }
        }

        // Touch the file like a real tag writer would.
        let mut file = fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"+")?;

        self.writes.lock().unwrap().push((path, update.clone()));
        Ok(())
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        batch_size: 2,
        cpu_budget: Some(2),
        export_batch_size: 2,
        ..SyncConfig::default()
    }
}

/// A music root plus a database file inside one temp dir.
pub struct TestLibrary {
    _dir: TempDir,
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub backend: Arc<FakeBackend>,
}

impl TestLibrary {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("music");
        fs::create_dir_all(&root).unwrap();
        let root = fs::canonicalize(&root).unwrap();
        let db_path = dir.path().join("library.db");
        Self {
            _dir: dir,
            root,
            db_path,
            backend: Arc::new(FakeBackend::default()),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Creates the file on disk with the given tags and returns its stored
    /// path string.
    pub fn add(&self, rel: &str, tags: &[(&str, &str)]) -> String {
        let path = self.write_file(rel);
        self.backend.set_tags(&path, tags);
        path.to_string_lossy().to_string()
    }

    /// Creates a file the backend cannot read.
    pub fn add_corrupt(&self, rel: &str) -> String {
        let path = self.write_file(rel);
        path.to_string_lossy().to_string()
    }

    fn write_file(&self, rel: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, b"audio").unwrap();
        path
    }

    pub fn store(&self) -> Store {
        Store::open(&self.db_path).unwrap()
    }

    pub fn import(&self, store: &mut Store) -> ImportSummary {
        self.import_roots(store, &[self.root.clone()])
    }

    pub fn import_roots(&self, store: &mut Store, roots: &[PathBuf]) -> ImportSummary {
        let backend: Arc<dyn TagBackend> = self.backend.clone();
        run_import(store, roots, &test_config(), backend).unwrap()
    }

    pub fn export(&self, store: &mut Store, dir: &Path) -> ExportSummary {
        self.export_with(store, dir, ExportOptions { batch_size: 2, preserve_mtime: true })
    }

    pub fn export_with(
        &self,
        store: &mut Store,
        dir: &Path,
        options: ExportOptions,
    ) -> ExportSummary {
        ExportPipeline::new(store, self.backend.as_ref(), options)
            .run(dir)
            .unwrap()
    }
}
