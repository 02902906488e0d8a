use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::Attributes;
use metadata::{extract_file, TagBackend};
use serde::Serialize;
use tracing::{info, warn};

use crate::LibraryError;

/// Per-volume outcome of a run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VolumeStats {
    pub root: PathBuf,
    pub files: usize,
    pub processed: usize,
    pub failed: usize,
    pub batches: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VolumeStats {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn failed_volume(root: &Path, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(root)
        }
    }
}

#[derive(Debug)]
pub struct VolumeResult {
    pub stats: VolumeStats,
    pub records: Vec<Attributes>,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    records: Vec<Attributes>,
    processed: usize,
    failed: usize,
}

/// Extraction workers dedicated to one volume. Pools never share threads, so
/// a slow device only delays its own files.
pub struct DriveWorkerPool {
    root: PathBuf,
    workers: usize,
    batch_size: usize,
    backend: Arc<dyn TagBackend>,
}

impl DriveWorkerPool {
    pub fn new(
        root: impl Into<PathBuf>,
        workers: usize,
        batch_size: usize,
        backend: Arc<dyn TagBackend>,
    ) -> Self {
        Self {
            root: root.into(),
            workers: workers.max(1),
            batch_size: batch_size.max(1),
            backend,
        }
    }

    /// Extracts every file, one batch per task. Returns once all batches have
    /// reported back; a failing file is counted, never propagated.
    pub fn run(&self, mut files: Vec<PathBuf>) -> Result<VolumeResult, LibraryError> {
        files.sort();
        let mut stats = VolumeStats::new(&self.root);
        stats.files = files.len();
        if files.is_empty() {
            return Ok(VolumeResult {
                stats,
                records: Vec::new(),
            });
        }

        let label = self
            .root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(move |index| format!("extract-{}-{}", label, index))
            .build()
            .map_err(|err| LibraryError::Pool(err.to_string()))?;

        let batches: Vec<Vec<PathBuf>> = files
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let total = batches.len();
        stats.batches = total;
        info!(
            "Extracting {} files from {:?} in {} batches with {} workers",
            stats.files, self.root, total, self.workers
        );

        let (tx, rx) = crossbeam_channel::unbounded::<BatchOutcome>();
        for batch in batches {
            let tx = tx.clone();
            let backend = Arc::clone(&self.backend);
            pool.spawn(move || {
                let outcome = run_batch(backend.as_ref(), &batch);
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        let mut records = Vec::with_capacity(stats.files);
        for (completed, outcome) in rx.iter().enumerate() {
            stats.processed += outcome.processed;
            stats.failed += outcome.failed;
            records.extend(outcome.records);
            info!("{:?}: {}/{} batches done", self.root, completed + 1, total);
        }

        Ok(VolumeResult { stats, records })
    }
}

fn run_batch(backend: &dyn TagBackend, batch: &[PathBuf]) -> BatchOutcome {
    match catch_unwind(AssertUnwindSafe(|| extract_batch(backend, batch))) {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                "Batch of {} files panicked; retrying file by file",
                batch.len()
            );
            extract_isolated(backend, batch)
        }
    }
}

fn extract_batch(backend: &dyn TagBackend, batch: &[PathBuf]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for file in batch {
        match extract_file(backend, file) {
            Ok(attrs) => {
                outcome.records.push(attrs);
                outcome.processed += 1;
            }
            Err(err) => {
                warn!("Failed to read tags for {:?}: {}", file, err);
                outcome.failed += 1;
            }
        }
    }
    outcome
}

fn extract_isolated(backend: &dyn TagBackend, batch: &[PathBuf]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for file in batch {
        match catch_unwind(AssertUnwindSafe(|| extract_file(backend, file))) {
            Ok(Ok(attrs)) => {
                outcome.records.push(attrs);
                outcome.processed += 1;
            }
            Ok(Err(err)) => {
                warn!("Failed to read tags for {:?}: {}", file, err);
                outcome.failed += 1;
            }
            Err(_) => {
                warn!("Tag reader panicked on {:?}", file);
                outcome.failed += 1;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::DriveWorkerPool;
    use metadata::{MetadataError, RawTags, TagBackend, TagUpdate};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    /// Reads fine unless the file name says otherwise.
    struct NameBackend;

    impl TagBackend for NameBackend {
        fn read(&self, path: &Path) -> Result<RawTags, MetadataError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.starts_with("bad") {
                return Err(MetadataError::Unsupported(name));
            }
            if name.starts_with("boom") {
                panic!("decoder blew up on {}", name);
            }
            Ok(RawTags {
                entries: vec![("TITLE".to_string(), name)],
                ..RawTags::default()
            })
        }

        fn write(&self, _path: &Path, _update: &TagUpdate) -> Result<(), MetadataError> {
            Ok(())
        }
    }

    fn touch(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, b"x").unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn counts_processed_and_failed_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = touch(dir.path(), &["a.flac", "b.flac", "bad.flac", "c.flac", "d.flac"]);
        let pool = DriveWorkerPool::new(dir.path(), 2, 2, Arc::new(NameBackend));

        let result = pool.run(files).unwrap();

        assert_eq!(result.stats.files, 5);
        assert_eq!(result.stats.batches, 3);
        assert_eq!(result.stats.processed, 4);
        assert_eq!(result.stats.failed, 1);
        assert_eq!(result.records.len(), 4);
    }

    #[test]
    fn panicking_file_only_loses_itself() {
        let dir = tempfile::tempdir().unwrap();
        let files = touch(dir.path(), &["a.flac", "boom.flac", "c.flac"]);
        let pool = DriveWorkerPool::new(dir.path(), 1, 10, Arc::new(NameBackend));

        let result = pool.run(files).unwrap();

        assert_eq!(result.stats.processed, 2);
        assert_eq!(result.stats.failed, 1);
    }

    #[test]
    fn empty_volume_needs_no_workers() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DriveWorkerPool::new(dir.path(), 4, 10, Arc::new(NameBackend));
        let result = pool.run(Vec::new()).unwrap();
        assert_eq!(result.stats.batches, 0);
        assert!(result.records.is_empty());
    }
}
