use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use common::Attributes;
use metadata::TagBackend;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::pool::{DriveWorkerPool, VolumeResult, VolumeStats};
use crate::scan::VolumeScanner;
use crate::LibraryError;

/// File listing for one root. `files` is an error when the root could not be
/// listed at all.
#[derive(Debug)]
pub struct VolumeListing {
    pub root: PathBuf,
    pub files: Result<Vec<PathBuf>, String>,
}

#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub volumes: Vec<VolumeStats>,
    pub records: Vec<Attributes>,
}

impl ExtractionResult {
    pub fn processed(&self) -> usize {
        self.volumes.iter().map(|volume| volume.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.volumes.iter().map(|volume| volume.failed).sum()
    }
}

/// Runs scanning and extraction across all volumes. Each volume gets its own
/// thread for listing and its own worker pool for extraction; results are
/// only combined after every volume has finished.
pub struct VolumeCoordinator {
    config: SyncConfig,
    backend: Arc<dyn TagBackend>,
}

impl VolumeCoordinator {
    pub fn new(config: SyncConfig, backend: Arc<dyn TagBackend>) -> Self {
        Self { config, backend }
    }

    pub fn run(&self, roots: &[PathBuf]) -> ExtractionResult {
        let listings = self.list_volumes(roots);
        self.extract(listings)
    }

    pub fn list_volumes(&self, roots: &[PathBuf]) -> Vec<VolumeListing> {
        let extensions = &self.config.extensions;
        thread::scope(|scope| {
            let handles: Vec<_> = roots
                .iter()
                .map(|root| {
                    let handle = scope.spawn(move || {
                        VolumeScanner::new(root.clone(), extensions)
                            .collect()
                            .map_err(|err| err.to_string())
                    });
                    (root, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(root, handle)| {
                    let files = handle
                        .join()
                        .unwrap_or_else(|_| Err("scanner thread panicked".to_string()));
                    match &files {
                        Ok(files) => info!("Found {} audio files under {:?}", files.len(), root),
                        Err(err) => warn!("Volume {:?} could not be scanned: {}", root, err),
                    }
                    VolumeListing {
                        root: root.clone(),
                        files,
                    }
                })
                .collect()
        })
    }

    pub fn extract(&self, listings: Vec<VolumeListing>) -> ExtractionResult {
        let active = listings
            .iter()
            .filter(|listing| matches!(&listing.files, Ok(files) if !files.is_empty()))
            .count();
        let workers = self.config.workers_for(active);
        if active > 0 {
            info!(
                "Extracting {} volumes with {} workers each",
                active, workers
            );
        }

        let outcomes: Vec<VolumeOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = listings
                .into_iter()
                .map(|listing| match listing.files {
                    Err(err) => Pending::Done(VolumeStats::failed_volume(&listing.root, err)),
                    Ok(files) if files.is_empty() => {
                        Pending::Done(VolumeStats::new(&listing.root))
                    }
                    Ok(files) => {
                        let pool = DriveWorkerPool::new(
                            listing.root.clone(),
                            workers,
                            self.config.batch_size,
                            Arc::clone(&self.backend),
                        );
                        let handle = scope.spawn(move || pool.run(files));
                        Pending::Running(listing.root, handle)
                    }
                })
                .collect();

            handles
                .into_iter()
                .map(|pending| match pending {
                    Pending::Done(stats) => VolumeOutcome::Stats(stats),
                    Pending::Running(root, handle) => match handle.join() {
                        Ok(Ok(result)) => VolumeOutcome::Extracted(result),
                        Ok(Err(err)) => {
                            warn!("Volume {:?} failed: {}", root, err);
                            VolumeOutcome::Stats(VolumeStats::failed_volume(
                                &root,
                                err.to_string(),
                            ))
                        }
                        Err(_) => {
                            warn!("Volume {:?} worker thread panicked", root);
                            VolumeOutcome::Stats(VolumeStats::failed_volume(
                                &root,
                                "volume worker panicked",
                            ))
                        }
                    },
                })
                .collect()
        });

        let mut result = ExtractionResult::default();
        for outcome in outcomes {
            match outcome {
                VolumeOutcome::Stats(stats) => result.volumes.push(stats),
                VolumeOutcome::Extracted(volume) => {
                    result.volumes.push(volume.stats);
                    result.records.extend(volume.records);
                }
            }
        }
        result
    }
}

enum Pending<'scope> {
    Done(VolumeStats),
    Running(
        PathBuf,
        thread::ScopedJoinHandle<'scope, Result<VolumeResult, LibraryError>>,
    ),
}

enum VolumeOutcome {
    Stats(VolumeStats),
    Extracted(VolumeResult),
}
