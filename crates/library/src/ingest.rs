use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use metadata::TagBackend;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::coordinator::VolumeCoordinator;
use crate::pool::VolumeStats;
use crate::store::{persist, Store};
use crate::unify::unify;
use crate::LibraryError;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ImportSummary {
    pub volumes: Vec<VolumeStats>,
    pub processed: usize,
    pub failed: usize,
    pub stored: usize,
    pub columns: usize,
    pub columns_added: Vec<String>,
}

impl ImportSummary {
    pub fn failed_volumes(&self) -> usize {
        self.volumes.iter().filter(|volume| volume.error.is_some()).count()
    }
}

/// Checks every root before any work starts. Roots must name existing
/// directories; they are canonicalized and de-duplicated.
pub fn validate_roots(roots: &[PathBuf]) -> Result<Vec<PathBuf>, LibraryError> {
    if roots.is_empty() {
        return Err(LibraryError::Setup("no volume roots given".to_string()));
    }
    let mut resolved: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        let meta = fs::metadata(root).map_err(|err| {
            LibraryError::Setup(format!("volume root {:?} is not accessible: {}", root, err))
        })?;
        if !meta.is_dir() {
            return Err(LibraryError::Setup(format!(
                "volume root {:?} is not a directory",
                root
            )));
        }
        let canonical = fs::canonicalize(root).unwrap_or_else(|_| root.clone());
        if resolved.contains(&canonical) {
            warn!("Volume root {:?} given more than once", canonical);
            continue;
        }
        resolved.push(canonical);
    }
    Ok(resolved)
}

/// Scans, extracts and stores every volume. Volume failures are reported in
/// the summary; only setup and database failures abort the import.
pub fn run_import(
    store: &mut Store,
    roots: &[PathBuf],
    config: &SyncConfig,
    backend: Arc<dyn TagBackend>,
) -> Result<ImportSummary, LibraryError> {
    let roots = validate_roots(roots)?;
    let started = Instant::now();

    let coordinator = VolumeCoordinator::new(config.clone(), backend);
    let extraction = coordinator.run(&roots);
    let mut summary = ImportSummary {
        processed: extraction.processed(),
        failed: extraction.failed(),
        volumes: extraction.volumes,
        ..ImportSummary::default()
    };
    info!(
        "Extracted {} files ({} failed) from {} volumes in {:.1}s",
        summary.processed,
        summary.failed,
        roots.len(),
        started.elapsed().as_secs_f64()
    );

    let table = unify(extraction.records);
    summary.columns = table.columns().len();
    if table.is_empty() {
        info!("Nothing to store");
        return Ok(summary);
    }

    let report = persist(store, &table, config.batch_size)?;
    summary.stored = report.upserted;
    summary.columns_added = report.columns_added;
    info!(
        "Stored {} records with {} columns in {:.1}s",
        summary.stored,
        summary.columns,
        started.elapsed().as_secs_f64()
    );
    Ok(summary)
}
