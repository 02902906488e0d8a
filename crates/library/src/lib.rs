pub mod config;
pub mod coordinator;
mod error;
pub mod export;
pub mod ingest;
pub mod pool;
pub mod scan;
pub mod store;
pub mod unify;

pub use config::{config_path_from_env, load_config, SyncConfig};
pub use coordinator::{ExtractionResult, VolumeCoordinator, VolumeListing};
pub use error::LibraryError;
pub use export::{ExportOptions, ExportPipeline, ExportSummary};
pub use ingest::{run_import, validate_roots, ImportSummary};
pub use pool::{DriveWorkerPool, VolumeResult, VolumeStats};
pub use scan::VolumeScanner;
pub use store::{
    restore_from_snapshot, ChangelogEntry, CleanupSession, PersistReport, Store, StoreStatus,
};
pub use unify::{unify, UnifiedTable};
