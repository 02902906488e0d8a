use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use library::{
    config_path_from_env, load_config, restore_from_snapshot, run_import, ExportOptions,
    ExportPipeline, Store,
};
use metadata::{LoftyBackend, TagBackend};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tagsync", version, about = "Sync audio tags between volumes and a SQLite database")]
struct Cli {
    /// Config file; defaults to $TAGSYNC_CONFIG or tagsync.yaml next to the binary
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `library=debug`; overrides RUST_LOG
    #[arg(long, global = true)]
    log: Option<String>,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan volume roots and store every file's tags
    Import {
        db: PathBuf,
        #[arg(required = true)]
        roots: Vec<PathBuf>,
        /// Workers per volume instead of sharing the cpu budget
        #[arg(long)]
        workers: Option<usize>,
        /// Files per extraction batch
        #[arg(long = "chunk-size")]
        chunk_size: Option<usize>,
    },
    /// Write modified records under a directory back to their files
    Export {
        db: PathBuf,
        dir: PathBuf,
        /// Leave the modification time of written files at the write time
        #[arg(long = "ignore-lastmodded")]
        ignore_lastmodded: bool,
        #[arg(long = "batch-size")]
        batch_size: Option<usize>,
    },
    /// Restore records under a directory from the rollback snapshot
    Rollback { db: PathBuf, dir: PathBuf },
    /// Show record and pending-change counts
    Status { db: PathBuf },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = match cli.log.as_deref() {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(config_path_from_env);
    let (mut config, loaded) = load_config(&config_path)?;
    if loaded {
        info!("Loaded config from {:?}", config_path);
    }

    let json = cli.json;
    match cli.command {
        Command::Import {
            db,
            roots,
            workers,
            chunk_size,
        } => {
            match workers {
                Some(0) => warn!("--workers must be positive; ignoring"),
                Some(workers) => config.workers_per_volume = Some(workers),
                None => {}
            }
            match chunk_size {
                Some(0) => warn!("--chunk-size must be positive; ignoring"),
                Some(chunk_size) => config.batch_size = chunk_size,
                None => {}
            }
            let mut store = Store::open(&db)?;
            let backend: Arc<dyn TagBackend> = Arc::new(LoftyBackend);
            let summary = run_import(&mut store, &roots, &config, backend)?;
            if json {
                return Ok(print_json(&summary)?);
            }
            for volume in &summary.volumes {
                match &volume.error {
                    Some(err) => println!("{}: FAILED ({})", volume.root.display(), err),
                    None => println!(
                        "{}: {} files, {} read, {} failed",
                        volume.root.display(),
                        volume.files,
                        volume.processed,
                        volume.failed
                    ),
                }
            }
            println!(
                "Stored {} records ({} columns, {} new)",
                summary.stored,
                summary.columns,
                summary.columns_added.len()
            );
            if summary.failed_volumes() > 0 {
                warn!("{} volumes could not be imported", summary.failed_volumes());
            }
        }
        Command::Export {
            db,
            dir,
            ignore_lastmodded,
            batch_size,
        } => {
            let mut store = Store::open_existing(&db)?;
            if batch_size == Some(0) {
                warn!("--batch-size must be positive; ignoring");
            }
            let options = ExportOptions {
                batch_size: batch_size
                    .filter(|size| *size > 0)
                    .unwrap_or(config.export_batch_size),
                preserve_mtime: config.preserve_mtime && !ignore_lastmodded,
            };
            let backend = LoftyBackend;
            let summary = ExportPipeline::new(&mut store, &backend, options).run(&dir)?;
            if json {
                return Ok(print_json(&summary)?);
            }
            println!(
                "Exported {} of {} modified files ({} failed, {} missing)",
                summary.exported, summary.candidates, summary.failed, summary.skipped_missing
            );
            if summary.snapshot_dropped {
                println!("Rollback snapshot dropped");
            }
        }
        Command::Rollback { db, dir } => {
            let mut store = Store::open_existing(&db)?;
            let restored = restore_from_snapshot(&mut store, &dir)?;
            println!("Restored {} field values; run export to write them", restored);
        }
        Command::Status { db } => {
            let store = Store::open_existing(&db)?;
            let status = store.status()?;
            if json {
                return Ok(print_json(&status)?);
            }
            println!("records:          {}", status.records);
            println!("modified records: {}", status.dirty_records);
            println!("pending edits:    {}", status.pending_edits);
            println!("affected dirs:    {}", status.dirty_dirs);
            println!("changelog rows:   {}", status.changelog_entries);
            println!("queued dirs:      {}", status.dirs_to_process);
            println!(
                "rollback snapshot: {}",
                if status.snapshot { "present" } else { "none" }
            );
        }
    }

    Ok(())
}
