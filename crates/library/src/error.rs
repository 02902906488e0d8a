use std::path::PathBuf;

use thiserror::Error;

/// Only `Setup` and `Persistence` are allowed to end a run; everything that
/// concerns a single file or volume is absorbed and counted where it happens.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("setup error: {0}")]
    Setup(String),
    #[error("cannot scan {path:?}: {message}")]
    Scan { path: PathBuf, message: String },
    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker pool error: {0}")]
    Pool(String),
    #[error("field {0:?} cannot be edited")]
    InvalidField(String),
}
