use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::LibraryError;

/// Lists the audio files below one volume root.
#[derive(Clone, Debug)]
pub struct VolumeScanner {
    root: PathBuf,
    extensions: Vec<String>,
}

impl VolumeScanner {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fails when the root itself cannot be listed. Problems further down the
    /// tree are logged and skipped by [`VolumeScanner::files`].
    pub fn check_root(&self) -> Result<(), LibraryError> {
        fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|err| LibraryError::Scan {
                path: self.root.clone(),
                message: err.to_string(),
            })
    }

    /// Lazily yields every regular file whose extension is allowed. Symlinks
    /// are neither followed nor yielded.
    pub fn files(&self) -> impl Iterator<Item = PathBuf> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping unreadable entry under {:?}: {}", self.root, err);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(move |entry| self.is_audio(entry.path()))
            .map(|entry| entry.into_path())
    }

    pub fn collect(&self) -> Result<Vec<PathBuf>, LibraryError> {
        self.check_root()?;
        Ok(self.files().collect())
    }

    fn is_audio(&self, path: &Path) -> bool {
        match path.extension() {
            Some(ext) => {
                let ext = ext.to_string_lossy().to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }
}
