use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::LibraryError;

pub const CONFIG_ENV: &str = "TAGSYNC_CONFIG";
const CONFIG_FILE_NAME: &str = "tagsync.yaml";

pub const DEFAULT_BATCH_SIZE: usize = 4000;
pub const DEFAULT_EXPORT_BATCH_SIZE: usize = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Lower-case extensions without the leading dot.
    pub extensions: Vec<String>,
    /// Files per extraction batch and rows per persist transaction.
    pub batch_size: usize,
    /// Fixed worker count per volume. When unset the cpu budget is shared
    /// across the volumes that have work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers_per_volume: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_budget: Option<usize>,
    pub export_batch_size: usize,
    pub preserve_mtime: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            extensions: ["mp3", "flac", "wv", "ogg", "m4a", "aiff", "ape", "opus"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers_per_volume: None,
            cpu_budget: None,
            export_batch_size: DEFAULT_EXPORT_BATCH_SIZE,
            preserve_mtime: true,
        }
    }
}

impl SyncConfig {
    pub fn cpu_budget(&self) -> usize {
        match self.cpu_budget {
            Some(budget) if budget > 0 => budget,
            _ => thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
        }
    }

    /// Workers handed to each volume's pool when `active_volumes` volumes
    /// extract at the same time. Never less than one.
    pub fn workers_for(&self, active_volumes: usize) -> usize {
        if let Some(workers) = self.workers_per_volume.filter(|workers| *workers > 0) {
            return workers;
        }
        (self.cpu_budget() / active_volumes.max(1)).max(1)
    }

    fn normalize(&mut self) {
        let mut extensions: Vec<String> = self
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        extensions.sort();
        extensions.dedup();
        if extensions.is_empty() {
            warn!("Config lists no extensions; using the defaults");
            extensions = SyncConfig::default().extensions;
        }
        self.extensions = extensions;
        if self.batch_size == 0 {
            warn!("batch_size must be positive; using {}", DEFAULT_BATCH_SIZE);
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.export_batch_size == 0 {
            warn!(
                "export_batch_size must be positive; using {}",
                DEFAULT_EXPORT_BATCH_SIZE
            );
            self.export_batch_size = DEFAULT_EXPORT_BATCH_SIZE;
        }
        if self.workers_per_volume == Some(0) {
            warn!("workers_per_volume must be positive; sharing the cpu budget instead");
            self.workers_per_volume = None;
        }
        if self.cpu_budget == Some(0) {
            warn!("cpu_budget must be positive; using available parallelism");
            self.cpu_budget = None;
        }
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var(CONFIG_ENV) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME)),
        Err(_) => PathBuf::from(CONFIG_FILE_NAME),
    }
}

/// Loads the yaml config at `path`. A missing file yields the defaults and
/// `false`; an unreadable or malformed file is a setup failure.
pub fn load_config(path: &Path) -> Result<(SyncConfig, bool), LibraryError> {
    if !path.exists() {
        return Ok((SyncConfig::default(), false));
    }
    let contents = fs::read_to_string(path)
        .map_err(|err| LibraryError::Setup(format!("cannot read config {:?}: {}", path, err)))?;
    let mut config = parse_config(&contents)
        .map_err(|err| LibraryError::Setup(format!("malformed config {:?}: {}", path, err)))?;
    config.normalize();
    Ok((config, true))
}

fn parse_config(contents: &str) -> Result<SyncConfig, serde_yaml::Error> {
    if contents.trim().is_empty() {
        return Ok(SyncConfig::default());
    }
    serde_yaml::from_str(contents)
}

#[cfg(test)]
mod tests {
    use super::{load_config, parse_config, SyncConfig, DEFAULT_BATCH_SIZE};
    use crate::LibraryError;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = parse_config("batch_size: 10\ncpu_budget: 8\n").unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.cpu_budget, Some(8));
        assert_eq!(config.export_batch_size, 500);
        assert!(config.preserve_mtime);
        assert!(config.extensions.contains(&"flac".to_string()));
    }

    #[test]
    fn workers_split_the_cpu_budget() {
        let config = SyncConfig {
            cpu_budget: Some(8),
            ..SyncConfig::default()
        };
        assert_eq!(config.workers_for(1), 8);
        assert_eq!(config.workers_for(3), 2);
        assert_eq!(config.workers_for(20), 1);
        assert_eq!(config.workers_for(0), 8);

        let fixed = SyncConfig {
            workers_per_volume: Some(3),
            ..config
        };
        assert_eq!(fixed.workers_for(20), 3);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, loaded) = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert!(!loaded);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn extensions_are_normalized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagsync.yaml");
        std::fs::write(&path, "extensions: [\".FLAC\", mp3, mp3]\nbatch_size: 0\n").unwrap();
        let (config, loaded) = load_config(&path).unwrap();
        assert!(loaded);
        assert_eq!(config.extensions, vec!["flac", "mp3"]);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagsync.yaml");
        std::fs::write(&path, "batch_size: [not, a, number]\n").unwrap();
        assert!(matches!(load_config(&path), Err(LibraryError::Setup(_))));
    }
}
