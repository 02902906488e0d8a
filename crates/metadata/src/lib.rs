use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{canonical_field_name, path_to_string, AttrValue, Attributes, PATH_COLUMN};
use lofty::error::LoftyError;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

mod backend;

pub use backend::LoftyBackend;

#[derive(Debug, Default, Clone)]
pub struct AudioProperties {
    pub length_ms: Option<u64>,
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bit_depth: Option<u8>,
    pub file_type: Option<String>,
}

/// What a tag reader returns for one file: raw `(name, value)` pairs in the
/// order the tag stores them, plus stream properties.
#[derive(Debug, Default, Clone)]
pub struct RawTags {
    pub entries: Vec<(String, String)>,
    pub properties: AudioProperties,
}

/// Field name -> new values. `None` removes the field from the file.
pub type TagUpdate = BTreeMap<String, Option<Vec<String>>>;

/// Reads and writes the tag block of a single audio file.
pub trait TagBackend: Send + Sync {
    fn read(&self, path: &Path) -> Result<RawTags, MetadataError>;
    fn write(&self, path: &Path, update: &TagUpdate) -> Result<(), MetadataError>;
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tag error: {0}")]
    Lofty(#[from] LoftyError),
    #[error("no writable tag in {0:?}")]
    NoTag(std::path::PathBuf),
    #[error("unsupported file: {0}")]
    Unsupported(String),
    #[error("{field} was not stored in {path:?}")]
    NotWritten {
        path: std::path::PathBuf,
        field: String,
    },
}

/// Produces the flat attribute record for one file: tag fields under their
/// canonical names plus `__`-prefixed filesystem and stream fields.
pub fn extract_file(backend: &dyn TagBackend, path: &Path) -> Result<Attributes, MetadataError> {
    let fs_meta = fs::metadata(path)?;
    let raw = backend.read(path)?;

    let mut attrs = Attributes::new();
    for (name, value) in raw.entries {
        let Some(field) = canonical_field_name(&name) else {
            debug!("Dropping tag {:?} from {:?}", name, path);
            continue;
        };
        let value = AttrValue::Text(value);
        let merged = match attrs.remove(&field) {
            Some(existing) => existing.merge(value),
            None => value,
        };
        attrs.insert(field, merged);
    }

    insert_path_fields(&mut attrs, path);
    attrs.insert(
        "__file_size_bytes".to_string(),
        AttrValue::Integer(i64::try_from(fs_meta.len()).unwrap_or(i64::MAX)),
    );
    if let Ok(modified) = fs_meta.modified() {
        if let Some(iso) = format_iso(modified) {
            attrs.insert("__file_mod_datetime".to_string(), AttrValue::Text(iso));
        }
        if let Some(raw) = format_mtime_raw(modified) {
            attrs.insert(common::MTIME_RAW_COLUMN.to_string(), AttrValue::Text(raw));
        }
    }
    if let Ok(created) = fs_meta.created() {
        if let Some(iso) = format_iso(created) {
            attrs.insert("__file_create_datetime".to_string(), AttrValue::Text(iso));
        }
    }

    let props = raw.properties;
    if let Some(length_ms) = props.length_ms {
        let seconds = length_ms as f64 / 1000.0;
        attrs.insert("__length".to_string(), AttrValue::Text(format!("{:.3}", seconds)));
    }
    if let Some(bitrate) = props.bitrate {
        attrs.insert("__bitrate".to_string(), AttrValue::Integer(i64::from(bitrate)));
    }
    if let Some(sample_rate) = props.sample_rate {
        attrs.insert("__frequency".to_string(), AttrValue::Integer(i64::from(sample_rate)));
    }
    if let Some(channels) = props.channels {
        attrs.insert("__channels".to_string(), AttrValue::Integer(i64::from(channels)));
    }
    if let Some(bit_depth) = props.bit_depth {
        attrs.insert("__bitspersample".to_string(), AttrValue::Integer(i64::from(bit_depth)));
    }
    if let Some(file_type) = props.file_type {
        attrs.insert("__filetype".to_string(), AttrValue::Text(file_type));
    }

    Ok(attrs)
}

fn insert_path_fields(attrs: &mut Attributes, path: &Path) {
    attrs.insert(PATH_COLUMN.to_string(), AttrValue::Text(path_to_string(path)));
    if let Some(parent) = path.parent() {
        attrs.insert(
            common::DIRPATH_COLUMN.to_string(),
            AttrValue::Text(path_to_string(parent)),
        );
        if let Some(dirname) = parent.file_name() {
            attrs.insert(
                "__dirname".to_string(),
                AttrValue::Text(dirname.to_string_lossy().to_string()),
            );
        }
    }
    if let Some(name) = path.file_name() {
        attrs.insert(
            "__filename".to_string(),
            AttrValue::Text(name.to_string_lossy().to_string()),
        );
    }
    if let Some(stem) = path.file_stem() {
        attrs.insert(
            "__filename_no_ext".to_string(),
            AttrValue::Text(stem.to_string_lossy().to_string()),
        );
    }
    if let Some(ext) = path.extension() {
        attrs.insert(
            "__ext".to_string(),
            AttrValue::Text(format!(".{}", ext.to_string_lossy().to_ascii_lowercase())),
        );
    }
}

fn format_iso(time: SystemTime) -> Option<String> {
    OffsetDateTime::from(time).format(&Rfc3339).ok()
}

/// Seconds since the epoch with nanosecond fraction, e.g. `1718000000.250000000`.
pub fn format_mtime_raw(time: SystemTime) -> Option<String> {
    let since = time.duration_since(UNIX_EPOCH).ok()?;
    Some(format!("{}.{:09}", since.as_secs(), since.subsec_nanos()))
}

/// Parses a stored raw modification time. Accepts any decimal seconds value,
/// including ones written with fewer fraction digits.
pub fn parse_mtime_raw(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    let (secs, frac) = match value.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (value, ""),
    };
    let secs: u64 = secs.parse().ok()?;
    let mut digits: String = frac.chars().take(9).collect();
    if !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos: u32 = digits.parse().ok()?;
    Some(UNIX_EPOCH + Duration::new(secs, nanos))
}
