use std::collections::BTreeMap;
use std::path::{Path, MAIN_SEPARATOR};

use serde::{Deserialize, Serialize};

/// Separator between discrete entries of a multi-valued attribute once it is
/// stored as text: two backslash characters.
pub const MULTI_VALUE_DELIMITER: &str = "\\\\";

/// Attributes whose names start with this prefix are derived from the
/// filesystem or the audio stream and are never written back to tags.
pub const INTERNAL_PREFIX: &str = "__";

pub const RECORDS_TABLE: &str = "alib";
pub const CHANGELOG_TABLE: &str = "changelog";
pub const ROLLBACK_TABLE: &str = "alib_rollback";
pub const DIRS_TABLE: &str = "dirs_to_process";
pub const CHANGE_CONTEXT_TABLE: &str = "change_context";

pub const PATH_COLUMN: &str = "__path";
pub const DIRPATH_COLUMN: &str = "__dirpath";
pub const MTIME_RAW_COLUMN: &str = "__file_mod_datetime_raw";
pub const DIRTY_COLUMN: &str = "sqlmodded";

const RESERVED_NAMES: &[&str] = &[DIRTY_COLUMN, "rowid", "oid", "_rowid_"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Integer(i64),
    List(Vec<String>),
}

impl AttrValue {
    /// Text form used at the storage boundary. Blank text and lists without
    /// any non-blank entry become `None`, never an empty string.
    pub fn to_stored(&self) -> Option<String> {
        match self {
            AttrValue::Text(text) => {
                if text.trim().is_empty() {
                    None
                } else {
                    Some(text.clone())
                }
            }
            AttrValue::Integer(value) => Some(value.to_string()),
            AttrValue::List(values) => join_multi(values),
        }
    }

    /// Appends another observation of the same attribute, turning the value
    /// into an ordered list.
    pub fn merge(self, other: AttrValue) -> AttrValue {
        let mut values = self.into_entries();
        values.extend(other.into_entries());
        AttrValue::List(values)
    }

    fn into_entries(self) -> Vec<String> {
        match self {
            AttrValue::Text(text) => vec![text],
            AttrValue::Integer(value) => vec![value.to_string()],
            AttrValue::List(values) => values,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Integer(value)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(values: Vec<String>) -> Self {
        AttrValue::List(values)
    }
}

/// One file's flat attribute record. Key sets differ from file to file.
pub type Attributes = BTreeMap<String, AttrValue>;

pub fn join_multi<S: AsRef<str>>(values: &[S]) -> Option<String> {
    let parts: Vec<&str> = values
        .iter()
        .map(|value| value.as_ref())
        .filter(|value| !value.trim().is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(MULTI_VALUE_DELIMITER))
    }
}

pub fn split_multi(value: &str) -> Vec<String> {
    value
        .split(MULTI_VALUE_DELIMITER)
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.to_string())
        .collect()
}

pub fn is_internal_field(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

/// Fields that cleanup jobs edit and export writes back.
pub fn is_tracked_field(name: &str) -> bool {
    !is_internal_field(name) && name != DIRTY_COLUMN && name != PATH_COLUMN
}

/// Maps a raw tag name onto a safe, case-folded column name. Returns `None`
/// for names that are empty or collide with reserved identifiers.
pub fn canonical_field_name(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|ch| *ch != '"').collect();
    let name = cleaned.trim().trim_start_matches('_').to_lowercase();
    if name.is_empty() || RESERVED_NAMES.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Prefix used to select every record stored under `dir`.
pub fn dir_prefix(dir: &Path) -> String {
    let mut prefix = path_to_string(dir);
    while prefix.len() > 1 && prefix.ends_with(MAIN_SEPARATOR) {
        prefix.pop();
    }
    if !prefix.ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR);
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::{
        canonical_field_name, dir_prefix, is_tracked_field, join_multi, split_multi, AttrValue,
    };
    use std::path::Path;

    #[test]
    fn blank_values_are_stored_as_null() {
        assert_eq!(AttrValue::from("   ").to_stored(), None);
        assert_eq!(AttrValue::List(Vec::new()).to_stored(), None);
        assert_eq!(
            AttrValue::List(vec![" ".to_string(), "".to_string()]).to_stored(),
            None
        );
        assert_eq!(AttrValue::from("X").to_stored(), Some("X".to_string()));
    }

    #[test]
    fn lists_join_with_double_backslash() {
        let value = AttrValue::from(vec!["Y".to_string(), "Z".to_string()]);
        assert_eq!(value.to_stored(), Some("Y\\\\Z".to_string()));
        assert_eq!(join_multi(&["only"]), Some("only".to_string()));
    }

    #[test]
    fn split_reverses_join() {
        assert_eq!(split_multi("Y\\\\Z"), vec!["Y", "Z"]);
        assert_eq!(split_multi("single"), vec!["single"]);
        assert_eq!(split_multi("a\\b"), vec!["a\\b"]);
    }

    #[test]
    fn merge_builds_ordered_list() {
        let merged = AttrValue::from("a").merge(AttrValue::from(vec!["b".to_string()]));
        assert_eq!(merged, AttrValue::List(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn canonical_names_are_folded_and_filtered() {
        assert_eq!(canonical_field_name(" Album\"Artist "), Some("albumartist".to_string()));
        assert_eq!(canonical_field_name("__secret"), Some("secret".to_string()));
        assert_eq!(canonical_field_name("SQLMODDED"), None);
        assert_eq!(canonical_field_name("rowid"), None);
        assert_eq!(canonical_field_name("___"), None);
    }

    #[test]
    fn tracked_fields_exclude_reserved_columns() {
        assert!(is_tracked_field("artist"));
        assert!(!is_tracked_field("__path"));
        assert!(!is_tracked_field("__file_size_bytes"));
        assert!(!is_tracked_field("sqlmodded"));
    }

    #[cfg(unix)]
    #[test]
    fn dir_prefix_ends_with_separator() {
        assert_eq!(dir_prefix(Path::new("/music/")), "/music/");
        assert_eq!(dir_prefix(Path::new("/music")), "/music/");
        assert_eq!(dir_prefix(Path::new("/")), "/");
    }
}
