use std::path::Path;

use lofty::config::WriteOptions;
use lofty::prelude::{AudioFile, ItemKey, TagExt, TaggedFileExt};
use lofty::tag::{ItemValue, Tag, TagItem, TagType};

use crate::{AudioProperties, MetadataError, RawTags, TagBackend, TagUpdate};

/// ID3v2.4 keeps multiple values of one frame in a single frame, separated
/// by NUL.
const ID3V2_VALUE_SEPARATOR: &str = "\0";

/// Tag access through lofty. Paths are always handed over as given, so no
/// working-directory changes are involved.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyBackend;

impl TagBackend for LoftyBackend {
    fn read(&self, path: &Path) -> Result<RawTags, MetadataError> {
        let tagged_file = lofty::read_from_path(path)?;
        let properties = tagged_file.properties();

        let duration_ms = properties.duration().as_millis();
        let mut raw = RawTags {
            entries: Vec::new(),
            properties: AudioProperties {
                length_ms: if duration_ms > 0 {
                    Some(duration_ms.min(u128::from(u64::MAX)) as u64)
                } else {
                    None
                },
                bitrate: properties.audio_bitrate().or(properties.overall_bitrate()),
                sample_rate: properties.sample_rate(),
                channels: properties.channels(),
                bit_depth: properties.bit_depth(),
                file_type: Some(format!("{:?}", tagged_file.file_type()).to_lowercase()),
            },
        };

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            for item in tag.items() {
                let text = match item.value() {
                    ItemValue::Text(text) | ItemValue::Locator(text) => text,
                    ItemValue::Binary(_) => continue,
                };
                // lofty surfaces an empty Vorbis vendor string as an encoder item
                if text.is_empty() {
                    continue;
                }
                raw.entries.push((field_name(item.key()), text.clone()));
            }
        }

        Ok(raw)
    }

    /// Applies the update to the primary tag, saves, and reads the file back.
    /// A field the format could not store is an error, so callers never treat
    /// a partial write as done.
    fn write(&self, path: &Path, update: &TagUpdate) -> Result<(), MetadataError> {
        let mut tagged_file = lofty::read_from_path(path)?;
        let tag_type = tagged_file.primary_tag_type();
        if tagged_file.primary_tag().is_none() {
            tagged_file.insert_tag(Tag::new(tag_type));
        }
        let tag = tagged_file
            .primary_tag_mut()
            .ok_or_else(|| MetadataError::NoTag(path.to_path_buf()))?;

        let mut expected = Vec::with_capacity(update.len());
        for (field, values) in update {
            let keys = FieldKeys::resolve(field);
            tag.retain(|item| !keys.matches(item.key()));
            let values: &[String] = values.as_deref().unwrap_or_default();
            for value in encode_values(tag_type, values) {
                keys.push(tag, value);
            }
            expected.push((field, keys, values));
        }
        tag.save_to_path(path, WriteOptions::default())?;

        let written = lofty::read_from_path(path)?;
        let tag = written.primary_tag();
        for (field, keys, values) in expected {
            let stored: Vec<&str> = tag
                .map(|tag| {
                    tag.items()
                        .filter(|item| keys.matches(item.key()))
                        .filter_map(|item| item.value().text())
                        .filter(|text| !text.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            let wanted = values.iter().map(String::as_str).filter(|text| !text.is_empty());
            if !stored.iter().copied().eq(wanted) {
                return Err(MetadataError::NotWritten {
                    path: path.to_path_buf(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }
}

/// The lofty keys a column name can live under: the mapped key when lofty
/// knows the name, and always the raw upper-case name.
struct FieldKeys {
    known: Option<ItemKey>,
    raw: ItemKey,
}

impl FieldKeys {
    fn resolve(field: &str) -> Self {
        let upper = field.to_ascii_uppercase();
        let known = match ItemKey::from_key(TagType::VorbisComments, &upper) {
            ItemKey::Unknown(_) => None,
            key => Some(key),
        };
        Self {
            known,
            raw: ItemKey::Unknown(upper),
        }
    }

    fn matches(&self, key: &ItemKey) -> bool {
        *key == self.raw || self.known.as_ref() == Some(key)
    }

    /// Pushes under the mapped key when the tag format has one, otherwise
    /// under the raw name (a plain Vorbis field, an ID3v2 `TXXX` frame).
    fn push(&self, tag: &mut Tag, value: String) {
        if let Some(known) = &self.known {
            if tag.push(TagItem::new(known.clone(), ItemValue::Text(value.clone()))) {
                return;
            }
        }
        tag.push_unchecked(TagItem::new(self.raw.clone(), ItemValue::Text(value)));
    }
}

fn encode_values(tag_type: TagType, values: &[String]) -> Vec<String> {
    if tag_type == TagType::Id3v2 && values.len() > 1 {
        vec![values.join(ID3V2_VALUE_SEPARATOR)]
    } else {
        values.to_vec()
    }
}

fn field_name(key: &ItemKey) -> String {
    match key {
        ItemKey::Unknown(name) => name.clone(),
        other => other
            .map_key(TagType::VorbisComments, false)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("{:?}", other)),
    }
}
