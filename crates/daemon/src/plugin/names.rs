use std::sync::LazyLock;

use regex::Regex;

use common::types::{VolumeName, ADMIN_NAMESPACE, DEFAULT_SUBVOLUME};

const MAX_NAME_LEN: usize = 50;

static NAME_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_\-]+$").unwrap_or_else(|e| panic!("invalid name pattern: {}", e))
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NameError {
    #[error("volume name is empty")]
    Empty,
    #[error("invalid {part} {value:?}: use letters, digits, '_' and '-', at most {max} characters", max = MAX_NAME_LEN)]
    Invalid { part: &'static str, value: String },
    #[error("invalid volume name {0:?}: too many '/' separators")]
    TooManyParts(String),
}

/// A volume as docker refers to it: a dot plus the subvolume to expose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginVolume {
    pub name: VolumeName,
    pub subvolume: String,
}

fn check(part: &'static str, value: &str) -> Result<(), NameError> {
    if value.len() > MAX_NAME_LEN || !NAME_PART.is_match(value) {
        return Err(NameError::Invalid {
            part,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Parse `[namespace/]name[@subvolume]`.
///
/// The namespace defaults to the admin one and the subvolume to the default
///  subvolume.
pub fn parse_volume(raw: &str) -> Result<PluginVolume, NameError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(NameError::Empty);
    }

    let (volume, subvolume) = match raw.split_once('@') {
        Some((volume, subvolume)) => (volume, subvolume),
        None => (raw, DEFAULT_SUBVOLUME),
    };

    let (namespace, name) = match volume.split_once('/') {
        Some((_, rest)) if rest.contains('/') => {
            return Err(NameError::TooManyParts(raw.to_string()))
        }
        Some((namespace, name)) => (namespace, name),
        None => (ADMIN_NAMESPACE, volume),
    };

    check("namespace", namespace)?;
    check("name", name)?;
    check("subvolume", subvolume)?;

    Ok(PluginVolume {
        name: VolumeName::new(namespace, name),
        subvolume: subvolume.to_string(),
    })
}
