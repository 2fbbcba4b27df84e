//! Thumbnail size specs and the deterministic naming of their outputs.

use serde::{Deserialize, Serialize};

/// One derived size produced for every accepted image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailSpec {
    /// Appended to the source file stem as `_{suffix}`.
    pub suffix: String,
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSpec {
    pub fn new(suffix: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            suffix: suffix.into(),
            width,
            height,
        }
    }

    /// Destination key for the thumbnail of `source_key`:
    /// `photos/me.jpg` with suffix `small` becomes `photos/me_small.jpg`.
    pub fn thumbnail_key(&self, source_key: &str) -> String {
        let (dir, stem, ext) = split_key(source_key);
        format!("{dir}{stem}_{}{ext}", self.suffix)
    }

    /// True when `key` names an output of this spec.
    pub fn matches(&self, key: &str) -> bool {
        let (_, stem, _) = split_key(key);
        stem.len() > self.suffix.len()
            && stem
                .strip_suffix(self.suffix.as_str())
                .is_some_and(|rest| rest.ends_with('_'))
    }
}

/// The fixed, ordered spec set: large, medium, small.
pub fn default_specs() -> Vec<ThumbnailSpec> {
    vec![
        ThumbnailSpec::new("large", 200, 200),
        ThumbnailSpec::new("medium", 100, 100),
        ThumbnailSpec::new("small", 50, 50),
    ]
}

/// Split a key into (directory including trailing `/`, file stem, extension
/// including the leading `.`). Dotfiles keep their leading dot in the stem.
fn split_key(key: &str) -> (&str, &str, &str) {
    let (dir, file) = match key.rfind('/') {
        Some(idx) => key.split_at(idx + 1),
        None => ("", key),
    };
    match file.rfind('.') {
        Some(idx) if idx > 0 => {
            let (stem, ext) = file.split_at(idx);
            (dir, stem, ext)
        }
        _ => (dir, file, ""),
    }
}
