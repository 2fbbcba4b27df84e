//! Represents an object (file) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::collections::BTreeMap;
use uuid::Uuid;

/// User-defined key/value metadata carried alongside an object.
pub type CustomMetadata = BTreeMap<String, String>;

/// Metadata key the pipeline uses to mark an object as already moderated.
pub const IS_MODERATED_KEY: &str = "isModerated";

/// Returns a copy of `metadata` with the moderation flag set.
pub fn with_moderated_flag(metadata: &CustomMetadata) -> CustomMetadata {
    let mut merged = metadata.clone();
    merged.insert(IS_MODERATED_KEY.to_string(), "true".to_string());
    merged
}

/// Represents a single object (blob) within a bucket.
///
/// The struct stores the object's metadata, not the content bytes.
/// `generation` changes on every content write; `metageneration` restarts
/// at 1 with each new generation and increases on every metadata update.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the payload.
    pub etag: Option<String>,

    pub generation: i64,

    pub metageneration: i64,

    /// Custom metadata, stored as a JSON object.
    pub custom_metadata: Json<CustomMetadata>,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,
}

/// Options applied when writing object content.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    pub custom_metadata: CustomMetadata,
}

/// A metadata-only update. Custom metadata keys are merged into the
/// existing set; `content_type` replaces the stored value when present.
#[derive(Clone, Debug, Default)]
pub struct MetadataUpdate {
    pub content_type: Option<String>,
    pub custom_metadata: CustomMetadata,
}
