//! Change notifications delivered to the trigger layer.

use super::{
    document::{DocumentRef, Fields},
    object::{CustomMetadata, Object},
};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by a storage change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Object was created, overwritten, or had its metadata updated.
    #[serde(rename = "exists")]
    CreatedOrUpdated,
    /// Object was deleted or moved away.
    #[serde(rename = "not_exists")]
    DeletedOrMoved,
}

/// A storage-change notification for a single object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObjectEvent {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    pub resource_state: ResourceState,
    /// Metageneration of the object at the time of the change.
    pub generation_sequence_number: i64,
    pub custom_metadata: CustomMetadata,
}

impl StorageObjectEvent {
    /// Build the event describing `object` in `bucket`.
    pub fn from_object(bucket: &str, object: &Object, resource_state: ResourceState) -> Self {
        Self {
            bucket: bucket.to_string(),
            path: object.key.clone(),
            content_type: object.content_type.clone().unwrap_or_default(),
            resource_state,
            generation_sequence_number: object.metageneration,
            custom_metadata: object.custom_metadata.0.clone(),
        }
    }

    /// Google-Cloud-Storage style URI for the object (`gs://bucket/path`).
    pub fn object_uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.path)
    }
}

/// Emitted when a new document is created in the document store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentCreatedEvent {
    pub document: DocumentRef,
    pub fields: Fields,
}

/// Everything the trigger dispatcher can route to a handler.
#[derive(Clone, Debug)]
pub enum TriggerEvent {
    StorageObjectChange(StorageObjectEvent),
    DocumentCreated(DocumentCreatedEvent),
}
