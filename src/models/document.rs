//! Documents held by the document store and the write intents used to
//! mutate them under optimistic concurrency control.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Field map of a document.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Address of a document: `{collection}/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub collection: String,
    pub id: String,
}

impl DocumentRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as read at a specific version.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DocumentSnapshot {
    pub fields: Fields,
    /// Starts at 1 on creation and increases by one on every committed write.
    pub version: i64,
}

/// A conditional write produced from a snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteIntent {
    /// Version the document must still have; `None` means it must not exist.
    pub expected_version: Option<i64>,
    /// Full field set to store.
    pub fields: Fields,
}

/// Result of committing a write intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { version: i64 },
    Conflict,
}
