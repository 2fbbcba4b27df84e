//! Document store with optimistic concurrency control.
//!
//! Each document row carries an integer `version`. Readers get the version
//! with the snapshot; writers commit conditionally on that version and learn
//! about concurrent writers through `CommitOutcome::Conflict`.

use crate::{
    models::{
        document::{CommitOutcome, DocumentRef, DocumentSnapshot, Fields, WriteIntent},
        event::{DocumentCreatedEvent, TriggerEvent},
    },
    services::storage_service::is_unique_violation,
    triggers::EventBus,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("document `{0}` already exists")]
    AlreadyExists(DocumentRef),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DocumentResult<T> = Result<T, DocumentStoreError>;

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get_document(&self, doc: &DocumentRef) -> DocumentResult<Option<DocumentSnapshot>>;

    /// Apply `intent` only if the document is still at `intent.expected_version`
    /// (or still absent when that is `None`).
    async fn commit(&self, doc: &DocumentRef, intent: WriteIntent) -> DocumentResult<CommitOutcome>;
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    fields: Json<Fields>,
    version: i64,
}

#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: Arc<SqlitePool>,
    events: Option<EventBus>,
}

impl SqliteDocumentStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db, events: None }
    }

    /// Publish document-created notifications on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Insert a new document with a generated id and announce it.
    pub async fn create_document(&self, collection: &str, fields: Fields) -> DocumentResult<DocumentRef> {
        let doc = DocumentRef::new(collection, Uuid::new_v4().to_string());
        let intent = WriteIntent {
            expected_version: None,
            fields: fields.clone(),
        };
        match self.commit(&doc, intent).await? {
            CommitOutcome::Committed { .. } => {}
            CommitOutcome::Conflict => return Err(DocumentStoreError::AlreadyExists(doc)),
        }

        if let Some(bus) = &self.events {
            bus.publish(TriggerEvent::DocumentCreated(DocumentCreatedEvent {
                document: doc.clone(),
                fields,
            }));
        }
        Ok(doc)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_document(&self, doc: &DocumentRef) -> DocumentResult<Option<DocumentSnapshot>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT fields, version FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(&doc.collection)
        .bind(&doc.id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(|row| DocumentSnapshot {
            fields: row.fields.0,
            version: row.version,
        }))
    }

    async fn commit(&self, doc: &DocumentRef, intent: WriteIntent) -> DocumentResult<CommitOutcome> {
        let now = Utc::now();
        match intent.expected_version {
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO documents (collection, id, fields, version, updated_at)
                     VALUES (?, ?, ?, 1, ?)",
                )
                .bind(&doc.collection)
                .bind(&doc.id)
                .bind(Json(&intent.fields))
                .bind(now)
                .execute(&*self.db)
                .await;

                match inserted {
                    Ok(_) => Ok(CommitOutcome::Committed { version: 1 }),
                    Err(err) if is_unique_violation(&err) => {
                        debug!(document = %doc, "create lost to a concurrent writer");
                        Ok(CommitOutcome::Conflict)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE documents SET fields = ?, version = version + 1, updated_at = ?
                     WHERE collection = ? AND id = ? AND version = ?",
                )
                .bind(Json(&intent.fields))
                .bind(now)
                .bind(&doc.collection)
                .bind(&doc.id)
                .bind(expected)
                .execute(&*self.db)
                .await?;

                if result.rows_affected() == 0 {
                    debug!(document = %doc, expected, "version moved since read");
                    Ok(CommitOutcome::Conflict)
                } else {
                    Ok(CommitOutcome::Committed {
                        version: expected + 1,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    async fn store() -> SqliteDocumentStore {
        SqliteDocumentStore::new(Arc::new(db::connect_in_memory().await.unwrap()))
    }

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_then_read_starts_at_version_one() {
        let store = store().await;
        let doc = DocumentRef::new("users", "u-1");
        let outcome = store
            .commit(
                &doc,
                WriteIntent {
                    expected_version: None,
                    fields: fields(json!({"movesCount": 0})),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { version: 1 });

        let snapshot = store.get_document(&doc).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.fields["movesCount"], json!(0));
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = store().await;
        let doc = DocumentRef::new("users", "u-2");
        let create = WriteIntent {
            expected_version: None,
            fields: fields(json!({"movesCount": 0})),
        };
        store.commit(&doc, create.clone()).await.unwrap();
        assert_eq!(store.commit(&doc, create).await.unwrap(), CommitOutcome::Conflict);

        let bump = |n: i64| WriteIntent {
            expected_version: Some(1),
            fields: fields(json!({"movesCount": n})),
        };
        assert_eq!(
            store.commit(&doc, bump(1)).await.unwrap(),
            CommitOutcome::Committed { version: 2 }
        );
        assert_eq!(store.commit(&doc, bump(5)).await.unwrap(), CommitOutcome::Conflict);

        let snapshot = store.get_document(&doc).await.unwrap().unwrap();
        assert_eq!(snapshot.fields["movesCount"], json!(1));
    }

    #[tokio::test]
    async fn create_document_publishes_event() {
        let (bus, mut rx) = EventBus::channel();
        let store = store().await.with_events(bus);
        let doc = store
            .create_document("completedMoves", fields(json!({"mover": "u-9"})))
            .await
            .unwrap();

        let Some(TriggerEvent::DocumentCreated(event)) = rx.recv().await else {
            panic!("expected a document event");
        };
        assert_eq!(event.document, doc);
        assert_eq!(event.fields["mover"], json!("u-9"));
    }

    #[tokio::test]
    async fn missing_document_reads_as_none() {
        let store = store().await;
        let doc = DocumentRef::new("users", "ghost");
        assert!(store.get_document(&doc).await.unwrap().is_none());
    }
}
