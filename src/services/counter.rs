//! Optimistic read-modify-write on counter documents.

use crate::{
    models::document::{CommitOutcome, DocumentRef, DocumentSnapshot, WriteIntent},
    services::document_store::{DocumentStore, DocumentStoreError},
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("transaction on `{document}` still conflicting after {attempts} attempts")]
    TransactionConflict { document: DocumentRef, attempts: u32 },
    #[error("field `{field}` of `{document}` is not an incrementable non-negative integer: {value}")]
    InvalidCounter {
        document: DocumentRef,
        field: String,
        value: Value,
    },
    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

/// Run `build` against fresh snapshots of `doc` until its write commits or
/// `max_attempts` commits have conflicted. Returns the committed intent and
/// the new version.
pub async fn run_transaction<F>(
    store: &dyn DocumentStore,
    doc: &DocumentRef,
    max_attempts: u32,
    mut build: F,
) -> Result<(WriteIntent, i64), CounterError>
where
    F: FnMut(Option<&DocumentSnapshot>) -> Result<WriteIntent, CounterError>,
{
    for attempt in 1..=max_attempts {
        let snapshot = store.get_document(doc).await?;
        let intent = build(snapshot.as_ref())?;

        match store.commit(doc, intent.clone()).await? {
            CommitOutcome::Committed { version } => return Ok((intent, version)),
            CommitOutcome::Conflict => {
                debug!(document = %doc, attempt, max_attempts, "write conflict, retrying");
            }
        }
    }

    warn!(document = %doc, attempts = max_attempts, "giving up on conflicting transaction");
    Err(CounterError::TransactionConflict {
        document: doc.clone(),
        attempts: max_attempts,
    })
}

/// Increments one integer field of a document under optimistic concurrency.
#[derive(Clone)]
pub struct CounterTransaction {
    store: Arc<dyn DocumentStore>,
    field: String,
    max_attempts: u32,
}

impl CounterTransaction {
    pub fn new(store: Arc<dyn DocumentStore>, field: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            store,
            field: field.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Add one to the counter and return the committed value.
    ///
    /// A missing field counts as 0; a missing document is created with 1.
    pub async fn increment(&self, doc: &DocumentRef) -> Result<i64, CounterError> {
        let field = self.field.as_str();
        let (intent, version) = run_transaction(
            self.store.as_ref(),
            doc,
            self.max_attempts,
            |snapshot| {
                let (mut fields, expected_version) = match snapshot {
                    Some(s) => (s.fields.clone(), Some(s.version)),
                    None => (Default::default(), None),
                };
                let next = match fields.get(field) {
                    None | Some(Value::Null) => 1,
                    Some(value) => value
                        .as_i64()
                        .filter(|n| *n >= 0)
                        .and_then(|n| n.checked_add(1))
                        .ok_or_else(|| CounterError::InvalidCounter {
                            document: doc.clone(),
                            field: field.to_string(),
                            value: value.clone(),
                        })?,
                };
                fields.insert(field.to_string(), Value::from(next));
                Ok(WriteIntent {
                    expected_version,
                    fields,
                })
            },
        )
        .await?;

        let value = intent.fields.get(field).and_then(Value::as_i64).unwrap_or_default();
        debug!(document = %doc, field, value, version, "counter incremented");
        Ok(value)
    }
}
