//! Move records and the counters they drive.

use crate::{
    errors::AppError,
    models::document::{DocumentRef, Fields},
    services::document_store::{DocumentStore, SqliteDocumentStore},
    triggers::{MOVER_FIELD, MOVES_COLLECTION},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct CreateMoveReq {
    pub mover: String,
}

#[derive(Debug, Serialize)]
pub struct CreateMoveResp {
    pub collection: String,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct CounterResp {
    pub collection: String,
    pub id: String,
    pub version: i64,
    pub fields: Fields,
}

/// `POST /moves` - store a completed move. Counting happens in the trigger.
pub async fn create_move(
    State(documents): State<SqliteDocumentStore>,
    Json(payload): Json<CreateMoveReq>,
) -> Result<impl IntoResponse, AppError> {
    let mover = payload.mover.trim();
    if mover.is_empty() {
        return Err(AppError::bad_request("`mover` must not be empty"));
    }

    let mut fields = Fields::new();
    fields.insert(MOVER_FIELD.into(), Value::from(mover));
    let doc = documents.create_document(MOVES_COLLECTION, fields).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMoveResp {
            collection: doc.collection,
            id: doc.id,
        }),
    ))
}

/// `GET /counters/{collection}/{id}`
pub async fn get_counter(
    State(documents): State<SqliteDocumentStore>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<CounterResp>, AppError> {
    let doc = DocumentRef::new(collection, id);
    let snapshot = documents
        .get_document(&doc)
        .await?
        .ok_or_else(|| AppError::not_found(format!("document `{doc}` not found")))?;

    Ok(Json(CounterResp {
        collection: doc.collection,
        id: doc.id,
        version: snapshot.version,
        fields: snapshot.fields,
    }))
}
