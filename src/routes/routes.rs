//! Defines routes for the storage surface and the move records.
//!
//! ## Structure
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Move records**
//!   - `POST   /moves` - record a completed move
//!   - `GET    /counters/{collection}/{id}` - read a counter document
//!
//! - **Bucket-level endpoints**
//!   - `PUT    /{bucket}` - create bucket
//!   - `DELETE /{bucket}` - delete bucket
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}` - upload object
//!   - `GET    /{bucket}/{*key}` - download object
//!   - `HEAD   /{bucket}/{*key}` - retrieve metadata only
//!   - `DELETE /{bucket}/{*key}` - delete object
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.
//! Static segments win over `{bucket}`, and bucket names equal to them are
//! rejected at creation.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        move_handlers::{create_move, get_counter},
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_object, head_object, upload_object,
        },
    },
    services::{document_store::SqliteDocumentStore, storage_service::StorageService},
};
use axum::{
    Router,
    extract::FromRef,
    routing::{get, post, put},
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub documents: SqliteDocumentStore,
}

impl FromRef<AppState> for StorageService {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}

impl FromRef<AppState> for SqliteDocumentStore {
    fn from_ref(state: &AppState) -> Self {
        state.documents.clone()
    }
}

/// Build the router for every HTTP route.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/moves", post(create_move))
        .route("/counters/{collection}/{id}", get(get_counter))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        // Bucket-level routes
        .route("/{bucket}", put(create_bucket).delete(delete_bucket))
}
