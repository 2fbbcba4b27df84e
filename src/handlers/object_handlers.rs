//! HTTP handlers for object and bucket operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::{
        bucket::Bucket,
        object::{CustomMetadata, IS_MODERATED_KEY, Object, WriteOptions},
    },
    services::storage_service::StorageService,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tokio_util::io::ReaderStream;

/// Request headers with this prefix become custom metadata entries.
pub const META_HEADER_PREFIX: &str = "x-goog-meta-";
const GENERATION_HEADER: &str = "x-goog-generation";
const METAGENERATION_HEADER: &str = "x-goog-metageneration";

/// Upload an object to `/{bucket}/{*key}`.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let options = WriteOptions {
        content_type,
        custom_metadata: custom_metadata_from_headers(&headers),
    };
    let object = service
        .upload_object_stream(&bucket, &key, options, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Some(value) = object
        .etag
        .as_ref()
        .and_then(|e| HeaderValue::from_str(&format!("\"{}\"", e)).ok())
    {
        response.headers_mut().insert(header::ETAG, value);
    }
    set_generation_headers(response.headers_mut(), &object);
    Ok(response)
}

/// Download an object `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, file) = service.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// HEAD `/{bucket}/{*key}` - same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let meta = service.get_object_metadata(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// DELETE `/{bucket}/{*key}`
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    service.delete_object(&bucket, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT `/{bucket}` - create bucket.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let created: Bucket = service.create_bucket(&bucket).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE `/{bucket}` - delete bucket.
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Collect `x-goog-meta-<name>` headers into `<name> -> value`.
fn custom_metadata_from_headers(headers: &HeaderMap) -> CustomMetadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let suffix = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((metadata_key(suffix), value.to_string()))
        })
        .collect()
}

/// Header names arrive lowercased; the moderation flag gets its canonical
/// case back.
fn metadata_key(header_suffix: &str) -> String {
    if header_suffix.eq_ignore_ascii_case(IS_MODERATED_KEY) {
        IS_MODERATED_KEY.to_string()
    } else {
        header_suffix.to_string()
    }
}

fn set_generation_headers(headers: &mut HeaderMap, meta: &Object) {
    headers.insert(
        HeaderName::from_static(GENERATION_HEADER),
        HeaderValue::from(meta.generation),
    );
    headers.insert(
        HeaderName::from_static(METAGENERATION_HEADER),
        HeaderValue::from(meta.metageneration),
    );
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0)),
    );

    if let Some(etag) = meta.etag.as_ref() {
        let quoted = format!("\"{}\"", etag);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    set_generation_headers(headers, meta);

    for (key, value) in meta.custom_metadata.iter() {
        let name = format!("{META_HEADER_PREFIX}{}", key.to_ascii_lowercase());
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_headers_become_custom_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-meta-owner", HeaderValue::from_static("u-1"));
        headers.insert("x-goog-meta-ismoderated", HeaderValue::from_static("false"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));

        let metadata = custom_metadata_from_headers(&headers);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.get("owner").map(String::as_str), Some("u-1"));
        assert_eq!(metadata.get("isModerated").map(String::as_str), Some("false"));
    }
}
