//! Byte-stream view over stored objects.
//!
//! `ObjectStore` is the seam between the pipeline and whatever holds the
//! object payloads. Reads hand out a fresh stream (own cursor) on every call,
//! writes consume a stream, and metadata updates never touch the payload.

use crate::{
    models::object::{MetadataUpdate, Object, WriteOptions},
    services::storage_service::StorageResult,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use std::io;

/// Owned, sendable stream of payload chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Open a new read stream positioned at the start of the object.
    async fn open_read_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream>;

    /// Write `body` as the new content of `bucket/key`, replacing any
    /// previous content and custom metadata.
    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        options: WriteOptions,
        body: ByteStream,
    ) -> StorageResult<Object>;

    /// Merge `update` into the object's metadata without rewriting content.
    async fn set_metadata(
        &self,
        bucket: &str,
        key: &str,
        update: MetadataUpdate,
    ) -> StorageResult<Object>;

    /// Current metadata of the object.
    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<Object>;
}

/// Wrap an in-memory buffer as a single-chunk stream.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    futures::stream::once(futures::future::ready(Ok(data.into()))).boxed()
}

/// Drain a stream into one contiguous buffer.
pub async fn collect_bytes(mut stream: ByteStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_joins_chunks_in_order() {
        let chunks = vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"")),
            Ok(Bytes::from_static(b"cd")),
        ];
        let stream = futures::stream::iter(chunks).boxed();
        assert_eq!(collect_bytes(stream).await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn collect_surfaces_stream_errors() {
        let chunks = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(io::Error::other("connection reset")),
        ];
        let stream = futures::stream::iter(chunks).boxed();
        let err = collect_bytes(stream).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }
}
