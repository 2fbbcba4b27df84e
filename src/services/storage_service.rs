//! src/services/storage_service.rs
//!
//! StorageService - object storage backed by SQLite for metadata and local
//! disk for payloads sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`.
//! Every content write, metadata update and delete is published on the
//! event bus as a `StorageObjectEvent`.

use crate::{
    models::{
        bucket::Bucket,
        event::{ResourceState, StorageObjectEvent, TriggerEvent},
        object::{MetadataUpdate, Object, WriteOptions},
    },
    services::blob_stream::{ByteStream, ObjectStore},
    triggers::EventBus,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::{SqlitePool, types::Json};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// StorageService provides the object operations the pipeline relies on:
/// streaming upload, streaming read, metadata merge, stat and delete,
/// plus bucket creation/removal for the HTTP surface.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    events: Option<EventBus>,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
/// Path segments owned by non-bucket routes.
const RESERVED_BUCKET_NAMES: [&str; 4] = ["moves", "counters", "healthz", "readyz"];

const OBJECT_COLUMNS: &str = "id, bucket_id, key, content_type, size_bytes, etag, \
     generation, metageneration, custom_metadata, last_modified";

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            events: None,
        }
    }

    /// Publish storage change notifications on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    fn publish(&self, bucket: &str, object: &Object, state: ResourceState) {
        if let Some(bus) = &self.events {
            let event = StorageObjectEvent::from_object(bucket, object, state);
            bus.publish(TriggerEvent::StorageObjectChange(event));
        }
    }

    /// Reject empty, oversized, absolute, traversing or control-character keys.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen, no `..`
    /// - cannot collide with a reserved route segment
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") {
            return Err(invalid("cannot contain consecutive dots"));
        }
        if RESERVED_BUCKET_NAMES.contains(&name) {
            return Err(invalid("name is reserved"));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard directories from MD5(bucket/key), `00`–`ff` each.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// base_path/bucket/{shard}/{shard}/{key}; parents may not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
                other => StorageError::Sqlx(other),
            })
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE key = ? AND bucket_id = ?"
        ))
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| not_found_or(err, &bucket.name, key))
    }

    /// Stream-upload an object to disk and upsert its metadata.
    ///
    /// - Writes bytes incrementally to a temporary file, computing MD5 and size.
    /// - Renames into the final location after fsync.
    /// - Bumps `generation`, resets `metageneration` to 1 and replaces the
    ///   custom metadata.
    ///
    /// A failing body stream leaves any previous content untouched.
    pub async fn upload_object_stream(
        &self,
        bucket: &str,
        key: &str,
        options: WriteOptions,
        mut stream: ByteStream,
    ) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        let written: io::Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size_bytes += chunk.len() as i64;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        let etag = format!("{:x}", digest.compute());
        let object = sqlx::query_as::<_, Object>(&format!(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes, etag,
                generation, metageneration, custom_metadata, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, 1, 1, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                generation = objects.generation + 1,
                metageneration = 1,
                custom_metadata = excluded.custom_metadata,
                last_modified = excluded.last_modified
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(bucket_rec.id)
        .bind(key)
        .bind(options.content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(Json(&options.custom_metadata))
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        debug!(
            bucket = %bucket_rec.name,
            key = %key,
            size_bytes,
            generation = object.generation,
            "object written"
        );
        self.publish(&bucket_rec.name, &object, ResourceState::CreatedOrUpdated);
        Ok(object)
    }

    /// Open an object for reading: metadata plus a file handle.
    pub async fn get_object_reader(&self, bucket: &str, key: &str) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_object(&bucket_rec, key).await
    }

    /// Merge custom metadata into the stored set and bump `metageneration`.
    ///
    /// The merge runs inside a single UPDATE (`json_patch`), so concurrent
    /// updates to different keys never lose each other's writes.
    pub async fn update_object_metadata(
        &self,
        bucket: &str,
        key: &str,
        update: MetadataUpdate,
    ) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let object = sqlx::query_as::<_, Object>(&format!(
            r#"
            UPDATE objects SET
                content_type = COALESCE(?, content_type),
                custom_metadata = json_patch(custom_metadata, ?),
                metageneration = metageneration + 1,
                last_modified = ?
            WHERE key = ? AND bucket_id = ?
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(update.content_type)
        .bind(Json(&update.custom_metadata))
        .bind(Utc::now())
        .bind(key)
        .bind(bucket_rec.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| not_found_or(err, &bucket_rec.name, key))?;

        debug!(
            bucket = %bucket_rec.name,
            key = %key,
            metageneration = object.metageneration,
            "object metadata updated"
        );
        self.publish(&bucket_rec.name, &object, ResourceState::CreatedOrUpdated);
        Ok(object)
    }

    /// Delete an object's metadata and payload.
    ///
    /// Deletes the physical file best-effort and prunes empty shard
    /// directories. Repeated calls return ObjectNotFound.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let object = sqlx::query_as::<_, Object>(&format!(
            "DELETE FROM objects WHERE key = ? AND bucket_id = ? RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(key)
        .bind(bucket_rec.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| not_found_or(err, &bucket_rec.name, key))?;

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        self.publish(&bucket_rec.name, &object, ResourceState::DeletedOrMoved);
        Ok(object)
    }

    /// Create a bucket and its directory. Returns BucketAlreadyExists on a
    /// name conflict.
    pub async fn create_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)")
            .bind(bucket.id)
            .bind(&bucket.name)
            .bind(bucket.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Delete a bucket row, its object rows and its directory tree.
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        let bucket_rec = self.fetch_bucket(name).await?;
        sqlx::query("DELETE FROM objects WHERE bucket_id = ?")
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }

        Ok(())
    }

    /// Remove empty directories from `start` upward, stopping at `stop`,
    /// at the first non-empty directory, or on any I/O error.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn open_read_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let (_, file) = self.get_object_reader(bucket, key).await?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        options: WriteOptions,
        body: ByteStream,
    ) -> StorageResult<Object> {
        self.upload_object_stream(bucket, key, options, body).await
    }

    async fn set_metadata(
        &self,
        bucket: &str,
        key: &str,
        update: MetadataUpdate,
    ) -> StorageResult<Object> {
        self.update_object_metadata(bucket, key, update).await
    }

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.get_object_metadata(bucket, key).await
    }
}

fn not_found_or(err: sqlx::Error, bucket: &str, key: &str) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        other => StorageError::Sqlx(other),
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
