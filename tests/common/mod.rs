#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use image_intake::{
    db,
    models::{
        document::{CommitOutcome, DocumentRef, DocumentSnapshot, WriteIntent},
        event::{ResourceState, StorageObjectEvent},
        object::{CustomMetadata, MetadataUpdate, Object, WriteOptions},
        thumbnail::default_specs,
        verdict::{ClassificationVerdict, Likelihood},
    },
    services::{
        blob_stream::{ByteStream, ObjectStore, bytes_stream, collect_bytes},
        classifier::{ClassificationError, ContentClassifier, ImageSource, SafeSearchClient},
        counter::CounterTransaction,
        document_store::{DocumentResult, DocumentStore, SqliteDocumentStore},
        event_filter::EventFilter,
        fan_out::ThumbnailFanOut,
        moderation::ModerationOrchestrator,
        storage_service::{StorageError, StorageResult, StorageService},
    },
    triggers::{EventBus, ExhaustionPolicy, MOVES_COUNT_FIELD, Triggers},
};
use serde_json::Value;
use std::{
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};
use tempfile::TempDir;

pub const BUCKET: &str = "photos";

pub struct Harness {
    pub storage: StorageService,
    pub documents: SqliteDocumentStore,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_events(bus: EventBus) -> Self {
        Self::build(Some(bus)).await
    }

    async fn build(bus: Option<EventBus>) -> Self {
        let pool = Arc::new(db::connect_in_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let mut storage = StorageService::new(pool.clone(), dir.path());
        let mut documents = SqliteDocumentStore::new(pool);
        if let Some(bus) = bus {
            storage = storage.with_events(bus.clone());
            documents = documents.with_events(bus);
        }
        storage.create_bucket(BUCKET).await.unwrap();
        Self {
            storage,
            documents,
            dir,
        }
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::new(self.storage.clone())
    }

    /// Upload `bytes` and return the event a fresh write would produce.
    pub async fn put_image(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        metadata: CustomMetadata,
    ) -> StorageObjectEvent {
        let object = self
            .storage
            .upload_object_stream(
                BUCKET,
                key,
                WriteOptions {
                    content_type: Some(content_type.into()),
                    custom_metadata: metadata,
                },
                bytes_stream(bytes),
            )
            .await
            .unwrap();
        StorageObjectEvent::from_object(BUCKET, &object, ResourceState::CreatedOrUpdated)
    }

    pub async fn read(&self, key: &str) -> Bytes {
        let stream = self.storage.open_read_stream(BUCKET, key).await.unwrap();
        collect_bytes(stream).await.unwrap()
    }

    pub async fn dimensions(&self, key: &str) -> (u32, u32) {
        image::load_from_memory(&self.read(key).await)
            .unwrap()
            .dimensions()
    }

    pub fn orchestrator(&self, classifier: Arc<FakeClassifier>) -> ModerationOrchestrator {
        let store = self.store();
        let fan_out = ThumbnailFanOut::new(store.clone(), default_specs());
        ModerationOrchestrator::new(
            store,
            ContentClassifier::new(classifier, Likelihood::Likely),
            fan_out,
        )
    }

    pub fn triggers(
        &self,
        classifier: Arc<FakeClassifier>,
        documents: Arc<dyn DocumentStore>,
        max_attempts: u32,
        exhaustion: ExhaustionPolicy,
    ) -> Triggers {
        Triggers::new(
            self.store(),
            EventFilter::new(default_specs()),
            self.orchestrator(classifier),
            CounterTransaction::new(documents, MOVES_COUNT_FIELD, max_attempts),
            exhaustion,
        )
    }
}

/// Gradient PNG, so blurring and resizing visibly change the pixels.
pub fn png(width: u32, height: u32) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            ((x * 7) % 256) as u8,
            ((y * 13) % 256) as u8,
            (((x ^ y) * 3) % 256) as u8,
        ])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    Bytes::from(buf.into_inner())
}

pub fn verdict(adult: Likelihood, violence: Likelihood) -> ClassificationVerdict {
    ClassificationVerdict { adult, violence }
}

/// Returns a fixed verdict, or a service error when none is set, and
/// records what it was asked to look at.
pub struct FakeClassifier {
    verdict: Option<ClassificationVerdict>,
    pub calls: Mutex<Vec<ImageSource>>,
}

impl FakeClassifier {
    pub fn returning(verdict: ClassificationVerdict) -> Arc<Self> {
        Arc::new(Self {
            verdict: Some(verdict),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn safe() -> Arc<Self> {
        Self::returning(verdict(Likelihood::VeryUnlikely, Likelihood::Unlikely))
    }

    pub fn offensive() -> Arc<Self> {
        Self::returning(verdict(Likelihood::Likely, Likelihood::VeryUnlikely))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            verdict: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SafeSearchClient for FakeClassifier {
    async fn detect_safe_search(
        &self,
        image: &ImageSource,
    ) -> Result<ClassificationVerdict, ClassificationError> {
        self.calls.lock().unwrap().push(image.clone());
        self.verdict.ok_or_else(|| ClassificationError::Status {
            status: 503,
            body: "backend unavailable".into(),
        })
    }
}

/// Delegates to a real store but refuses uploads whose key contains
/// `fail_on`.
pub struct FailingUploads {
    pub inner: StorageService,
    pub fail_on: String,
}

#[async_trait]
impl ObjectStore for FailingUploads {
    async fn open_read_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        self.inner.open_read_stream(bucket, key).await
    }

    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        options: WriteOptions,
        body: ByteStream,
    ) -> StorageResult<Object> {
        if key.contains(&self.fail_on) {
            return Err(StorageError::Io(std::io::Error::other("injected upload failure")));
        }
        self.inner.upload_stream(bucket, key, options, body).await
    }

    async fn set_metadata(
        &self,
        bucket: &str,
        key: &str,
        update: MetadataUpdate,
    ) -> StorageResult<Object> {
        self.inner.set_metadata(bucket, key, update).await
    }

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.inner.stat(bucket, key).await
    }
}

/// Before each of the first `interference` commits, another writer
/// increments the counter, so that commit is guaranteed to conflict.
pub struct ConflictingWriter {
    pub inner: SqliteDocumentStore,
    pub field: &'static str,
    interference: AtomicU32,
    pub commits: AtomicU32,
}

impl ConflictingWriter {
    pub fn new(inner: SqliteDocumentStore, field: &'static str, interference: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            field,
            interference: AtomicU32::new(interference),
            commits: AtomicU32::new(0),
        })
    }

    async fn competing_increment(&self, doc: &DocumentRef) {
        let current = self.inner.get_document(doc).await.unwrap();
        let (mut fields, expected_version) = match current {
            Some(s) => (s.fields, Some(s.version)),
            None => (Default::default(), None),
        };
        let value = fields.get(self.field).and_then(Value::as_i64).unwrap_or(0);
        fields.insert(self.field.to_string(), Value::from(value + 1));
        let outcome = self
            .inner
            .commit(
                doc,
                WriteIntent {
                    expected_version,
                    fields,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
    }
}

#[async_trait]
impl DocumentStore for ConflictingWriter {
    async fn get_document(&self, doc: &DocumentRef) -> DocumentResult<Option<DocumentSnapshot>> {
        self.inner.get_document(doc).await
    }

    async fn commit(&self, doc: &DocumentRef, intent: WriteIntent) -> DocumentResult<CommitOutcome> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let interfere = self
            .interference
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interfere {
            self.competing_increment(doc).await;
        }
        self.inner.commit(doc, intent).await
    }
}
