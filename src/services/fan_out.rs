//! Concurrent thumbnail generation.
//!
//! One task per spec, each with its own read stream of the source. The join
//! waits for every task to settle; completed thumbnails are kept even when a
//! sibling fails, since re-running the whole fan-out overwrites them in place.

use crate::{
    models::{
        object::{CustomMetadata, Object, WriteOptions, with_moderated_flag},
        thumbnail::ThumbnailSpec,
    },
    services::{
        blob_stream::ObjectStore,
        storage_service::StorageError,
        transform::{TransformStage, apply_transforms},
    },
};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{error, info};

/// The spec that failed and why.
#[derive(Debug, Clone)]
pub struct SpecFailure {
    pub spec: ThumbnailSpec,
    pub error: String,
}

impl fmt::Display for SpecFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x{}): {}",
            self.spec.suffix, self.spec.width, self.spec.height, self.error
        )
    }
}

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("{} of {total} thumbnails failed for {bucket}/{path}: {}", .failures.len(), join_failures(.failures))]
    PartialFailure {
        bucket: String,
        path: String,
        total: usize,
        failures: Vec<SpecFailure>,
    },
}

impl FanOutError {
    pub fn failed_specs(&self) -> Vec<&ThumbnailSpec> {
        match self {
            Self::PartialFailure { failures, .. } => failures.iter().map(|f| &f.spec).collect(),
        }
    }
}

fn join_failures(failures: &[SpecFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Source object and how to write its derived variants.
#[derive(Clone, Debug)]
pub struct FanOutRequest {
    pub bucket: String,
    pub path: String,
    pub content_type: Option<String>,
    /// Merged with `isModerated=true` on every output.
    pub upload_metadata: CustomMetadata,
    /// Stages applied after the resize, e.g. a blur in the moderation branch.
    pub extra_stages: Vec<TransformStage>,
}

#[derive(Clone)]
pub struct ThumbnailFanOut {
    store: Arc<dyn ObjectStore>,
    specs: Arc<[ThumbnailSpec]>,
}

impl ThumbnailFanOut {
    pub fn new(store: Arc<dyn ObjectStore>, specs: Vec<ThumbnailSpec>) -> Self {
        Self {
            store,
            specs: specs.into(),
        }
    }

    /// Generate every spec concurrently. Ok holds the written objects in
    /// spec order.
    pub async fn fan_out(&self, request: &FanOutRequest) -> Result<Vec<Object>, FanOutError> {
        let options = WriteOptions {
            content_type: request.content_type.clone(),
            custom_metadata: with_moderated_flag(&request.upload_metadata),
        };

        let tasks = self.specs.iter().cloned().map(|spec| {
            let store = self.store.clone();
            let request = request.clone();
            let options = options.clone();
            tokio::spawn(async move {
                let result = generate_one(store.as_ref(), &request, &spec, options).await;
                (spec, result)
            })
        });
        let handles: Vec<_> = tasks.collect();
        let specs = self.specs.clone();
        let joined = futures::future::join_all(handles).await;

        let mut written = Vec::with_capacity(joined.len());
        let mut failures = Vec::new();
        for (idx, outcome) in joined.into_iter().enumerate() {
            match outcome {
                Ok((_, Ok(object))) => written.push(object),
                Ok((spec, Err(err))) => {
                    error!(
                        bucket = %request.bucket,
                        path = %request.path,
                        spec = %spec.suffix,
                        error = %err,
                        "thumbnail generation failed"
                    );
                    failures.push(SpecFailure {
                        spec,
                        error: err.to_string(),
                    });
                }
                Err(join_err) => {
                    let spec = specs[idx].clone();
                    error!(
                        bucket = %request.bucket,
                        path = %request.path,
                        spec = %spec.suffix,
                        error = %join_err,
                        "thumbnail task aborted"
                    );
                    failures.push(SpecFailure {
                        spec,
                        error: format!("task aborted: {join_err}"),
                    });
                }
            }
        }

        if failures.is_empty() {
            info!(
                bucket = %request.bucket,
                path = %request.path,
                count = written.len(),
                "thumbnails generated"
            );
            Ok(written)
        } else {
            Err(FanOutError::PartialFailure {
                bucket: request.bucket.clone(),
                path: request.path.clone(),
                total: specs.len(),
                failures,
            })
        }
    }
}

async fn generate_one(
    store: &dyn ObjectStore,
    request: &FanOutRequest,
    spec: &ThumbnailSpec,
    options: WriteOptions,
) -> Result<Object, StorageError> {
    let source = store.open_read_stream(&request.bucket, &request.path).await?;

    let mut stages = vec![TransformStage::Resize {
        width: spec.width,
        height: spec.height,
    }];
    stages.extend(request.extra_stages.iter().copied());

    let key = spec.thumbnail_key(&request.path);
    store
        .upload_stream(&request.bucket, &key, options, apply_transforms(source, stages))
        .await
}
