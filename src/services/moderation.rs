//! Moderation state machine for one accepted storage event.
//!
//! ```text
//! PendingClassification ──offensive──▶ Blurring ─────────┐
//!          │                                             ▼
//!          └──────safe──────▶ MarkingModerated ──▶ Thumbnailing ──▶ Done
//! (any step) ──error──▶ Failed
//! ```
//!
//! Thumbnails are only ever produced after the source has been classified
//! and, if needed, blurred. `Failed` is reported to the caller and never
//! retried here.

use crate::{
    errors::PipelineError,
    models::{
        event::StorageObjectEvent,
        object::{MetadataUpdate, WriteOptions, with_moderated_flag},
        verdict::ClassificationVerdict,
    },
    services::{
        blob_stream::{ObjectStore, collect_bytes},
        classifier::{ContentClassifier, ImageSource},
        fan_out::{FanOutRequest, ThumbnailFanOut},
        storage_service::StorageError,
        transform::{TransformStage, apply_transforms},
    },
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const DEFAULT_BLUR_SIGMA: f32 = 10.0;

/// How the image is handed to the classifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ClassifierInput {
    /// Read the object and send its bytes.
    #[default]
    Inline,
    /// Send the `gs://bucket/path` URI and let the service fetch it.
    Uri,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModerationReport {
    pub verdict: ClassificationVerdict,
    pub blurred: bool,
    pub thumbnails: Vec<String>,
}

#[derive(Debug)]
pub enum ModerationState {
    PendingClassification,
    Blurring {
        verdict: ClassificationVerdict,
    },
    MarkingModerated {
        verdict: ClassificationVerdict,
    },
    Thumbnailing {
        verdict: ClassificationVerdict,
        blurred: bool,
    },
    Done(ModerationReport),
    Failed(PipelineError),
}

impl ModerationState {
    fn name(&self) -> &'static str {
        match self {
            Self::PendingClassification => "pending_classification",
            Self::Blurring { .. } => "blurring",
            Self::MarkingModerated { .. } => "marking_moderated",
            Self::Thumbnailing { .. } => "thumbnailing",
            Self::Done(_) => "done",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Clone)]
pub struct ModerationOrchestrator {
    store: Arc<dyn ObjectStore>,
    classifier: ContentClassifier,
    fan_out: ThumbnailFanOut,
    blur_sigma: f32,
    classifier_input: ClassifierInput,
}

impl ModerationOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        classifier: ContentClassifier,
        fan_out: ThumbnailFanOut,
    ) -> Self {
        Self {
            store,
            classifier,
            fan_out,
            blur_sigma: DEFAULT_BLUR_SIGMA,
            classifier_input: ClassifierInput::default(),
        }
    }

    pub fn with_blur_sigma(mut self, sigma: f32) -> Self {
        self.blur_sigma = sigma;
        self
    }

    pub fn with_classifier_input(mut self, input: ClassifierInput) -> Self {
        self.classifier_input = input;
        self
    }

    /// Drive `event` from classification to a terminal state.
    pub async fn run(&self, event: &StorageObjectEvent) -> Result<ModerationReport, PipelineError> {
        let mut state = ModerationState::PendingClassification;
        loop {
            state = match state {
                ModerationState::Done(report) => {
                    info!(
                        bucket = %event.bucket,
                        path = %event.path,
                        blurred = report.blurred,
                        thumbnails = report.thumbnails.len(),
                        "moderation complete"
                    );
                    return Ok(report);
                }
                ModerationState::Failed(err) => {
                    error!(
                        bucket = %event.bucket,
                        path = %event.path,
                        error = %err,
                        "moderation failed"
                    );
                    return Err(err);
                }
                active => {
                    let from = active.name();
                    let next = self.step(active, event).await;
                    debug!(path = %event.path, from, to = next.name(), "moderation transition");
                    next
                }
            };
        }
    }

    async fn step(&self, state: ModerationState, event: &StorageObjectEvent) -> ModerationState {
        match state {
            ModerationState::PendingClassification => match self.classify(event).await {
                Ok(verdict) if self.classifier.is_offensive(&verdict) => {
                    info!(
                        bucket = %event.bucket,
                        path = %event.path,
                        adult = %verdict.adult,
                        violence = %verdict.violence,
                        threshold = %self.classifier.threshold(),
                        "offensive content detected"
                    );
                    ModerationState::Blurring { verdict }
                }
                Ok(verdict) => ModerationState::MarkingModerated { verdict },
                Err(err) => ModerationState::Failed(err),
            },
            ModerationState::Blurring { verdict } => match self.blur_source(event).await {
                Ok(()) => ModerationState::Thumbnailing {
                    verdict,
                    blurred: true,
                },
                Err(err) => ModerationState::Failed(err),
            },
            ModerationState::MarkingModerated { verdict } => {
                match self.mark_moderated(event).await {
                    Ok(()) => ModerationState::Thumbnailing {
                        verdict,
                        blurred: false,
                    },
                    Err(err) => ModerationState::Failed(err),
                }
            }
            ModerationState::Thumbnailing { verdict, blurred } => {
                match self.thumbnails(event, blurred).await {
                    Ok(thumbnails) => ModerationState::Done(ModerationReport {
                        verdict,
                        blurred,
                        thumbnails,
                    }),
                    Err(err) => ModerationState::Failed(err),
                }
            }
            terminal @ (ModerationState::Done(_) | ModerationState::Failed(_)) => terminal,
        }
    }

    async fn classify(&self, event: &StorageObjectEvent) -> Result<ClassificationVerdict, PipelineError> {
        let source = match self.classifier_input {
            ClassifierInput::Uri => ImageSource::Uri(event.object_uri()),
            ClassifierInput::Inline => {
                let stream = self.store.open_read_stream(&event.bucket, &event.path).await?;
                let bytes = collect_bytes(stream).await.map_err(StorageError::Io)?;
                ImageSource::Content(bytes)
            }
        };
        Ok(self.classifier.classify(&source).await?)
    }

    /// Overwrite the source with a blurred copy, keeping its content type and
    /// metadata and adding the moderation flag.
    async fn blur_source(&self, event: &StorageObjectEvent) -> Result<(), PipelineError> {
        let source = self.store.open_read_stream(&event.bucket, &event.path).await?;
        let blurred = apply_transforms(
            source,
            vec![TransformStage::Blur {
                sigma: self.blur_sigma,
            }],
        );
        let options = WriteOptions {
            content_type: Some(event.content_type.clone()),
            custom_metadata: with_moderated_flag(&event.custom_metadata),
        };
        self.store
            .upload_stream(&event.bucket, &event.path, options, blurred)
            .await?;
        Ok(())
    }

    /// Metadata-only update; pixels are left alone.
    async fn mark_moderated(&self, event: &StorageObjectEvent) -> Result<(), PipelineError> {
        let update = MetadataUpdate {
            content_type: Some(event.content_type.clone()),
            custom_metadata: with_moderated_flag(&event.custom_metadata),
        };
        self.store
            .set_metadata(&event.bucket, &event.path, update)
            .await?;
        Ok(())
    }

    async fn thumbnails(
        &self,
        event: &StorageObjectEvent,
        blurred: bool,
    ) -> Result<Vec<String>, PipelineError> {
        let extra_stages = if blurred {
            vec![TransformStage::Blur {
                sigma: self.blur_sigma,
            }]
        } else {
            Vec::new()
        };
        let request = FanOutRequest {
            bucket: event.bucket.clone(),
            path: event.path.clone(),
            content_type: Some(event.content_type.clone()),
            upload_metadata: event.custom_metadata.clone(),
            extra_stages,
        };
        let written = self.fan_out.fan_out(&request).await?;
        Ok(written.into_iter().map(|object| object.key).collect())
    }
}
