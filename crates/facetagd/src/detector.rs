use crate::retry::RetryPolicy;
use facetag_core::{crop, Classifier, CropError, CropTask, UploadNotification};
use facetag_store::{ObjectStore, ObjectStoreError, QueueError, TaskQueue};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("upload landed in bucket {got:?}, expected {expected:?}")]
    ForeignBucket { got: String, expected: String },
    #[error("failed to fetch photo: {0}")]
    Fetch(#[from] ObjectStoreError),
    #[error("photo is not a decodable image: {0}")]
    Decode(#[from] CropError),
    #[error("failed to encode crop task: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish crop task: {0}")]
    Publish(#[from] QueueError),
}

impl DetectError {
    /// Whether redelivering the same notification could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_transient(),
            Self::Publish(e) => e.is_transient(),
            Self::ForeignBucket { .. } | Self::Decode(_) | Self::Encode(_) => false,
        }
    }
}

/// Result of one detector invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectReport {
    pub object_key: String,
    /// Crop tasks published, one per detected face.
    pub tasks: Vec<CropTask>,
}

/// Finds faces in an uploaded photo and queues one crop task per face.
pub struct Detector {
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn TaskQueue>,
    classifier: Arc<dyn Classifier>,
    photos_bucket: String,
    retry: RetryPolicy,
}

impl Detector {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn TaskQueue>,
        classifier: Arc<dyn Classifier>,
        photos_bucket: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            objects,
            queue,
            classifier,
            photos_bucket: photos_bucket.into(),
            retry,
        }
    }

    /// Handle one "photo uploaded" notification.
    ///
    /// Transient fetch/publish failures are retried in place; if they persist
    /// the error is returned so the trigger can redeliver. A redelivery may
    /// publish some tasks twice, which the cropper absorbs.
    pub fn detect(&self, upload: &UploadNotification) -> Result<DetectReport, DetectError> {
        if upload.bucket_id != self.photos_bucket {
            return Err(DetectError::ForeignBucket {
                got: upload.bucket_id.clone(),
                expected: self.photos_bucket.clone(),
            });
        }
        let key = upload.object_id.as_str();
        tracing::info!(bucket = %upload.bucket_id, key, "detect: photo uploaded");

        let bytes = self.retry.run("fetch photo", ObjectStoreError::is_transient, || {
            self.objects.get(&upload.bucket_id, key)
        })?;
        let gray = crop::decode_grayscale(&bytes)?;
        let (width, height) = gray.dimensions();

        let detections = self.classifier.classify(gray.as_raw(), width, height);
        tracing::info!(key, width, height, faces = detections.len(), "detect: classified");

        let mut tasks = Vec::with_capacity(detections.len());
        for detection in detections {
            let task = CropTask::new(key, detection.bounds);
            let body = task.to_json()?;
            let message_id = self
                .retry
                .run("publish crop task", QueueError::is_transient, || {
                    self.queue.send(&body)
                })?;
            tracing::debug!(
                key,
                message_id = %message_id,
                coords = %task.face_coordinates,
                score = detection.score,
                "detect: crop task queued"
            );
            tasks.push(task);
        }

        Ok(DetectReport {
            object_key: key.to_string(),
            tasks,
        })
    }
}
