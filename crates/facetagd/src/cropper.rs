use crate::retry::RetryPolicy;
use facetag_core::{crop, CropError, CropTask, FaceRecord};
use facetag_store::{
    FaceStore, FaceStoreError, ObjectStore, ObjectStoreError, ReceivedMessage, Release, TaskQueue,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CropFailure {
    #[error("malformed crop task: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Crop(#[from] CropError),
    #[error("object store: {0}")]
    Objects(#[from] ObjectStoreError),
    #[error("face store: {0}")]
    Metadata(#[from] FaceStoreError),
}

impl CropFailure {
    /// Whether redelivering the same task could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Objects(e) => e.is_transient(),
            Self::Metadata(e) => e.is_transient(),
            Self::Malformed(_) | Self::Crop(_) => false,
        }
    }
}

/// What a successful crop left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropOutcome {
    pub record: FaceRecord,
    /// False when the face object already existed (redelivered task).
    pub stored_object: bool,
    /// False when the face record already existed (redelivered task).
    pub inserted_record: bool,
}

/// Per-batch tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    /// Failed transiently; will be delivered again.
    pub retrying: usize,
    pub dead_lettered: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.retrying + self.dead_lettered
    }
}

/// Materializes detected faces: one stored crop and one face record per task.
pub struct Cropper {
    objects: Arc<dyn ObjectStore>,
    faces: Arc<FaceStore>,
    photos_bucket: String,
    faces_bucket: String,
    retry: RetryPolicy,
}

impl Cropper {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        faces: Arc<FaceStore>,
        photos_bucket: impl Into<String>,
        faces_bucket: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            objects,
            faces,
            photos_bucket: photos_bucket.into(),
            faces_bucket: faces_bucket.into(),
            retry,
        }
    }

    /// Crop one face and register it.
    ///
    /// Safe to repeat for the same task: the face id is derived from the
    /// task, the object put is skipped when the key exists, and the record
    /// insert is an upsert that never touches an existing row.
    pub fn crop(&self, task: &CropTask) -> Result<CropOutcome, CropFailure> {
        let face_id = task.face_id();
        let object_key = face_id.object_key();
        let coords = &task.face_coordinates;

        let present = self
            .retry
            .run("check face object", ObjectStoreError::is_transient, || {
                self.objects.exists(&self.faces_bucket, &object_key)
            })?;
        let stored_object = if present {
            tracing::debug!(face_id = %face_id, "crop: face object already stored");
            false
        } else {
            let bytes = self.retry.run("fetch photo", ObjectStoreError::is_transient, || {
                self.objects.get(&self.photos_bucket, &task.original_key)
            })?;
            let source = crop::decode(&bytes)?;
            let face = crop::crop_face(&source, coords)?;
            self.retry
                .run("store face object", ObjectStoreError::is_transient, || {
                    self.objects.put(&self.faces_bucket, &object_key, &face.jpeg)
                })?;
            tracing::debug!(
                face_id = %face_id,
                width = face.width,
                height = face.height,
                bytes = face.jpeg.len(),
                "crop: face object stored"
            );
            true
        };

        let inserted_record = self
            .retry
            .run("insert face record", FaceStoreError::is_transient, || {
                self.faces.insert_unnamed(&face_id, &task.original_key)
            })?;

        tracing::info!(
            face_id = %face_id,
            source = %task.original_key,
            coords = %coords,
            stored_object,
            inserted_record,
            "crop: face registered"
        );

        Ok(CropOutcome {
            record: FaceRecord::unnamed(face_id, task.original_key.clone()),
            stored_object,
            inserted_record,
        })
    }

    /// Parse a queue body and crop it.
    pub fn crop_body(&self, body: &str) -> Result<CropOutcome, CropFailure> {
        let task = CropTask::from_json(body)?;
        self.crop(&task)
    }

    /// Process a batch of leased queue messages, settling each one.
    ///
    /// Failures are isolated per message: success acks, a permanent failure
    /// dead-letters at once, a transient failure is released with backoff
    /// (and dead-lettered by the queue once it runs out of attempts).
    pub fn process_batch(
        &self,
        queue: &dyn TaskQueue,
        messages: Vec<ReceivedMessage>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for message in messages {
            match self.crop_body(&message.body) {
                Ok(_) => {
                    if let Err(e) = queue.ack(&message.receipt) {
                        // Work is done and idempotent; a redelivery is harmless.
                        tracing::warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "crop: ack failed"
                        );
                    }
                    report.succeeded += 1;
                }
                Err(failure) if failure.is_transient() => {
                    let delay = self.retry.delay(message.attempts);
                    tracing::warn!(
                        message_id = %message.message_id,
                        attempts = message.attempts,
                        error = %failure,
                        "crop: transient failure"
                    );
                    match queue.release(&message.receipt, delay, &failure.to_string()) {
                        Ok(Release::Retrying) => report.retrying += 1,
                        Ok(Release::DeadLettered) => report.dead_lettered += 1,
                        Err(e) => {
                            // Lease expiry redelivers it anyway.
                            tracing::error!(
                                message_id = %message.message_id,
                                error = %e,
                                "crop: release failed"
                            );
                            report.retrying += 1;
                        }
                    }
                }
                Err(failure) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        error = %failure,
                        "crop: rejecting task"
                    );
                    if let Err(e) = queue.dead_letter(&message.receipt, &failure.to_string()) {
                        tracing::error!(
                            message_id = %message.message_id,
                            error = %e,
                            "crop: dead-letter failed"
                        );
                    }
                    report.dead_lettered += 1;
                }
            }
        }
        report
    }
}
