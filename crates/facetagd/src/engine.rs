use crate::chat::{ChatError, Dispatcher, InboundMessage};
use crate::config::Config;
use crate::cropper::{BatchReport, CropFailure, Cropper};
use crate::detector::{DetectError, DetectReport, Detector};
use crate::retry::RetryPolicy;
use crate::tagger::{TagError, Tagger};
use facetag_core::{
    CascadeClassifier, Classifier, ClassifierError, FaceId, FaceRecord, Links, TriggerEvent,
    UploadNotification,
};
use facetag_store::{
    DeadLetter, FaceStats, FaceStore, FaceStoreError, FsObjectStore, ObjectStore,
    ObjectStoreError, QueueError, QueueStats, SqliteTaskQueue, TaskQueue,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Name of the crop task queue inside the database.
pub const CROP_QUEUE: &str = "crop-tasks";

/// Extra in-invocation attempts for a transient store failure.
const IN_PLACE_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    BadRequest(#[from] ChatError),
    #[error("malformed trigger event: {0}")]
    BadTrigger(#[source] serde_json::Error),
    #[error("invalid face id: {0:?}")]
    BadFaceId(String),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("object store error: {0}")]
    Objects(#[from] ObjectStoreError),
    #[error("face store error: {0}")]
    Faces(#[from] FaceStoreError),
    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error(transparent)]
    Crop(#[from] CropFailure),
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("failed to encode reply: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// The caller sent something unusable; retrying the same request won't help.
    pub fn is_caller_error(&self) -> bool {
        match self {
            Self::BadRequest(_) | Self::BadTrigger(_) | Self::BadFaceId(_) => true,
            Self::Objects(e) => matches!(
                e,
                ObjectStoreError::InvalidName(_) | ObjectStoreError::AlreadyExists { .. }
            ),
            Self::Detect(e) => !e.is_transient(),
            Self::Tag(e) => e.is_user_error(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Objects(ObjectStoreError::NotFound { .. })
                | Self::Tag(TagError::Objects(ObjectStoreError::NotFound { .. }))
                | Self::Detect(DetectError::Fetch(ObjectStoreError::NotFound { .. }))
        )
    }
}

/// What one host trigger event produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    /// Photos scanned successfully.
    pub photos: usize,
    /// Crop tasks published by those scans.
    pub tasks: usize,
    /// Uploads, crop bodies, or unrecognized messages rejected as unusable.
    pub rejected: usize,
    /// Crop bodies materialized.
    pub cropped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub faces: u64,
    pub unnamed_faces: u64,
    pub pending_tasks: u64,
    pub dead_letters: u64,
}

impl Status {
    fn new(faces: FaceStats, queue: QueueStats) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            faces: faces.total,
            unnamed_faces: faces.unnamed,
            pending_tasks: queue.pending,
            dead_letters: queue.dead,
        }
    }
}

/// Process-wide handles and the pipeline components built on them.
pub struct Engine {
    objects: Arc<dyn ObjectStore>,
    faces: Arc<FaceStore>,
    queue: Arc<SqliteTaskQueue>,
    detector: Detector,
    cropper: Cropper,
    tagger: Tagger,
    dispatcher: Dispatcher,
    photos_bucket: String,
    queue_batch: usize,
    queue_lease: Duration,
}

impl Engine {
    /// Open storage and load the classifier model. Fails fast if anything is
    /// unavailable.
    pub fn open(config: &Config) -> Result<Self, EngineError> {
        let objects = Arc::new(FsObjectStore::open(&config.storage_dir)?);
        let faces = Arc::new(FaceStore::open(&config.db_path)?);
        let queue = Arc::new(SqliteTaskQueue::open(
            &config.db_path,
            CROP_QUEUE,
            config.max_attempts,
        )?);

        let classifier = CascadeClassifier::load(&config.model_path, config.scan)?;
        Ok(Self::from_parts(config, objects, faces, queue, Arc::new(classifier)))
    }

    pub fn from_parts(
        config: &Config,
        objects: Arc<dyn ObjectStore>,
        faces: Arc<FaceStore>,
        queue: Arc<SqliteTaskQueue>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let retry = RetryPolicy::new(IN_PLACE_RETRIES, config.retry_base);
        Self {
            detector: Detector::new(
                objects.clone(),
                queue.clone(),
                classifier,
                config.photos_bucket.clone(),
                retry,
            ),
            cropper: Cropper::new(
                objects.clone(),
                faces.clone(),
                config.photos_bucket.clone(),
                config.faces_bucket.clone(),
                retry,
            ),
            tagger: Tagger::new(
                faces.clone(),
                objects.clone(),
                config.photos_bucket.clone(),
                config.faces_bucket.clone(),
                Links::new(config.gateway_url.as_deref()),
                retry,
            ),
            dispatcher: Dispatcher::new(),
            objects,
            faces,
            queue,
            photos_bucket: config.photos_bucket.clone(),
            queue_batch: config.queue_batch.max(1),
            queue_lease: config.queue_lease,
        }
    }

    /// Store a new photo in the photos bucket and run detection on it.
    ///
    /// Keys are write-once: faces already cropped from a photo point back at
    /// its key, so an upload under a taken key is refused.
    pub fn upload(&self, key: &str, bytes: &[u8]) -> Result<DetectReport, EngineError> {
        self.objects.put_new(&self.photos_bucket, key, bytes)?;
        tracing::info!(key, bytes = bytes.len(), "photo stored");
        self.notify(&UploadNotification {
            bucket_id: self.photos_bucket.clone(),
            object_id: key.to_string(),
        })
    }

    /// Run detection for a photo already present in the store.
    pub fn notify(&self, upload: &UploadNotification) -> Result<DetectReport, EngineError> {
        Ok(self.detector.detect(upload)?)
    }

    /// Accept a raw storage or queue trigger event from the host.
    ///
    /// Items are processed independently. Permanently bad items are logged
    /// and counted as rejected; if any item failed transiently the first
    /// such error is returned after the rest of the batch has run, so the
    /// host redelivers the event.
    pub fn handle_trigger(&self, raw: &str) -> Result<TriggerReport, EngineError> {
        let event = TriggerEvent::parse(raw).map_err(EngineError::BadTrigger)?;
        let mut report = TriggerReport::default();
        let mut transient: Option<EngineError> = None;

        for upload in event.uploads() {
            match self.detector.detect(upload) {
                Ok(detected) => {
                    report.photos += 1;
                    report.tasks += detected.tasks.len();
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(
                        key = %upload.object_id,
                        error = %e,
                        "trigger: detection failed"
                    );
                    if transient.is_none() {
                        transient = Some(e.into());
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %upload.object_id, error = %e, "trigger: upload rejected");
                    report.rejected += 1;
                }
            }
        }

        for details in event.unrecognized() {
            tracing::warn!(%details, "trigger: unrecognized message skipped");
            report.rejected += 1;
        }

        for body in event.queue_bodies() {
            match self.cropper.crop_body(body) {
                Ok(_) => report.cropped += 1,
                Err(e) if e.is_transient() => {
                    tracing::error!(error = %e, "trigger: crop failed");
                    if transient.is_none() {
                        transient = Some(e.into());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "trigger: crop task rejected");
                    report.rejected += 1;
                }
            }
        }

        tracing::info!(
            photos = report.photos,
            tasks = report.tasks,
            cropped = report.cropped,
            rejected = report.rejected,
            "trigger handled"
        );
        match transient {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Lease one batch of crop tasks and settle every message in it.
    pub fn drain_queue_once(&self) -> Result<BatchReport, EngineError> {
        let messages = self.queue.receive(self.queue_batch, self.queue_lease)?;
        if messages.is_empty() {
            return Ok(BatchReport::default());
        }
        let count = messages.len();
        let report = self.cropper.process_batch(self.queue.as_ref(), messages);
        tracing::info!(
            received = count,
            succeeded = report.succeeded,
            retrying = report.retrying,
            dead_lettered = report.dead_lettered,
            "crop batch processed"
        );
        Ok(report)
    }

    /// Handle one inbound chat message; returns the JSON reply.
    pub fn handle_chat(&self, raw: &str) -> Result<String, EngineError> {
        let message = InboundMessage::parse(raw)?;
        let reply = self.dispatcher.dispatch(&self.tagger, &message);
        serde_json::to_string(&reply).map_err(EngineError::Encode)
    }

    pub fn face_image(&self, face_id: &str) -> Result<Vec<u8>, EngineError> {
        let face_id =
            FaceId::parse(face_id).ok_or_else(|| EngineError::BadFaceId(face_id.to_string()))?;
        Ok(self.tagger.face_image(&face_id)?)
    }

    pub fn photo(&self, key: &str) -> Result<Vec<u8>, EngineError> {
        Ok(self.tagger.photo(key)?)
    }

    /// Faces cut from one photo, named or not.
    pub fn faces_in_photo(&self, key: &str) -> Result<Vec<FaceRecord>, EngineError> {
        let records = self.faces.faces_in_image(key)?;
        tracing::debug!(
            key,
            faces = records.len(),
            named = records.iter().filter(|r| r.is_named()).count(),
            "faces listed"
        );
        Ok(records)
    }

    pub fn status(&self) -> Result<Status, EngineError> {
        Ok(Status::new(self.faces.stats()?, self.queue.stats()?))
    }

    /// Crop tasks parked after a permanent failure or too many attempts.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, EngineError> {
        Ok(self.queue.dead_letters()?)
    }

    /// Return dead-lettered crop tasks to the queue.
    pub fn redrive(&self) -> Result<usize, EngineError> {
        Ok(self.queue.redrive()?)
    }
}

/// Clone-safe async handle to the engine.
///
/// Every call runs on the blocking pool: the stores are synchronous and the
/// retry policy sleeps in place. Calls from different clients run
/// concurrently.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Engine>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine)).await?
    }

    pub async fn upload(&self, key: String, bytes: Vec<u8>) -> Result<DetectReport, EngineError> {
        self.run(move |e| e.upload(&key, &bytes)).await
    }

    pub async fn notify(&self, upload: UploadNotification) -> Result<DetectReport, EngineError> {
        self.run(move |e| e.notify(&upload)).await
    }

    pub async fn handle_trigger(&self, raw: String) -> Result<TriggerReport, EngineError> {
        self.run(move |e| e.handle_trigger(&raw)).await
    }

    pub async fn drain_queue_once(&self) -> Result<BatchReport, EngineError> {
        self.run(|e| e.drain_queue_once()).await
    }

    pub async fn handle_chat(&self, raw: String) -> Result<String, EngineError> {
        self.run(move |e| e.handle_chat(&raw)).await
    }

    pub async fn face_image(&self, face_id: String) -> Result<Vec<u8>, EngineError> {
        self.run(move |e| e.face_image(&face_id)).await
    }

    pub async fn photo(&self, key: String) -> Result<Vec<u8>, EngineError> {
        self.run(move |e| e.photo(&key)).await
    }

    pub async fn faces_in_photo(&self, key: String) -> Result<Vec<FaceRecord>, EngineError> {
        self.run(move |e| e.faces_in_photo(&key)).await
    }

    pub async fn status(&self) -> Result<Status, EngineError> {
        self.run(|e| e.status()).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, EngineError> {
        self.run(|e| e.dead_letters()).await
    }

    pub async fn redrive(&self) -> Result<usize, EngineError> {
        self.run(|e| e.redrive()).await
    }
}

/// Spawn the crop task consumer.
///
/// Drains batches back to back while there is work, then sleeps `idle`
/// between polls. Stops once `shutdown` changes or its sender drops.
pub fn spawn_queue_poller(
    engine: EngineHandle,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(idle_ms = idle.as_millis() as u64, "queue poller started");
        loop {
            let busy = match engine.drain_queue_once().await {
                Ok(report) => report.total() > 0,
                Err(e) => {
                    tracing::error!(error = %e, "queue poll failed");
                    false
                }
            };
            if *shutdown.borrow() {
                break;
            }
            if busy {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("queue poller stopped");
    })
}
