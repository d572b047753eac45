use crate::engine::{EngineError, EngineHandle};
use facetag_core::UploadNotification;
use facetag_store::DeadLetter;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.FaceTag1";
pub const OBJECT_PATH: &str = "/org/freedesktop/FaceTag1";

/// D-Bus interface for the facetag daemon.
///
/// Bus name: org.freedesktop.FaceTag1
/// Object path: /org/freedesktop/FaceTag1
pub struct FaceTagService {
    engine: EngineHandle,
}

impl FaceTagService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    if e.is_not_found() {
        zbus::fdo::Error::FileNotFound(e.to_string())
    } else if e.is_caller_error() {
        zbus::fdo::Error::InvalidArgs(e.to_string())
    } else {
        tracing::error!(error = %e, "request failed");
        zbus::fdo::Error::Failed(e.to_string())
    }
}

fn detect_json(report: &crate::detector::DetectReport) -> String {
    serde_json::json!({
        "object_key": report.object_key,
        "faces": report.tasks.iter().map(|t| t.face_coordinates).collect::<Vec<_>>(),
    })
    .to_string()
}

fn dead_letters_json(dead: &[DeadLetter]) -> String {
    dead.iter()
        .map(|d| {
            serde_json::json!({
                "message_id": d.message_id,
                "body": d.body,
                "attempts": d.attempts,
                "last_error": d.last_error,
            })
        })
        .collect::<serde_json::Value>()
        .to_string()
}

#[interface(name = "org.freedesktop.FaceTag1")]
impl FaceTagService {
    /// Store a photo under `key` and scan it. Returns the detected boxes as JSON.
    async fn upload(&self, key: &str, data: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(key, bytes = data.len(), "upload requested");
        let report = self.engine.upload(key.to_string(), data).await.map_err(to_fdo)?;
        Ok(detect_json(&report))
    }

    /// Scan a photo that is already in the photos bucket.
    async fn notify_upload(&self, bucket: &str, key: &str) -> zbus::fdo::Result<String> {
        tracing::info!(bucket, key, "upload notification");
        let report = self
            .engine
            .notify(UploadNotification {
                bucket_id: bucket.to_string(),
                object_id: key.to_string(),
            })
            .await
            .map_err(to_fdo)?;
        Ok(detect_json(&report))
    }

    /// Process a raw storage or queue trigger event.
    async fn handle_trigger(&self, event: &str) -> zbus::fdo::Result<String> {
        let report = self
            .engine
            .handle_trigger(event.to_string())
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Handle one inbound chat message (JSON) and return the reply (JSON).
    async fn handle_chat(&self, message: &str) -> zbus::fdo::Result<String> {
        self.engine
            .handle_chat(message.to_string())
            .await
            .map_err(to_fdo)
    }

    /// JPEG bytes of a cropped face.
    async fn get_face_image(&self, face_id: &str) -> zbus::fdo::Result<Vec<u8>> {
        self.engine
            .face_image(face_id.to_string())
            .await
            .map_err(to_fdo)
    }

    /// Bytes of a source photo.
    async fn get_photo(&self, key: &str) -> zbus::fdo::Result<Vec<u8>> {
        self.engine.photo(key.to_string()).await.map_err(to_fdo)
    }

    /// Faces cut from a photo as a JSON array of face records.
    async fn list_faces(&self, key: &str) -> zbus::fdo::Result<String> {
        let records = self
            .engine
            .faces_in_photo(key.to_string())
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        serde_json::to_string(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Dead-lettered crop tasks as a JSON array.
    async fn list_dead_letters(&self) -> zbus::fdo::Result<String> {
        let dead = self.engine.dead_letters().await.map_err(to_fdo)?;
        Ok(dead_letters_json(&dead))
    }

    /// Move dead-lettered crop tasks back to the queue. Returns how many moved.
    async fn redrive_dead_letters(&self) -> zbus::fdo::Result<u32> {
        let moved = self.engine.redrive().await.map_err(to_fdo)?;
        tracing::info!(moved, "redrive requested");
        Ok(u32::try_from(moved).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letters_json_shape() {
        let dead = vec![DeadLetter {
            message_id: "m1".into(),
            body: "{broken".into(),
            attempts: 1,
            last_error: Some("malformed crop task".into()),
        }];
        let v: serde_json::Value = serde_json::from_str(&dead_letters_json(&dead)).unwrap();
        assert_eq!(
            v,
            serde_json::json!([{
                "message_id": "m1",
                "body": "{broken",
                "attempts": 1,
                "last_error": "malformed crop task",
            }])
        );
        assert_eq!(dead_letters_json(&[]), "[]");
    }

    #[test]
    fn test_error_mapping() {
        use facetag_store::ObjectStoreError;
        let object = EngineError::Objects;
        let taken = object(ObjectStoreError::AlreadyExists {
            bucket: "photos".into(),
            key: "P1".into(),
        });
        assert!(matches!(to_fdo(taken), zbus::fdo::Error::InvalidArgs(_)));
        let missing = object(ObjectStoreError::NotFound {
            bucket: "photos".into(),
            key: "P1".into(),
        });
        assert!(matches!(to_fdo(missing), zbus::fdo::Error::FileNotFound(_)));
        let disk = object(ObjectStoreError::Io(std::io::Error::other("disk")));
        assert!(matches!(to_fdo(disk), zbus::fdo::Error::Failed(_)));
    }
}
