use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex characters kept from the SHA-256 digest when deriving a face id.
const FACE_ID_HEX_LEN: usize = 32;

/// Extension used for cropped face objects in the faces bucket.
pub const FACE_OBJECT_EXTENSION: &str = "jpg";

/// Axis-aligned face region in absolute pixel coordinates of the source image.
///
/// Signed on purpose: the classifier may report boxes that start left of or
/// above the image, and the cropper must be able to reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceCoordinates {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl FaceCoordinates {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y.saturating_add(self.height)
    }

    /// True when the box lies entirely inside a `width` × `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.width > 0
            && self.height > 0
            && self.right() <= i64::from(width)
            && self.bottom() <= i64::from(height)
    }
}

impl fmt::Display for FaceCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

/// A face reported by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bounds: FaceCoordinates,
    /// Raw cascade score (unbounded; higher = more face-like).
    pub score: f64,
}

/// Queue descriptor handed from the detector to the cropper.
///
/// Serialized exactly as
/// `{"original_key": "...", "face_coordinates": {"x": 0, "y": 0, "width": 0, "height": 0}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropTask {
    pub original_key: String,
    pub face_coordinates: FaceCoordinates,
}

impl CropTask {
    pub fn new(original_key: impl Into<String>, face_coordinates: FaceCoordinates) -> Self {
        Self {
            original_key: original_key.into(),
            face_coordinates,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Face id this task produces. Redelivering the same task yields the same id.
    pub fn face_id(&self) -> FaceId {
        FaceId::derive(&self.original_key, &self.face_coordinates)
    }
}

/// Identifier of a cropped face; primary key of the `photos` table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceId(String);

impl FaceId {
    /// Derive a face id from the source key and box.
    ///
    /// SHA-256 over the key, a NUL separator, and the four coordinates as
    /// little-endian i64, truncated to 32 lowercase hex characters.
    pub fn derive(original_key: &str, coords: &FaceCoordinates) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(original_key.as_bytes());
        hasher.update([0u8]);
        for v in [coords.x, coords.y, coords.width, coords.height] {
            hasher.update(v.to_le_bytes());
        }
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(FACE_ID_HEX_LEN);
        for byte in digest.iter().take(FACE_ID_HEX_LEN / 2) {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Accept an id received from outside (chat token, CLI argument).
    ///
    /// Ids are opaque, but must be non-empty, at most 128 bytes, and made of
    /// ASCII alphanumerics, `-`, `_` or `.` so they can double as object keys.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the cropped image in the faces bucket.
    pub fn object_key(&self) -> String {
        format!("{}.{FACE_OBJECT_EXTENSION}", self.0)
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row of the `photos` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub face_id: FaceId,
    pub source_image_id: String,
    pub face_name: Option<String>,
}

impl FaceRecord {
    pub fn unnamed(face_id: FaceId, source_image_id: impl Into<String>) -> Self {
        Self {
            face_id,
            source_image_id: source_image_id.into(),
            face_name: None,
        }
    }

    pub fn is_named(&self) -> bool {
        self.face_name.is_some()
    }
}

/// "Photo uploaded" notification: which object landed in which bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadNotification {
    pub bucket_id: String,
    pub object_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_task_wire_format() {
        let task = CropTask::new("P1.jpg", FaceCoordinates::new(10, 20, 50, 60));
        let value: serde_json::Value = serde_json::from_str(&task.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "original_key": "P1.jpg",
                "face_coordinates": {"x": 10, "y": 20, "width": 50, "height": 60}
            })
        );
    }

    #[test]
    fn test_crop_task_rejects_missing_coordinates() {
        assert!(CropTask::from_json(r#"{"original_key": "P1"}"#).is_err());
        assert!(CropTask::from_json("not json").is_err());
    }

    #[test]
    fn test_face_id_is_deterministic() {
        let coords = FaceCoordinates::new(10, 10, 50, 50);
        let a = FaceId::derive("P1", &coords);
        let b = FaceId::derive("P1", &coords);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FACE_ID_HEX_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_face_id_differs_per_box_and_source() {
        let coords = FaceCoordinates::new(10, 10, 50, 50);
        let base = FaceId::derive("P1", &coords);
        assert_ne!(base, FaceId::derive("P2", &coords));
        assert_ne!(base, FaceId::derive("P1", &FaceCoordinates::new(10, 10, 50, 51)));
        // Separator keeps "P1" + x=1.. distinct from "P11" + ...
        assert_ne!(
            FaceId::derive("P1", &FaceCoordinates::new(1, 0, 1, 1)),
            FaceId::derive("P11", &FaceCoordinates::new(1, 0, 1, 1))
        );
    }

    #[test]
    fn test_face_id_object_key() {
        let id = FaceId::parse("abc123").unwrap();
        assert_eq!(id.object_key(), "abc123.jpg");
    }

    #[test]
    fn test_face_id_parse_rejects_garbage() {
        assert!(FaceId::parse("").is_none());
        assert!(FaceId::parse("   ").is_none());
        assert!(FaceId::parse("../etc/passwd").is_none());
        assert!(FaceId::parse("a b").is_none());
        assert!(FaceId::parse(&"a".repeat(129)).is_none());
        assert_eq!(FaceId::parse(" f1 ").unwrap().as_str(), "f1");
    }

    #[test]
    fn test_fits_within() {
        assert!(FaceCoordinates::new(0, 0, 100, 100).fits_within(100, 100));
        assert!(FaceCoordinates::new(10, 10, 50, 50).fits_within(100, 100));
        assert!(!FaceCoordinates::new(60, 10, 50, 50).fits_within(100, 100));
        assert!(!FaceCoordinates::new(10, 60, 50, 50).fits_within(100, 100));
        assert!(!FaceCoordinates::new(-1, 0, 10, 10).fits_within(100, 100));
        assert!(!FaceCoordinates::new(0, 0, 0, 10).fits_within(100, 100));
        assert!(!FaceCoordinates::new(i64::MAX, 0, i64::MAX, 10).fits_within(100, 100));
    }
}
