//! Frontal-face classifier backed by the `rustface` crate (SeetaFace funnel cascade).
//!
//! The cascade scans an image pyramid with a sliding window; the scan
//! parameters are fixed per classifier instance so results are deterministic
//! for a given image.

use crate::types::{Detection, FaceCoordinates};
use rustface::ImageData;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

const DEFAULT_MIN_FACE_SIZE: u32 = 20;
const DEFAULT_SCORE_THRESHOLD: f64 = 2.0;
const DEFAULT_PYRAMID_SCALE_FACTOR: f32 = 0.8;
const DEFAULT_WINDOW_STEP: u32 = 4;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0} (get seeta_fd_frontal_v1.0.bin from the rustface repo)")]
    ModelNotFound(String),
    #[error("failed to read model: {0}")]
    ModelRead(#[from] std::io::Error),
    #[error("invalid scan parameters: {0}")]
    InvalidParams(String),
}

/// Pluggable face classification backend.
///
/// Implementations must be stateless across calls: the detector shares one
/// instance between concurrent invocations.
pub trait Classifier: Send + Sync {
    /// Detect faces in a row-major grayscale buffer of `width` × `height` bytes.
    fn classify(&self, gray: &[u8], width: u32, height: u32) -> Vec<Detection>;
}

/// Fixed scan parameters for the sliding-window cascade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParams {
    /// Smallest face edge (pixels) the pyramid scans for.
    pub min_face_size: u32,
    /// Minimum cascade score for a window to count as a face.
    pub score_threshold: f64,
    /// Downscale ratio between pyramid levels, in (0, 1).
    pub pyramid_scale_factor: f32,
    /// Horizontal and vertical window stride (pixels).
    pub window_step: u32,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            pyramid_scale_factor: DEFAULT_PYRAMID_SCALE_FACTOR,
            window_step: DEFAULT_WINDOW_STEP,
        }
    }
}

impl ScanParams {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.min_face_size < 20 {
            // The SeetaFace cascade window is 40px; rustface rejects anything under 20.
            return Err(ClassifierError::InvalidParams(format!(
                "min_face_size must be >= 20, got {}",
                self.min_face_size
            )));
        }
        if !(self.pyramid_scale_factor > 0.0 && self.pyramid_scale_factor < 1.0) {
            return Err(ClassifierError::InvalidParams(format!(
                "pyramid_scale_factor must be in (0, 1), got {}",
                self.pyramid_scale_factor
            )));
        }
        if self.window_step == 0 {
            return Err(ClassifierError::InvalidParams("window_step must be > 0".into()));
        }
        Ok(())
    }
}

/// SeetaFace cascade classifier.
///
/// Holds the parsed model; a fresh `rustface` detector is built per call
/// because the detector itself is stateful (`&mut self`).
pub struct CascadeClassifier {
    model: rustface::Model,
    params: ScanParams,
}

impl CascadeClassifier {
    /// Load the SeetaFace model from disk.
    pub fn load(model_path: &Path, params: ScanParams) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }
        let file = File::open(model_path)?;
        let classifier = Self::from_reader(BufReader::new(file), params)?;
        tracing::info!(path = %model_path.display(), ?params, "loaded SeetaFace model");
        Ok(classifier)
    }

    /// Parse a SeetaFace model from any reader.
    pub fn from_reader<R: Read>(reader: R, params: ScanParams) -> Result<Self, ClassifierError> {
        params.validate()?;
        let model = rustface::read_model(reader)?;
        Ok(Self { model, params })
    }
}

impl Classifier for CascadeClassifier {
    fn classify(&self, gray: &[u8], width: u32, height: u32) -> Vec<Detection> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.params.min_face_size);
        detector.set_score_thresh(self.params.score_threshold);
        detector.set_pyramid_scale_factor(self.params.pyramid_scale_factor);
        detector.set_slide_window_step(self.params.window_step, self.params.window_step);

        let mut image = ImageData::new(gray, width, height);
        let faces = detector.detect(&mut image);
        tracing::debug!(width, height, faces = faces.len(), "cascade scan finished");

        faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                Detection {
                    bounds: FaceCoordinates::new(
                        i64::from(bbox.x()),
                        i64::from(bbox.y()),
                        i64::from(bbox.width()),
                        i64::from(bbox.height()),
                    ),
                    score: face.score(),
                }
            })
            .collect()
    }
}
