//! facetag-core — Face classification, cropping, and pipeline types.
//!
//! Uses the SeetaFace funnel cascade (via `rustface`) to find frontal faces,
//! and the `image` crate to decode photos and encode face crops.

pub mod classifier;
pub mod crop;
pub mod links;
pub mod token;
pub mod trigger;
pub mod types;

pub use classifier::{CascadeClassifier, Classifier, ClassifierError, ScanParams};
pub use crop::{CropError, CroppedFace};
pub use links::Links;
pub use token::{ReplyContext, TokenError};
pub use trigger::TriggerEvent;
pub use types::{CropTask, Detection, FaceCoordinates, FaceId, FaceRecord, UploadNotification};
