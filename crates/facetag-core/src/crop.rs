//! Image decoding, bounds validation, and face cropping.

use crate::types::FaceCoordinates;
use image::{DynamicImage, GrayImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CropError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("face box {coords} is outside the {width}x{height} source image")]
    OutOfBounds {
        coords: FaceCoordinates,
        width: u32,
        height: u32,
    },
    #[error("failed to encode face crop: {0}")]
    Encode(String),
}

/// A cropped face, re-encoded as JPEG.
#[derive(Debug, Clone)]
pub struct CroppedFace {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode raw bytes in any format `image` recognises.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, CropError> {
    let img = image::load_from_memory(bytes).map_err(|e| CropError::Decode(e.to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(CropError::ZeroDimensions);
    }
    Ok(img)
}

/// Decode raw bytes straight to single-channel intensity.
pub fn decode_grayscale(bytes: &[u8]) -> Result<GrayImage, CropError> {
    Ok(decode(bytes)?.to_luma8())
}

/// Check that `coords` lies entirely within a `width` × `height` image.
///
/// Never clamps: a box that spills over any edge is rejected.
pub fn validate_bounds(coords: &FaceCoordinates, width: u32, height: u32) -> Result<(), CropError> {
    if coords.fits_within(width, height) {
        Ok(())
    } else {
        Err(CropError::OutOfBounds {
            coords: *coords,
            width,
            height,
        })
    }
}

/// Slice `coords` out of `source` and encode it as JPEG.
pub fn crop_face(
    source: &DynamicImage,
    coords: &FaceCoordinates,
) -> Result<CroppedFace, CropError> {
    validate_bounds(coords, source.width(), source.height())?;

    // fits_within guarantees all four values are non-negative and inside u32 range.
    let (x, y, w, h) = (
        coords.x as u32,
        coords.y as u32,
        coords.width as u32,
        coords.height as u32,
    );

    // JPEG has no alpha channel; flatten to RGB before encoding.
    let face = DynamicImage::ImageRgb8(source.crop_imm(x, y, w, h).to_rgb8());

    let mut jpeg = Vec::new();
    face.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .map_err(|e| CropError::Encode(e.to_string()))?;

    Ok(CroppedFace {
        jpeg,
        width: w,
        height: h,
    })
}
