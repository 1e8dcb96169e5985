//! Decode and resample images into the 128x128 working planes.
//!
//! The engine proper only ever sees [`RgbPlanes`]; this module is the
//! decoder/resizer collaborator for callers that start from files or raw
//! bytes. Unrecognizable or truncated input surfaces as an image error.

use crate::errors::{DbError, Result};
use crate::signature::{RgbPlanes, NUM_PIXELS, NUM_PIXELS_SQUARED};
use image::imageops::FilterType;
use std::path::Path;

/// Decode a file and resample to the working resolution.
pub fn planes_from_file(path: &Path) -> Result<RgbPlanes> {
    let bytes = std::fs::read(path)
        .map_err(|e| DbError::Image(format!("cannot read {}: {e}", path.display())))?;
    planes_from_bytes(&bytes)
}

/// Decode an in-memory image and resample to the working resolution.
pub fn planes_from_bytes(bytes: &[u8]) -> Result<RgbPlanes> {
    let decoded = image::load_from_memory(bytes).map_err(|e| DbError::Image(e.to_string()))?;
    let width = decoded.width();
    let height = decoded.height();

    let resized = image::imageops::resize(
        &decoded.to_rgb8(),
        NUM_PIXELS as u32,
        NUM_PIXELS as u32,
        FilterType::Triangle,
    );

    let mut red = Vec::with_capacity(NUM_PIXELS_SQUARED);
    let mut green = Vec::with_capacity(NUM_PIXELS_SQUARED);
    let mut blue = Vec::with_capacity(NUM_PIXELS_SQUARED);
    for pixel in resized.pixels() {
        red.push(pixel.0[0]);
        green.push(pixel.0[1]);
        blue.push(pixel.0[2]);
    }
    RgbPlanes::new(red, green, blue, width, height)
}
