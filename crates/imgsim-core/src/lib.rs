//! imgsim-core: content-based image similarity engine
//!
//! This crate provides:
//! - Perceptual signatures from a truncated Haar wavelet decomposition of
//!   the YIQ color planes
//! - An inverted bucket index over (channel, sign, position) coefficients
//! - A weighted query scorer producing ranked similarity results
//! - Paged on-disk bucket storage so the index can exceed RAM
//! - Three database modes (mutable, read-only, direct-on-disk alter) with
//!   a common binary file format
//! - Duplicate-cluster discovery built on similarity queries
//!
//! Similarity is robust to resolution, minor edits, recompression and
//! color shifts; it is not a duplicate-byte detector.

mod bucket;
mod catalog;
mod db;
mod delta;
mod format;
mod haar;
mod page;
mod query;
mod score;
mod signature;

pub mod dupes;
pub mod errors;
pub mod load;

/// Opaque 64-bit image identifier chosen by the caller; unique within a
/// database.
pub type ImageId = u64;

// Re-exports
pub use catalog::ImageInfo;
pub use db::{
    avgl_difference, create, difference, load_file, similarity, Database, DbMode,
};
pub use dupes::{find_duplicates, min_sim, stddev_limit, DupeCluster, DupeOptions};
pub use errors::{DbError, Result};
pub use query::{
    difference_from_sigs, similarity_from_sigs, MaskFilter, QueryOptions, SimValue,
    COMMON_COEF_FRACTION,
};
pub use score::Score;
pub use signature::{
    is_grayscale, quantize_avgl, ImgData, RgbPlanes, GRAYSCALE_THRESHOLD, NUM_CHANNELS,
    NUM_COEFS, NUM_PIXELS, NUM_PIXELS_SQUARED, SIG_RECORD_BYTES,
};
