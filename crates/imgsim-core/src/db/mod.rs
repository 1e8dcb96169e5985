//! Database modes and the polymorphic database interface.
//!
//! Three concrete implementations share one interface: the fully mutable
//! in-memory database, the read-only query-optimized database, and the
//! direct-on-disk alter database. A database is created in or loaded into
//! one mode and never changes modes.

mod alter;
mod readonly;
mod writable;

pub(crate) use alter::AlterDb;
pub(crate) use readonly::ReadonlyDb;
pub(crate) use writable::WritableDb;

use crate::catalog::ImageInfo;
use crate::errors::{DbError, Result};
use crate::query::{QueryOptions, SimValue};
use crate::score::Score;
use crate::signature::{is_grayscale, ImgData, RgbPlanes};
use crate::ImageId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Database operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbMode {
    /// Full functionality, slower queries.
    Normal,
    /// Fast queries, keeps a signature cache, cannot save.
    ReadOnly,
    /// Fast queries, smallest footprint, no signature access, cannot save.
    Simple,
    /// Fast add/remove on an existing file, no queries.
    Alter,
    /// Like alter but read-only, for retrieving signatures.
    ImgData,
}

impl DbMode {
    /// Parse a mode name as used by the command server's `load` command.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "normal" => Ok(DbMode::Normal),
            "readonly" => Ok(DbMode::ReadOnly),
            "simple" => Ok(DbMode::Simple),
            "alter" => Ok(DbMode::Alter),
            "imgdata" => Ok(DbMode::ImgData),
            other => Err(DbError::param(format!("unknown mode name: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DbMode::Normal => "normal",
            DbMode::ReadOnly => "readonly",
            DbMode::Simple => "simple",
            DbMode::Alter => "alter",
            DbMode::ImgData => "imgdata",
        }
    }
}

impl std::fmt::Display for DbMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::fmt::Debug for dyn Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("mode", &self.mode()).finish()
    }
}

/// The capability set shared by all database modes. Operations that a mode
/// does not support return a usage error and leave the instance usable.
pub trait Database: Send {
    fn mode(&self) -> DbMode;

    /// Live image count.
    fn image_count(&self) -> usize;

    fn has_image(&self, id: ImageId) -> bool;

    /// Ids of all live images.
    fn image_ids(&self) -> Vec<ImageId>;

    /// Catalog entries (id, resolution, averages) for listing.
    fn image_infos(&self) -> Result<Vec<ImageInfo>>;

    /// Original resolution of an image.
    fn image_dimensions(&self, id: ImageId) -> Result<(u32, u32)>;

    /// Quantized DC averages of an image.
    fn image_avgl(&self, id: ImageId) -> Result<[Score; 3]>;

    /// Full stored signature of an image. Requires a signature source
    /// (not available in simple mode).
    fn signature(&self, id: ImageId) -> Result<ImgData>;

    /// Insert a precomputed signature.
    fn add_signature(&mut self, sig: &ImgData) -> Result<()>;

    /// Overwrite the stored original resolution.
    fn set_resolution(&mut self, id: ImageId, width: u32, height: u32) -> Result<()>;

    /// Attach optional result-filtering tags to an image.
    fn set_tags(&mut self, id: ImageId, set: u16, mask: u16) -> Result<()>;

    /// Remove an image (mutable modes) or tombstone it (read-only modes).
    fn remove_image(&mut self, id: ImageId) -> Result<()>;

    /// Ranked similarity query for a signature.
    fn query(&self, sig: &ImgData, opts: &QueryOptions) -> Result<Vec<SimValue>>;

    /// Rebuild the buckets from the signature cache.
    fn rehash(&mut self) -> Result<()>;

    /// Save to a file. Writes a temporary file first so a failed save
    /// never clobbers the existing database.
    fn save(&mut self, path: &Path) -> Result<()>;

    /// Size of every bucket, as (flat bucket index, size) pairs.
    fn coeff_stats(&self) -> Result<Vec<(u32, u64)>>;

    /// Decode, sign and insert an image in one step.
    fn add_image(&mut self, id: ImageId, planes: &RgbPlanes) -> Result<()> {
        if self.has_image(id) {
            return Err(DbError::DuplicateId(id));
        }
        let sig = ImgData::from_planes(id, planes);
        self.add_signature(&sig)
    }

    /// Ranked similarity query seeded by a stored image.
    fn query_by_id(&self, id: ImageId, opts: &QueryOptions) -> Result<Vec<SimValue>> {
        let sig = self.signature(id)?;
        self.query(&sig, opts)
    }

    /// Whether the stored image is grayscale.
    fn is_image_grayscale(&self, id: ImageId) -> Result<bool> {
        Ok(is_grayscale(&self.image_avgl(id)?))
    }
}

/// Open a database file in the given mode. In normal mode a missing file
/// yields an empty database; alter mode creates the file structure.
pub fn load_file(path: &Path, mode: DbMode) -> Result<Box<dyn Database>> {
    let db: Box<dyn Database> = match mode {
        DbMode::Normal => Box::new(WritableDb::load(path)?),
        DbMode::ReadOnly => Box::new(ReadonlyDb::load(path, true)?),
        DbMode::Simple => Box::new(ReadonlyDb::load(path, false)?),
        DbMode::Alter => Box::new(AlterDb::open(path, false)?),
        DbMode::ImgData => Box::new(AlterDb::open(path, true)?),
    };
    tracing::info!(
        path = %path.display(),
        mode = %mode,
        images = db.image_count(),
        "database loaded"
    );
    Ok(db)
}

/// Create an empty mutable database.
pub fn create() -> Result<Box<dyn Database>> {
    Ok(Box::new(WritableDb::new()?))
}

/// Content-based similarity between two stored images.
pub fn similarity(
    db: &dyn Database,
    one: ImageId,
    two: ImageId,
    ignore_color: bool,
) -> Result<Score> {
    let a = db.signature(one)?;
    let b = db.signature(two)?;
    Ok(crate::query::similarity_from_sigs(&a, &b, ignore_color))
}

/// Content-based difference between two stored images.
pub fn difference(
    db: &dyn Database,
    one: ImageId,
    two: ImageId,
    ignore_color: bool,
) -> Result<Score> {
    Ok(100.0 - similarity(db, one, two, ignore_color)?)
}

/// Average luminance/chrominance difference between two stored images.
pub fn avgl_difference(db: &dyn Database, one: ImageId, two: ImageId) -> Result<Score> {
    let a = db.image_avgl(one)?;
    let b = db.image_avgl(two)?;
    Ok(crate::query::avgl_difference(&a, &b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names_roundtrip() {
        for mode in [
            DbMode::Normal,
            DbMode::ReadOnly,
            DbMode::Simple,
            DbMode::Alter,
            DbMode::ImgData,
        ] {
            assert_eq!(DbMode::from_name(mode.name()).unwrap(), mode);
        }
        assert!(DbMode::from_name("turbo").is_err());
    }
}
