//! The fully mutable in-memory database (normal mode).
//!
//! Catalog and buckets live in memory (bucket contents page out to the
//! scratch file), signatures live in the cache file. Every operation is
//! permitted; queries resolve bucket ids through the catalog, which makes
//! them slower than read-only mode but keeps removal cheap.

use crate::bucket::IdBuckets;
use crate::catalog::{ImageInfo, SigCache, WritableCatalog};
use crate::errors::{DbError, Result};
use crate::format::{
    self, DbReader, DbWriter, SizeWidths, SRZ_V0_6_0, SRZ_V0_6_1, SRZ_V0_7_0, V_CODE,
};
use crate::query::{self, QueryOptions, QuerySource, SimValue};
use crate::score::Score;
use crate::signature::ImgData;
use crate::ImageId;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::{Database, DbMode};

pub(crate) struct WritableDb {
    catalog: WritableCatalog,
    buckets: IdBuckets,
    cache: SigCache,
}

impl WritableDb {
    pub fn new() -> Result<Self> {
        Ok(Self {
            catalog: WritableCatalog::new(),
            buckets: IdBuckets::new()?,
            cache: SigCache::new()?,
        })
    }

    /// Load a database file. A missing file yields an empty database.
    pub fn load(path: &Path) -> Result<Self> {
        let mut db = Self::new()?;
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "database file missing, starting empty");
                return Ok(db);
            }
            Err(e) => return Err(e.into()),
        };
        let mut r = DbReader::new(BufReader::new(file));
        let preamble = format::read_preamble(&mut r)?;
        if preamble.version < SRZ_V0_7_0 {
            db.load_old_stream(&mut r, preamble.version)?;
            return Ok(db);
        }

        let header = format::read_current_header(&mut r, preamble.intsizes)?;
        for (flat, &size) in header.bucket_sizes.iter().enumerate() {
            if size > 0 {
                db.buckets.reserve_flat(flat, size as usize)?;
            }
        }

        r.seek_to(header.sig_offset)?;
        for k in 0..header.num_images as usize {
            let sig = r.read_sig(&header.widths)?;
            if header.ids[k] != sig.id {
                return Err(DbError::data(format!(
                    "header id {:08x} disagrees with signature id {:08x} at index {k}",
                    header.ids[k], sig.id
                )));
            }
            db.insert_loaded(&sig)?;
        }
        Ok(db)
    }

    /// Loader for version 2 and 3 files: bucket contents stored inline,
    /// optionally replaced by an all-ones "no buckets" indicator, and a
    /// per-image keyword block that must be empty.
    fn load_old_stream(
        &mut self,
        r: &mut DbReader<BufReader<File>>,
        version: u32,
    ) -> Result<()> {
        if version < SRZ_V0_6_0 {
            return Err(DbError::data("database from a version prior to 0.6"));
        }
        if version > SRZ_V0_6_1 {
            return Err(DbError::data("database from a version after 0.6.1"));
        }
        tracing::debug!(version, "loading old database version");

        // First pass skips over the bucket sections to find out whether
        // this file carries bucket contents at all.
        let start = r.position()?;
        let mut buckets_valid = true;
        for flat in 0..crate::bucket::NUM_BUCKETS {
            let mut size = r.read_u32()?;
            if size == u32::MAX {
                if flat != 0 {
                    return Err(DbError::data("no-bucket indicator too late"));
                }
                buckets_valid = false;
                size = r.read_u32()?;
            }
            if buckets_valid {
                r.skip(size as u64 * 8)?;
            }
        }
        let _num_images = r.read_u64()?;
        r.seek_to(start)?;

        // Second pass: load bucket contents (image ids), or just reserve.
        if !buckets_valid {
            r.read_u32()?; // the indicator
        }
        for flat in 0..crate::bucket::NUM_BUCKETS {
            let size = r.read_u32()? as usize;
            if size == 0 {
                continue;
            }
            if !buckets_valid {
                self.buckets.reserve_flat(flat, size)?;
                continue;
            }
            for _ in 0..size {
                let id = r.read_u64()?;
                self.buckets.push_flat(flat, id)?;
            }
        }

        // Signatures, each followed by a keyword count that must be zero.
        let num_images = r.read_u64()?;
        for _ in 0..num_images {
            // Versions 2 and 3 share the current record byte layout.
            let sig = r.read_sig(&SizeWidths::NATIVE)?;
            let keywords = r.read_i32()?;
            if keywords != 0 {
                return Err(DbError::data("keywords are not supported"));
            }
            let index = self.catalog.next_index();
            let offset = self.cache.alloc();
            if offset != SigCache::offset_of(index) {
                return Err(DbError::internal("signature cache out of sync with index"));
            }
            self.cache.write(offset, &sig)?;
            if !buckets_valid {
                self.buckets.add(&sig)?;
            }
            self.catalog.insert(ImageInfo::from_sig(&sig));
        }
        Ok(())
    }

    fn insert_loaded(&mut self, sig: &ImgData) -> Result<()> {
        let index = self.catalog.next_index();
        let offset = self.cache.alloc();
        if offset != SigCache::offset_of(index) {
            return Err(DbError::internal("signature cache out of sync with index"));
        }
        self.cache.write(offset, sig)?;
        self.buckets.add(sig)?;
        self.catalog.insert(ImageInfo::from_sig(sig));
        Ok(())
    }

    fn source(&self) -> WritableSource<'_> {
        WritableSource {
            catalog: &self.catalog,
            buckets: &self.buckets,
        }
    }
}

struct WritableSource<'a> {
    catalog: &'a WritableCatalog,
    buckets: &'a IdBuckets,
}

impl QuerySource for WritableSource<'_> {
    fn entry_count(&self) -> usize {
        self.catalog.next_index()
    }

    fn has_tombstones(&self) -> bool {
        false
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, &ImageInfo)) {
        for (index, info) in self.catalog.iter() {
            f(index, info);
        }
    }

    fn bucket_len(&self, channel: usize, coeff: i32) -> usize {
        self.buckets.len_at(channel, coeff)
    }

    fn for_each_bucket_index(
        &self,
        channel: usize,
        coeff: i32,
        f: &mut dyn FnMut(usize),
    ) -> Result<()> {
        // Mutable buckets hold image ids; resolve each through the catalog.
        self.buckets.for_each_at(channel, coeff, &mut |id| {
            if let Ok(index) = self.catalog.index_of(id) {
                f(index);
            }
        })
    }
}

impl Database for WritableDb {
    fn mode(&self) -> DbMode {
        DbMode::Normal
    }

    fn image_count(&self) -> usize {
        self.catalog.len()
    }

    fn has_image(&self, id: ImageId) -> bool {
        self.catalog.contains(id)
    }

    fn image_ids(&self) -> Vec<ImageId> {
        self.catalog.iter().map(|(_, info)| info.id).collect()
    }

    fn image_infos(&self) -> Result<Vec<ImageInfo>> {
        Ok(self.catalog.iter().map(|(_, info)| *info).collect())
    }

    fn image_dimensions(&self, id: ImageId) -> Result<(u32, u32)> {
        let info = self.catalog.get(id)?;
        Ok((info.width, info.height))
    }

    fn image_avgl(&self, id: ImageId) -> Result<[Score; 3]> {
        Ok(self.catalog.get(id)?.avgl)
    }

    fn signature(&self, id: ImageId) -> Result<ImgData> {
        let index = self.catalog.index_of(id)?;
        self.cache.read(SigCache::offset_of(index))
    }

    fn add_signature(&mut self, sig: &ImgData) -> Result<()> {
        if self.catalog.contains(sig.id) {
            return Err(DbError::DuplicateId(sig.id));
        }
        self.insert_loaded(sig)
    }

    fn set_resolution(&mut self, id: ImageId, width: u32, height: u32) -> Result<()> {
        let index = self.catalog.index_of(id)?;
        let offset = SigCache::offset_of(index);
        let mut sig = self.cache.read(offset)?;
        sig.width = width;
        sig.height = height;
        self.cache.write(offset, &sig)?;
        let info = self.catalog.get_mut(id)?;
        info.width = width;
        info.height = height;
        Ok(())
    }

    fn set_tags(&mut self, id: ImageId, set: u16, mask: u16) -> Result<()> {
        let info = self.catalog.get_mut(id)?;
        info.set = set;
        info.mask = mask;
        Ok(())
    }

    fn remove_image(&mut self, id: ImageId) -> Result<()> {
        let index = self.catalog.index_of(id)?;
        let sig = self.cache.read(SigCache::offset_of(index))?;
        self.buckets.remove(&sig)?;
        // Catalog removal is last so a failed removal cannot leave a
        // mapped id with missing bucket entries.
        self.catalog.remove(id)?;
        Ok(())
    }

    fn query(&self, sig: &ImgData, opts: &QueryOptions) -> Result<Vec<SimValue>> {
        query::run_query(&self.source(), sig, opts)
    }

    fn rehash(&mut self) -> Result<()> {
        self.buckets.clear_for_rehash();
        for index in self.catalog.iter().map(|(index, _)| index).collect::<Vec<_>>() {
            let sig = self.cache.read(SigCache::offset_of(index))?;
            self.buckets.add(&sig)?;
        }
        Ok(())
    }

    fn save(&mut self, path: &Path) -> Result<()> {
        let mut temp = path.as_os_str().to_owned();
        temp.push(".temp");
        let temp = std::path::PathBuf::from(temp);

        let file = File::create(&temp)?;
        let mut w = DbWriter::new(BufWriter::new(file));
        w.write_u32(V_CODE)?;
        let count = self.catalog.len() as u64;
        w.write_u64(count)?;
        let sig_offset = format::first_sig_offset(count);
        w.write_u64(sig_offset)?;
        for size in self.buckets.sizes() {
            w.write_u64(size)?;
        }
        for (_, info) in self.catalog.iter() {
            w.write_u64(info.id)?;
        }
        w.pad_to(sig_offset)?;
        for (index, _) in self.catalog.iter() {
            let sig = self.cache.read(SigCache::offset_of(index))?;
            w.write_sig(&sig)?;
        }
        w.flush()?;
        std::fs::rename(&temp, path)?;
        tracing::debug!(path = %path.display(), images = count, "database saved");
        Ok(())
    }

    fn coeff_stats(&self) -> Result<Vec<(u32, u64)>> {
        Ok(self
            .buckets
            .sizes()
            .enumerate()
            .map(|(flat, size)| (flat as u32, size))
            .collect())
    }
}
