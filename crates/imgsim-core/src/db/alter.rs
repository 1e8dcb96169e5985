//! The direct-on-disk database (alter and imgdata modes).
//!
//! The file stays open and is patched in place: adds write the id table
//! slot and the signature record directly, removes go onto a pending
//! deletions list that save compacts by moving tail signatures into the
//! holes. When the id table runs out of headroom, the leading signatures
//! are relocated to the end of the file and the freed space absorbed into
//! the table. Queries are not supported; bucket state is tracked as sizes
//! only, for the header.

use crate::bucket::{self, NUM_BUCKETS};
use crate::catalog::ImageInfo;
use crate::errors::{DbError, Result};
use crate::format::{DbReader, SizeWidths, ID_HEADROOM, SRZ_V0_7_0, SRZ_V0_9_0, V_CODE};
use crate::query::{QueryOptions, SimValue};
use crate::score::Score;
use crate::signature::{quantize_avgl, ImgData, SIG_RECORD_BYTES};
use crate::ImageId;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use super::{Database, DbMode, WritableDb};

pub(crate) struct AlterDb {
    file: File,
    path: PathBuf,
    /// Offset of the image count field (right after the version code).
    hdr_off: u64,
    /// Offset of the first signature record.
    sig_off: u64,
    /// Offset of the image id table.
    img_off: u64,
    images: HashMap<ImageId, usize>,
    bucket_sizes: Vec<u64>,
    /// Indices freed by removals, compacted on save.
    deleted: Vec<usize>,
    /// The in-file id table is stale and must be rewritten on save.
    rewrite_ids: bool,
    readonly: bool,
}

impl AlterDb {
    /// Open a database file for in-place mutation; `readonly` selects the
    /// imgdata flavor. A missing file gets its basic structure created
    /// first.
    pub fn open(path: &Path, readonly: bool) -> Result<Self> {
        if !path.exists() {
            WritableDb::new()?.save(path)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)?;
        let mut db = Self {
            file,
            path: path.to_path_buf(),
            hdr_off: 4,
            sig_off: 0,
            img_off: 0,
            images: HashMap::new(),
            bucket_sizes: vec![0; NUM_BUCKETS],
            deleted: Vec::new(),
            rewrite_ids: false,
            readonly,
        };
        db.load_header()?;
        Ok(db)
    }

    fn load_header(&mut self) -> Result<()> {
        let mut r = DbReader::new(&self.file);
        let v_code = r.read_u32()?;
        let version = v_code & 0xff;
        let intsizes = v_code >> 8;
        if intsizes == 0 {
            tracing::warn!("old database version");
        } else if intsizes != SizeWidths::NATIVE.encode() {
            return Err(DbError::data("database incompatible with this system"));
        }
        if version != SRZ_V0_7_0 && version != SRZ_V0_9_0 {
            return Err(DbError::data(
                "only the current version is supported in alter mode, upgrade first using normal mode",
            ));
        }

        self.hdr_off = r.position()?;
        let num_images = r.read_u64()?;
        self.sig_off = r.read_u64()?;
        for size in self.bucket_sizes.iter_mut() {
            *size = r.read_u64()?;
        }
        self.img_off = r.position()?;
        self.images.reserve(num_images as usize);
        for k in 0..num_images as usize {
            let id = r.read_u64()?;
            self.images.insert(id, k);
        }
        Ok(())
    }

    fn guard_mutable(&self, what: &'static str) -> Result<()> {
        if self.readonly {
            return Err(DbError::Usage {
                mode: "imgdata",
                what,
            });
        }
        Ok(())
    }

    fn index_of(&self, id: ImageId) -> Result<usize> {
        self.images.get(&id).copied().ok_or(DbError::InvalidId(id))
    }

    fn sig_position(&self, index: usize) -> u64 {
        self.sig_off + (index * SIG_RECORD_BYTES) as u64
    }

    fn get_sig(&self, index: usize) -> Result<ImgData> {
        let mut buf = [0u8; SIG_RECORD_BYTES];
        self.file.read_exact_at(&mut buf, self.sig_position(index))?;
        Ok(ImgData::decode(&buf))
    }

    fn put_sig(&self, index: usize, sig: &ImgData) -> Result<()> {
        self.file.write_all_at(&sig.encode(), self.sig_position(index))?;
        Ok(())
    }

    fn put_id(&self, index: usize, id: ImageId) -> Result<()> {
        self.file
            .write_all_at(&id.to_le_bytes(), self.img_off + (index * 8) as u64)?;
        Ok(())
    }

    /// Make room for more ids by relocating the first few signatures to
    /// the end of the file and absorbing the freed space into the table.
    fn resize_header(&mut self) -> Result<()> {
        let relocate =
            (ID_HEADROOM as usize * 8 + SIG_RECORD_BYTES - 1) / SIG_RECORD_BYTES;
        let count = self.images.len();
        if count < relocate {
            return Err(DbError::internal(
                "header resize requested with too few images",
            ));
        }
        tracing::debug!(relocate, count, "relocating signatures to grow the id table");

        let mut sigs = Vec::with_capacity(relocate);
        for index in 0..relocate {
            sigs.push(self.get_sig(index)?);
        }
        let write_off = self.sig_off + (count * SIG_RECORD_BYTES) as u64;
        for (n, sig) in sigs.iter().enumerate() {
            self.file
                .write_all_at(&sig.encode(), write_off + (n * SIG_RECORD_BYTES) as u64)?;
        }
        self.sig_off += (relocate * SIG_RECORD_BYTES) as u64;

        let appended = count - relocate;
        for index in self.images.values_mut() {
            *index = if *index >= relocate {
                *index - relocate
            } else {
                *index + appended
            };
        }
        self.rewrite_ids = true;
        Ok(())
    }

    /// Relocate signatures from the end into the holes left by deletions.
    fn move_deleted(&mut self) -> Result<()> {
        let size = self.images.len();
        let mut holes: Vec<usize> = self
            .deleted
            .drain(..)
            .filter(|&index| index < size)
            .collect();

        let moves: Vec<(ImageId, usize)> = self
            .images
            .iter()
            .filter(|(_, &index)| index >= size)
            .map(|(&id, &index)| (id, index))
            .collect();
        if moves.len() != holes.len() {
            return Err(DbError::data("not all deleted entries can be purged"));
        }

        for (id, old_index) in moves {
            let hole = holes.pop().ok_or_else(|| {
                DbError::internal("ran out of holes while compacting deletions")
            })?;
            let sig = self.get_sig(old_index)?;
            self.put_sig(hole, &sig)?;
            if !self.rewrite_ids {
                self.put_id(hole, id)?;
            }
            self.images.insert(id, hole);
        }
        Ok(())
    }

    fn save_in_place(&mut self) -> Result<()> {
        self.guard_mutable("save")?;
        if !self.deleted.is_empty() {
            tracing::debug!(deleted = self.deleted.len(), "compacting deleted images");
            self.move_deleted()?;
        }

        if self.rewrite_ids {
            let size = self.images.len();
            let mut ids = vec![u64::MAX; size];
            for (&id, &index) in &self.images {
                if index >= size {
                    return Err(DbError::data("invalid index on save"));
                }
                if ids[index] != u64::MAX {
                    return Err(DbError::data("duplicate index on save"));
                }
                ids[index] = id;
            }
            let mut bytes = Vec::with_capacity(size * 8);
            for id in &ids {
                bytes.extend_from_slice(&id.to_le_bytes());
            }
            self.file.write_all_at(&bytes, self.img_off)?;
            self.rewrite_ids = false;
        }

        let mut header = Vec::with_capacity(16 + NUM_BUCKETS * 8);
        header.extend_from_slice(&(self.images.len() as u64).to_le_bytes());
        header.extend_from_slice(&self.sig_off.to_le_bytes());
        for size in &self.bucket_sizes {
            header.extend_from_slice(&size.to_le_bytes());
        }
        self.file.write_all_at(&V_CODE.to_le_bytes(), 0)?;
        self.file.write_all_at(&header, self.hdr_off)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Database for AlterDb {
    fn mode(&self) -> DbMode {
        if self.readonly {
            DbMode::ImgData
        } else {
            DbMode::Alter
        }
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn has_image(&self, id: ImageId) -> bool {
        self.images.contains_key(&id)
    }

    fn image_ids(&self) -> Vec<ImageId> {
        self.images.keys().copied().collect()
    }

    fn image_infos(&self) -> Result<Vec<ImageInfo>> {
        Err(DbError::Usage {
            mode: self.mode().name(),
            what: "image listing with metadata",
        })
    }

    fn image_dimensions(&self, id: ImageId) -> Result<(u32, u32)> {
        let sig = self.get_sig(self.index_of(id)?)?;
        Ok((sig.width, sig.height))
    }

    fn image_avgl(&self, id: ImageId) -> Result<[Score; 3]> {
        let sig = self.get_sig(self.index_of(id)?)?;
        Ok(quantize_avgl(&sig.avglf))
    }

    fn signature(&self, id: ImageId) -> Result<ImgData> {
        self.get_sig(self.index_of(id)?)
    }

    fn add_signature(&mut self, sig: &ImgData) -> Result<()> {
        self.guard_mutable("adding images")?;
        if self.images.contains_key(&sig.id) {
            return Err(DbError::DuplicateId(sig.id));
        }

        let index = match self.deleted.pop() {
            Some(index) => index,
            None => {
                let index = self.images.len();
                if self.img_off + ((index + 1) * 8) as u64 >= self.sig_off {
                    self.resize_header()?;
                    if self.img_off + ((index + 1) * 8) as u64 >= self.sig_off {
                        return Err(DbError::internal("header resize freed no space"));
                    }
                }
                index
            }
        };

        if !self.rewrite_ids {
            self.put_id(index, sig.id)?;
        }
        self.put_sig(index, sig)?;
        for flat in bucket::named_flat_buckets(sig) {
            self.bucket_sizes[flat] += 1;
        }
        self.images.insert(sig.id, index);
        Ok(())
    }

    fn set_resolution(&mut self, id: ImageId, width: u32, height: u32) -> Result<()> {
        self.guard_mutable("setting the resolution")?;
        let index = self.index_of(id)?;
        let mut sig = self.get_sig(index)?;
        sig.width = width;
        sig.height = height;
        self.put_sig(index, &sig)
    }

    fn set_tags(&mut self, _id: ImageId, _set: u16, _mask: u16) -> Result<()> {
        Err(DbError::Usage {
            mode: self.mode().name(),
            what: "result-filtering tags",
        })
    }

    fn remove_image(&mut self, id: ImageId) -> Result<()> {
        self.guard_mutable("removing images")?;
        let index = self
            .images
            .remove(&id)
            .ok_or(DbError::InvalidId(id))?;
        self.deleted.push(index);
        Ok(())
    }

    fn query(&self, _sig: &ImgData, _opts: &QueryOptions) -> Result<Vec<SimValue>> {
        Err(DbError::Usage {
            mode: self.mode().name(),
            what: "queries",
        })
    }

    fn rehash(&mut self) -> Result<()> {
        self.guard_mutable("rehash")?;
        self.bucket_sizes.iter_mut().for_each(|size| *size = 0);
        let indices: Vec<usize> = self.images.values().copied().collect();
        for index in indices {
            let sig = self.get_sig(index)?;
            for flat in bucket::named_flat_buckets(&sig) {
                self.bucket_sizes[flat] += 1;
            }
        }
        Ok(())
    }

    fn save(&mut self, path: &Path) -> Result<()> {
        if path != self.path {
            return Err(DbError::param(
                "an alter-mode database can only save to its own file",
            ));
        }
        self.save_in_place()
    }

    fn coeff_stats(&self) -> Result<Vec<(u32, u64)>> {
        Err(DbError::Usage {
            mode: self.mode().name(),
            what: "coefficient stats",
        })
    }
}

impl Drop for AlterDb {
    /// The file is the only artifact; flush pending state on teardown.
    fn drop(&mut self) {
        if !self.readonly {
            if let Err(e) = self.save_in_place() {
                tracing::warn!(path = %self.path.display(), error = %e, "alter-mode save on drop failed");
            }
        }
    }
}
