//! The read-only query-optimized database (readonly and simple modes).
//!
//! Bucket contents are delta-packed catalog indices, so the scoring loop
//! touches no id map at all. Saving is refused. Removal tombstones the
//! catalog entry; the buckets keep the stale index, which the query
//! scanner skips. The readonly flavor keeps a signature cache so stored
//! signatures (and pairwise similarity) remain available; the simple
//! flavor drops it for the smallest footprint.

use crate::bucket::IndexBuckets;
use crate::catalog::{ImageInfo, ReadonlyCatalog, SigCache};
use crate::errors::{DbError, Result};
use crate::format::{self, DbReader};
use crate::query::{self, QueryOptions, QuerySource, SimValue};
use crate::score::Score;
use crate::signature::ImgData;
use crate::ImageId;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{Database, DbMode};

pub(crate) struct ReadonlyDb {
    catalog: ReadonlyCatalog,
    buckets: IndexBuckets,
    cache: Option<SigCache>,
    mode: DbMode,
}

impl ReadonlyDb {
    /// Load a database file; `with_cache` selects the readonly flavor
    /// (signature cache kept) over simple. Old file versions are not
    /// supported here; upgrade them through normal mode first.
    pub fn load(path: &Path, with_cache: bool) -> Result<Self> {
        let mode = if with_cache {
            DbMode::ReadOnly
        } else {
            DbMode::Simple
        };
        let mut db = Self {
            catalog: ReadonlyCatalog::new(),
            buckets: IndexBuckets::new(),
            cache: if with_cache {
                Some(SigCache::new()?)
            } else {
                None
            },
            mode,
        };

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
        if preamble.version < format::SRZ_V0_7_0 {
            return Err(DbError::Usage {
                mode: mode.name(),
                what: "loading old database versions (upgrade via normal mode)",
            });
        }

        let header = format::read_current_header(&mut r, preamble.intsizes)?;
        for (flat, &size) in header.bucket_sizes.iter().enumerate() {
            if size > 0 {
                db.buckets.reserve_flat(flat, size as usize);
            }
        }
        db.catalog.reserve(header.num_images as usize);

        r.seek_to(header.sig_offset)?;
        for k in 0..header.num_images as usize {
            let sig = r.read_sig(&header.widths)?;
            if header.ids[k] != sig.id {
                tracing::warn!(
                    index = k,
                    header_id = header.ids[k],
                    sig_id = sig.id,
                    "header id disagrees with signature id"
                );
            }
            db.insert_entry(&sig)?;
        }
        db.buckets.seal();
        Ok(db)
    }

    fn insert_entry(&mut self, sig: &ImgData) -> Result<()> {
        let index = self.catalog.next_index();
        self.buckets.add(sig, index as u64);
        if let Some(cache) = &mut self.cache {
            let offset = cache.alloc();
            if offset != SigCache::offset_of(index) {
                return Err(DbError::internal("signature cache out of sync with index"));
            }
            cache.write(offset, sig)?;
        }
        self.catalog.push(ImageInfo::from_sig(sig));
        Ok(())
    }

    fn source(&self) -> ReadonlySource<'_> {
        ReadonlySource {
            catalog: &self.catalog,
            buckets: &self.buckets,
        }
    }
}

struct ReadonlySource<'a> {
    catalog: &'a ReadonlyCatalog,
    buckets: &'a IndexBuckets,
}

impl QuerySource for ReadonlySource<'_> {
    fn entry_count(&self) -> usize {
        self.catalog.next_index()
    }

    fn has_tombstones(&self) -> bool {
        true
    }

    fn for_each_entry(&self, f: &mut dyn FnMut(usize, &ImageInfo)) {
        for (index, info) in self.catalog.entries().iter().enumerate() {
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
        self.buckets.for_each_at(channel, coeff, &mut |index| {
            f(index as usize);
        });
        Ok(())
    }
}

impl Database for ReadonlyDb {
    fn mode(&self) -> DbMode {
        self.mode
    }

    fn image_count(&self) -> usize {
        self.catalog.len()
    }

    fn has_image(&self, id: ImageId) -> bool {
        self.catalog.contains(id)
    }

    fn image_ids(&self) -> Vec<ImageId> {
        self.catalog.iter_live().map(|(_, info)| info.id).collect()
    }

    fn image_infos(&self) -> Result<Vec<ImageInfo>> {
        Ok(self.catalog.entries().to_vec())
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
        let cache = self.cache.as_ref().ok_or(DbError::Usage {
            mode: "simple",
            what: "signature access",
        })?;
        cache.read(SigCache::offset_of(index))
    }

    /// Adding to a loaded read-only database is permitted (it is how the
    /// loader itself populates the index), but buckets are only appended,
    /// never re-sorted.
    fn add_signature(&mut self, sig: &ImgData) -> Result<()> {
        if self.catalog.contains(sig.id) {
            return Err(DbError::DuplicateId(sig.id));
        }
        self.insert_entry(sig)
    }

    fn set_resolution(&mut self, id: ImageId, width: u32, height: u32) -> Result<()> {
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
        // Buckets keep the stale index; queries skip the tombstone.
        self.catalog.tombstone(id)?;
        Ok(())
    }

    fn query(&self, sig: &ImgData, opts: &QueryOptions) -> Result<Vec<SimValue>> {
        query::run_query(&self.source(), sig, opts)
    }

    fn rehash(&mut self) -> Result<()> {
        Err(DbError::Usage {
            mode: self.mode.name(),
            what: "rehash",
        })
    }

    fn save(&mut self, _path: &Path) -> Result<()> {
        Err(DbError::Usage {
            mode: self.mode.name(),
            what: "save",
        })
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
