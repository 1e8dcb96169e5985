//! The inverted bucket index: one list per (channel, sign, magnitude).
//!
//! Bucket (c, s, m) lists every image whose channel-c signature contains
//! the coefficient (s == 0 ? +m : -m). Mutable databases store image ids
//! in paged lists so removal needs no catalog walk; read-only databases
//! store catalog indices in delta-packed queues, which monotonic insertion
//! keeps small. Grayscale images occupy channel-0 buckets only.

use crate::delta::DeltaQueue;
use crate::errors::Result;
use crate::page::{PagedList, ScratchFile};
use crate::signature::{is_grayscale, ImgData, NUM_CHANNELS, NUM_COEFS, NUM_PIXELS_SQUARED};

/// Coefficient signs per channel.
pub const NUM_SIGNS: usize = 2;

/// Total bucket count: 3 channels x 2 signs x 16384 magnitudes.
pub const NUM_BUCKETS: usize = NUM_CHANNELS * NUM_SIGNS * NUM_PIXELS_SQUARED;

/// Flat bucket index for a signed coefficient, plus its magnitude for the
/// weight lookup.
#[inline]
pub(crate) fn bucket_at(channel: usize, coeff: i32) -> (usize, usize) {
    let (sign, magnitude) = if coeff < 0 {
        (1, (-coeff) as usize)
    } else {
        (0, coeff as usize)
    };
    (
        (channel * NUM_SIGNS + sign) * NUM_PIXELS_SQUARED + magnitude,
        magnitude,
    )
}

/// How many channels of a signature participate in bucket placement.
#[inline]
fn active_channels(sig: &ImgData) -> usize {
    if is_grayscale(&sig.avgl()) {
        1
    } else {
        NUM_CHANNELS
    }
}

/// Flat indices of every bucket a signature names (40 per active
/// channel).
pub(crate) fn named_flat_buckets(sig: &ImgData) -> Vec<usize> {
    let channels = active_channels(sig);
    let mut flats = Vec::with_capacity(channels * NUM_COEFS);
    for c in 0..channels {
        for k in 0..NUM_COEFS {
            flats.push(bucket_at(c, sig.sig[c][k]).0);
        }
    }
    flats
}

/// Mutable-mode bucket set: paged lists of image ids backed by a scratch
/// file owned by this set.
pub(crate) struct IdBuckets {
    scratch: ScratchFile,
    buckets: Vec<PagedList>,
}

impl IdBuckets {
    pub fn new() -> Result<Self> {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, PagedList::new);
        Ok(Self {
            scratch: ScratchFile::new()?,
            buckets,
        })
    }

    /// Insert an image into every bucket its signature names.
    pub fn add(&mut self, sig: &ImgData) -> Result<()> {
        let channels = active_channels(sig);
        for c in 0..channels {
            for k in 0..NUM_COEFS {
                let (flat, _) = bucket_at(c, sig.sig[c][k]);
                self.buckets[flat].push(&mut self.scratch, sig.id)?;
            }
        }
        Ok(())
    }

    /// Symmetric removal.
    pub fn remove(&mut self, sig: &ImgData) -> Result<()> {
        let channels = active_channels(sig);
        for c in 0..channels {
            for k in 0..NUM_COEFS {
                let (flat, _) = bucket_at(c, sig.sig[c][k]);
                self.buckets[flat].remove(&self.scratch, sig.id)?;
            }
        }
        Ok(())
    }

    pub fn len_at(&self, channel: usize, coeff: i32) -> usize {
        self.buckets[bucket_at(channel, coeff).0].len()
    }

    /// Visit every image id in the bucket for a signed coefficient.
    pub fn for_each_at(
        &self,
        channel: usize,
        coeff: i32,
        f: &mut dyn FnMut(u64),
    ) -> Result<()> {
        self.buckets[bucket_at(channel, coeff).0].for_each(&self.scratch, f)
    }

    /// Capacity hint for a bucket about to be filled (load path).
    pub fn reserve_flat(&mut self, flat: usize, total: usize) -> Result<()> {
        self.buckets[flat].reserve(&mut self.scratch, total)
    }

    /// Append one id to a bucket addressed by flat index (load path).
    pub fn push_flat(&mut self, flat: usize, id: u64) -> Result<()> {
        self.buckets[flat].push(&mut self.scratch, id)
    }

    /// Bucket sizes in flat (c, s, m) order, for the file header.
    pub fn sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.buckets.iter().map(|b| b.len() as u64)
    }

    /// Empty every bucket but keep scratch pages for reuse.
    pub fn clear_for_rehash(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear_keep_pages();
        }
    }
}

/// One read-only bucket: a frozen delta-packed base plus a delta-packed
/// tail for entries added after load.
#[derive(Default)]
struct IndexBucket {
    base: DeltaQueue,
    tail: DeltaQueue,
}

impl IndexBucket {
    fn len(&self) -> usize {
        self.base.len() + self.tail.len()
    }

    fn push(&mut self, index: u64) {
        self.tail.push(index);
    }

    /// Freeze the tail into the base, compacting wasteful over-allocation.
    fn seal(&mut self) {
        if !self.base.is_empty() {
            return;
        }
        if self.tail.byte_len() * 17 / 16 + 16 < self.tail.byte_capacity() {
            self.tail.shrink_to_fit();
        }
        self.base = std::mem::take(&mut self.tail);
    }

    fn for_each(&self, f: &mut dyn FnMut(u64)) {
        for v in self.base.iter() {
            f(v);
        }
        for v in self.tail.iter() {
            f(v);
        }
    }
}

/// Read-only-mode bucket set: delta-packed catalog indices.
pub(crate) struct IndexBuckets {
    buckets: Vec<IndexBucket>,
}

impl IndexBuckets {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, IndexBucket::default);
        Self { buckets }
    }

    /// Insert a catalog index into every bucket the signature names.
    pub fn add(&mut self, sig: &ImgData, index: u64) {
        let channels = active_channels(sig);
        for c in 0..channels {
            for k in 0..NUM_COEFS {
                let (flat, _) = bucket_at(c, sig.sig[c][k]);
                self.buckets[flat].push(index);
            }
        }
    }

    pub fn len_at(&self, channel: usize, coeff: i32) -> usize {
        self.buckets[bucket_at(channel, coeff).0].len()
    }

    pub fn for_each_at(&self, channel: usize, coeff: i32, f: &mut dyn FnMut(u64)) {
        self.buckets[bucket_at(channel, coeff).0].for_each(f);
    }

    /// Storage hint from the file's bucket size table.
    pub fn reserve_flat(&mut self, flat: usize, total: usize) {
        self.buckets[flat].tail.reserve(total);
    }

    /// Freeze all tails after a bulk load.
    pub fn seal(&mut self) {
        for bucket in &mut self.buckets {
            bucket.seal();
        }
    }

    pub fn sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.buckets.iter().map(|b| b.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::NUM_COEFS;

    /// Signature with chosen channel-0 coefficients and fixed color
    /// channels; `color` forces the grayscale predicate off.
    fn sig_with(id: u64, first: i32, color: bool) -> ImgData {
        let mut sig = [[0i32; NUM_COEFS]; NUM_CHANNELS];
        for c in 0..NUM_CHANNELS {
            for (k, slot) in sig[c].iter_mut().enumerate() {
                *slot = (c as i32 + 1) * 1000 + k as i32 + 1;
            }
        }
        sig[0][0] = first;
        ImgData {
            id,
            sig,
            avglf: [0.5, if color { 0.2 } else { 0.0 }, 0.0],
            width: 100,
            height: 100,
        }
    }

    fn collect_ids(buckets: &IdBuckets, channel: usize, coeff: i32) -> Vec<u64> {
        let mut out = Vec::new();
        buckets
            .for_each_at(channel, coeff, &mut |id| out.push(id))
            .unwrap();
        out
    }

    #[test]
    fn test_bucket_at_sign_split() {
        let (pos, mag) = bucket_at(1, 500);
        let (neg, neg_mag) = bucket_at(1, -500);
        assert_eq!(mag, 500);
        assert_eq!(neg_mag, 500);
        assert_eq!(neg - pos, NUM_PIXELS_SQUARED);
    }

    #[test]
    fn test_add_places_id_in_named_buckets() {
        let mut buckets = IdBuckets::new().unwrap();
        let sig = sig_with(11, -77, true);
        buckets.add(&sig).unwrap();
        assert_eq!(collect_ids(&buckets, 0, -77), vec![11]);
        // The positive twin stays empty.
        assert_eq!(buckets.len_at(0, 77), 0);
        // Color channels were populated.
        assert_eq!(buckets.len_at(1, 2001), 1);
    }

    #[test]
    fn test_grayscale_skips_color_channels() {
        let mut buckets = IdBuckets::new().unwrap();
        let sig = sig_with(5, 33, false);
        buckets.add(&sig).unwrap();
        assert_eq!(buckets.len_at(0, 33), 1);
        assert_eq!(buckets.len_at(1, 2001), 0);
        assert_eq!(buckets.len_at(2, 3001), 0);
    }

    #[test]
    fn test_remove_then_empty() {
        let mut buckets = IdBuckets::new().unwrap();
        let a = sig_with(1, 40, true);
        let b = sig_with(2, 40, true);
        buckets.add(&a).unwrap();
        buckets.add(&b).unwrap();
        assert_eq!(buckets.len_at(0, 40), 2);
        buckets.remove(&a).unwrap();
        assert_eq!(collect_ids(&buckets, 0, 40), vec![2]);
        buckets.remove(&b).unwrap();
        assert!(buckets.sizes().all(|s| s == 0));
    }

    #[test]
    fn test_index_buckets_seal_and_append() {
        let mut buckets = IndexBuckets::new();
        for index in 0..1000u64 {
            buckets.add(&sig_with(index, 123, true), index);
        }
        buckets.seal();
        // Appends after sealing land in the tail but still iterate in order.
        buckets.add(&sig_with(1000, 123, true), 1000);
        let mut seen = Vec::new();
        buckets.for_each_at(0, 123, &mut |i| seen.push(i));
        assert_eq!(seen, (0..=1000).collect::<Vec<_>>());
    }
}
