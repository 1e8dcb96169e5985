//! The query engine: scored scans over the catalog driven by bucket
//! lookups, plus pairwise similarity between stored signatures.
//!
//! Scores accumulate distance (lower is better): the DC term adds weighted
//! luminance/chrominance differences for every image, then each bucket
//! named by the query signature subtracts its weight from every listed
//! image. The per-bucket weights also accumulate into a scale factor that
//! normalizes final scores into roughly 0..100.

use crate::catalog::ImageInfo;
use crate::errors::Result;
use crate::score::{bin_for, Score, WEIGHTS};
use crate::signature::{is_grayscale, quantize_avgl, ImgData, NUM_CHANNELS, NUM_COEFS};
use crate::ImageId;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};

/// A bucket holding more than this fraction of the catalog is skipped
/// under [`QueryOptions::nocommon`]. Preserved exactly for score
/// compatibility with existing databases.
pub const COMMON_COEF_FRACTION: usize = 10;

/// Mask predicate for result filtering: an entry survives when
/// `(entry.mask & and) == xor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskFilter {
    pub and: u16,
    pub xor: u16,
}

/// Query options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Maximum results to return.
    pub numres: usize,
    /// The query is a hand-drawn sketch; use the adjusted weight table.
    #[serde(default)]
    pub sketch: bool,
    /// Disregard color information even for color queries.
    #[serde(default)]
    pub grayscale: bool,
    /// Return only the best match from each `set` tag.
    #[serde(default)]
    pub uniqueset: bool,
    /// Skip coefficients present in at least 10% of the catalog.
    #[serde(default)]
    pub nocommon: bool,
    /// Check only the DC component; no coefficient terms.
    #[serde(default)]
    pub fast: bool,
    /// Optional mask predicate on entry tags.
    #[serde(default)]
    pub mask: Option<MaskFilter>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            numres: 16,
            sketch: false,
            grayscale: false,
            uniqueset: false,
            nocommon: false,
            fast: false,
            mask: None,
        }
    }
}

impl QueryOptions {
    pub fn with_limit(numres: usize) -> Self {
        Self {
            numres,
            ..Self::default()
        }
    }
}

/// One ranked query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimValue {
    pub id: ImageId,
    /// Similarity in approximately 0..100; higher is more similar.
    pub score: Score,
    pub width: u32,
    pub height: u32,
}

/// What the scoring scan needs from a database implementation.
pub(crate) trait QuerySource {
    /// Size of the score buffer: one slot per index ever assigned.
    fn entry_count(&self) -> usize;
    /// Whether tombstoned entries (zeroed luminance) must be skipped.
    fn has_tombstones(&self) -> bool;
    /// Visit catalog entries in index order, tombstones included.
    fn for_each_entry(&self, f: &mut dyn FnMut(usize, &ImageInfo));
    /// Number of images in the bucket for a signed coefficient.
    fn bucket_len(&self, channel: usize, coeff: i32) -> usize;
    /// Visit the catalog index of every image in a bucket.
    fn for_each_bucket_index(
        &self,
        channel: usize,
        coeff: i32,
        f: &mut dyn FnMut(usize),
    ) -> Result<()>;
}

/// Ranking candidate; the heap keeps the worst (largest distance) on top.
struct Candidate {
    score: Score,
    index: usize,
    info: ImageInfo,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.index == other.index
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.index.cmp(&other.index))
    }
}

/// Run a scored scan for `sig` against `src`.
pub(crate) fn run_query(
    src: &dyn QuerySource,
    sig: &ImgData,
    opts: &QueryOptions,
) -> Result<Vec<SimValue>> {
    let query_avgl = quantize_avgl(&sig.avglf);
    let colors = if opts.grayscale || is_grayscale(&query_avgl) {
        1
    } else {
        NUM_CHANNELS
    };
    let sketch = opts.sketch as usize;
    let count = src.entry_count();
    let mut scores = vec![0 as Score; count];

    // DC term for every entry.
    src.for_each_entry(&mut |index, info| {
        let mut s = 0 as Score;
        for c in 0..colors {
            s += WEIGHTS[sketch][0][c] * (info.avgl[c] - query_avgl[c]).abs();
        }
        scores[index] = s;
    });

    // Coefficient terms; `fast` checks only the DC component.
    let mut scale = 0 as Score;
    if !opts.fast {
        for k in 0..NUM_COEFS {
            for c in 0..colors {
                let coeff = sig.sig[c][k];
                let in_bucket = src.bucket_len(c, coeff);
                if in_bucket == 0 {
                    continue;
                }
                if opts.nocommon && in_bucket > count / COMMON_COEF_FRACTION {
                    continue;
                }
                let weight = WEIGHTS[sketch][bin_for(coeff.unsigned_abs() as usize)][c];
                scale -= weight;
                src.for_each_bucket_index(c, coeff, &mut |index| {
                    scores[index] -= weight;
                })?;
            }
        }
    }

    // Filter and rank through a bounded worst-at-top heap.
    let tombstones = src.has_tombstones();
    let skip = |info: &ImageInfo| {
        (tombstones && info.avgl[0] == 0.0)
            || opts
                .mask
                .map(|m| (info.mask & m.and) != m.xor)
                .unwrap_or(false)
    };

    let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
    let mut sets: HashMap<u16, usize> = HashMap::new();
    let mut need = opts.numres;

    src.for_each_entry(&mut |index, info| {
        if heap.len() < need {
            if skip(info) {
                return;
            }
            if opts.uniqueset {
                let seen = sets.entry(info.set).or_insert(0);
                *seen += 1;
                if *seen > 1 {
                    need += 1;
                }
            }
            heap.push(Candidate {
                score: scores[index],
                index,
                info: *info,
            });
        } else if need > 0 && scores[index] < heap.peek().unwrap().score {
            if skip(info) {
                return;
            }
            if opts.uniqueset {
                heap.push(Candidate {
                    score: scores[index],
                    index,
                    info: *info,
                });
                let seen = sets.entry(info.set).or_insert(0);
                *seen += 1;
                if *seen > 1 {
                    need += 1;
                }
                while heap.len() > need
                    || heap.peek().is_some_and(|worst| sets[&worst.info.set] > 1)
                {
                    let Some(worst) = heap.pop() else {
                        break;
                    };
                    let seen = sets.get_mut(&worst.info.set).unwrap();
                    if *seen > 1 {
                        need -= 1;
                    }
                    *seen -= 1;
                }
            } else {
                heap.pop();
                heap.push(Candidate {
                    score: scores[index],
                    index,
                    info: *info,
                });
            }
        }
    });

    // Normalize into similarity space and emit best-first.
    let scale = if scale != 0.0 { 1.0 / scale } else { scale };
    let mut results = Vec::with_capacity(heap.len());
    while let Some(candidate) = heap.pop() {
        let keep = if opts.uniqueset {
            let seen = sets.get_mut(&candidate.info.set).unwrap();
            let keep = *seen < 2;
            *seen -= 1;
            keep
        } else {
            true
        };
        if keep {
            results.push(SimValue {
                id: candidate.info.id,
                score: candidate.score * 100.0 * scale,
                width: candidate.info.width,
                height: candidate.info.height,
            });
        }
    }
    results.reverse();
    Ok(results)
}

/// Content-based similarity between two signatures, in roughly 0..100.
/// Symmetric in its arguments. With `ignore_color` (or either image
/// grayscale) only the luminance channel participates.
pub fn similarity_from_sigs(a: &ImgData, b: &ImgData, ignore_color: bool) -> Score {
    let avgl_a = quantize_avgl(&a.avglf);
    let avgl_b = quantize_avgl(&b.avglf);
    let colors = if ignore_color || is_grayscale(&avgl_a) || is_grayscale(&avgl_b) {
        1
    } else {
        NUM_CHANNELS
    };

    let mut score = 0 as Score;
    let mut scale = 0 as Score;
    for c in 0..colors {
        score += 2.0 * WEIGHTS[0][0][c] * (avgl_a[c] - avgl_b[c]).abs();
    }

    for c in 0..colors {
        let mut sig_a = a.sig[c];
        let mut sig_b = b.sig[c];
        sig_a.sort_unstable();
        sig_b.sort_unstable();

        let mut i = 0;
        let mut j = 0;
        while i < NUM_COEFS || j < NUM_COEFS {
            let va = if i == NUM_COEFS { i32::MAX } else { sig_a[i] };
            let vb = if j == NUM_COEFS { i32::MAX } else { sig_b[j] };
            let low = va.min(vb);
            let weight = WEIGHTS[0][bin_for(low.unsigned_abs() as usize)][c];
            scale -= weight;
            if va == vb {
                score -= weight;
            }
            if va <= vb {
                i += 1;
            }
            if vb <= va {
                j += 1;
            }
        }
    }

    score * 100.0 / scale
}

/// Content-based difference: `100 - similarity`.
pub fn difference_from_sigs(a: &ImgData, b: &ImgData, ignore_color: bool) -> Score {
    100.0 - similarity_from_sigs(a, b, ignore_color)
}

/// Sum of absolute DC component differences.
pub fn avgl_difference(a: &[Score; 3], b: &[Score; 3]) -> Score {
    (a[0] - b[0]).abs() + (a[1] - b[1]).abs() + (a[2] - b[2]).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::NUM_PIXELS_SQUARED;

    /// In-memory query source over explicit entries and bucket contents.
    struct FakeSource {
        entries: Vec<ImageInfo>,
        tombstones: bool,
        // (channel, coeff) -> indices
        buckets: HashMap<(usize, i32), Vec<usize>>,
    }

    impl QuerySource for FakeSource {
        fn entry_count(&self) -> usize {
            self.entries.len()
        }
        fn has_tombstones(&self) -> bool {
            self.tombstones
        }
        fn for_each_entry(&self, f: &mut dyn FnMut(usize, &ImageInfo)) {
            for (index, info) in self.entries.iter().enumerate() {
                f(index, info);
            }
        }
        fn bucket_len(&self, channel: usize, coeff: i32) -> usize {
            self.buckets
                .get(&(channel, coeff))
                .map(|v| v.len())
                .unwrap_or(0)
        }
        fn for_each_bucket_index(
            &self,
            channel: usize,
            coeff: i32,
            f: &mut dyn FnMut(usize),
        ) -> Result<()> {
            if let Some(indices) = self.buckets.get(&(channel, coeff)) {
                for &i in indices {
                    f(i);
                }
            }
            Ok(())
        }
    }

    fn color_sig(id: ImageId, positions: &[i32; NUM_COEFS]) -> ImgData {
        ImgData {
            id,
            sig: [*positions, *positions, *positions],
            avglf: [0.5, 0.1, 0.1],
            width: 32,
            height: 32,
        }
    }

    fn positions(start: i32) -> [i32; NUM_COEFS] {
        let mut p = [0i32; NUM_COEFS];
        for (k, slot) in p.iter_mut().enumerate() {
            *slot = start + k as i32;
        }
        p
    }

    fn source_with(sigs: &[ImgData], tombstones: bool) -> FakeSource {
        let mut buckets: HashMap<(usize, i32), Vec<usize>> = HashMap::new();
        let entries: Vec<ImageInfo> = sigs.iter().map(ImageInfo::from_sig).collect();
        for (index, sig) in sigs.iter().enumerate() {
            for c in 0..NUM_CHANNELS {
                for &coeff in &sig.sig[c] {
                    buckets.entry((c, coeff)).or_default().push(index);
                }
            }
        }
        FakeSource {
            entries,
            tombstones,
            buckets,
        }
    }

    #[test]
    fn test_self_query_scores_100() {
        let sig = color_sig(1, &positions(100));
        let src = source_with(std::slice::from_ref(&sig), false);
        let results = run_query(&src, &sig, &QueryOptions::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
        assert!(results[0].score >= 99.0, "score={}", results[0].score);
    }

    #[test]
    fn test_disjoint_images_rank_below_self() {
        let mut sigs = vec![color_sig(0, &positions(1))];
        for n in 1..10 {
            sigs.push(color_sig(n, &positions(1 + 50 * n as i32)));
        }
        let src = source_with(&sigs, false);
        let results = run_query(&src, &sigs[3], &QueryOptions::with_limit(10)).unwrap();
        assert_eq!(results[0].id, 3);
        assert!(results[0].score > 95.0);
        for other in &results[1..] {
            assert!(other.score < 50.0, "{}: {}", other.id, other.score);
        }
    }

    #[test]
    fn test_dc_term_symmetric() {
        let a = color_sig(1, &positions(10));
        let mut b = color_sig(2, &positions(500));
        b.avglf = [0.8, -0.05, 0.2];
        // DC distance computed either direction matches.
        let (qa, qb) = (quantize_avgl(&a.avglf), quantize_avgl(&b.avglf));
        let mut forward = 0.0;
        let mut backward = 0.0;
        for c in 0..3 {
            forward += WEIGHTS[0][0][c] * (qa[c] - qb[c]).abs();
            backward += WEIGHTS[0][0][c] * (qb[c] - qa[c]).abs();
        }
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_tombstoned_entry_never_returned() {
        let sigs = vec![color_sig(1, &positions(10)), color_sig(2, &positions(10))];
        let mut src = source_with(&sigs, true);
        // Tombstone index 0 the way the read-only catalog does.
        src.entries[0].avgl[0] = 0.0;
        let results = run_query(&src, &sigs[0], &QueryOptions::default()).unwrap();
        assert!(results.iter().all(|r| r.id != 1));
    }

    #[test]
    fn test_nocommon_skips_flooded_bucket() {
        // Eleven images share one coefficient; with nocommon set that
        // bucket (> 10% of the catalog) must not contribute.
        let shared = 777i32;
        let mut sigs = Vec::new();
        for n in 0..11u64 {
            let mut p = positions(1000 + 50 * n as i32);
            p[0] = shared;
            sigs.push(color_sig(n, &p));
        }
        let src = source_with(&sigs, false);
        let opts = QueryOptions {
            numres: 11,
            nocommon: true,
            ..QueryOptions::default()
        };
        let with_nocommon = run_query(&src, &sigs[0], &opts).unwrap();
        let without = run_query(&src, &sigs[0], &QueryOptions::with_limit(11)).unwrap();
        // The shared coefficient no longer links the other images: their
        // scores drop to the DC floor.
        let floor = with_nocommon.iter().find(|r| r.id == 5).unwrap();
        let linked = without.iter().find(|r| r.id == 5).unwrap();
        assert!(floor.score < linked.score);
    }

    #[test]
    fn test_mask_filter_drops_mismatches() {
        let sigs = vec![color_sig(1, &positions(10)), color_sig(2, &positions(10))];
        let mut src = source_with(&sigs, false);
        src.entries[0].mask = 0b0011;
        src.entries[1].mask = 0b0100;
        let opts = QueryOptions {
            mask: Some(MaskFilter { and: 0b0111, xor: 0b0011 }),
            ..QueryOptions::default()
        };
        let results = run_query(&src, &sigs[0], &opts).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn test_uniqueset_keeps_best_per_set() {
        let sigs = vec![
            color_sig(1, &positions(10)),
            color_sig(2, &positions(10)),
            color_sig(3, &positions(2000)),
        ];
        let mut src = source_with(&sigs, false);
        src.entries[0].set = 7;
        src.entries[1].set = 7;
        src.entries[2].set = 9;
        let opts = QueryOptions {
            numres: 3,
            uniqueset: true,
            ..QueryOptions::default()
        };
        let results = run_query(&src, &sigs[0], &opts).unwrap();
        let from_set_7 = results
            .iter()
            .filter(|r| r.id == 1 || r.id == 2)
            .count();
        assert_eq!(from_set_7, 1);
    }

    #[test]
    fn test_fast_uses_dc_only() {
        let a = color_sig(1, &positions(10));
        let mut b = color_sig(2, &positions(600));
        b.avglf = a.avglf; // identical DC, disjoint coefficients
        let src = source_with(&[a.clone(), b], false);
        let opts = QueryOptions {
            fast: true,
            ..QueryOptions::default()
        };
        let results = run_query(&src, &a, &opts).unwrap();
        // No coefficient terms ran: scale is zero and both scores collapse.
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].score, results[1].score);
    }

    #[test]
    fn test_numres_zero_returns_nothing() {
        let sig = color_sig(1, &positions(10));
        let src = source_with(std::slice::from_ref(&sig), false);
        let results = run_query(&src, &sig, &QueryOptions::with_limit(0)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_pairwise_similarity_laws() {
        let a = color_sig(1, &positions(10));
        let mut b = color_sig(2, &positions(30));
        b.avglf = [0.4, 0.15, -0.1];
        let ab = similarity_from_sigs(&a, &b, false);
        let ba = similarity_from_sigs(&b, &a, false);
        assert!((ab - ba).abs() < 1e-4);
        let self_sim = similarity_from_sigs(&a, &a, false);
        assert!((self_sim - 100.0).abs() < 1e-3);
        assert!((difference_from_sigs(&a, &b, false) - (100.0 - ab)).abs() < 1e-4);
    }

    #[test]
    fn test_pairwise_sign_matters() {
        // Same positions with flipped signs share nothing.
        let a = color_sig(1, &positions(10));
        let mut flipped = positions(10);
        for v in flipped.iter_mut() {
            *v = -*v;
        }
        let b = color_sig(2, &flipped);
        let same = similarity_from_sigs(&a, &a, false);
        let opposite = similarity_from_sigs(&a, &b, false);
        assert!(opposite < same);
    }

    #[test]
    fn test_avgl_difference_symmetric() {
        let a = [0.5, 0.1, -0.2];
        let b = [0.1, 0.0, 0.3];
        assert_eq!(avgl_difference(&a, &b), avgl_difference(&b, &a));
    }

    #[test]
    fn test_positions_fit_grid() {
        // Guard the helper against drifting outside the coefficient range.
        let p = positions(1000);
        for v in p {
            assert!((v.unsigned_abs() as usize) < NUM_PIXELS_SQUARED);
        }
    }
}
