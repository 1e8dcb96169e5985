//! Duplicate-cluster discovery built on similarity queries.
//!
//! Every image queries its nearest neighbors; an adaptive threshold
//! separates the cluster of genuine near-copies from the noise floor, and
//! a union-find over image ids merges the per-image links into clusters.

use crate::db::{similarity, Database};
use crate::errors::Result;
use crate::query::{QueryOptions, SimValue};
use crate::score::Score;
use crate::ImageId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Options for duplicate discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DupeOptions {
    /// Sample standard deviation a result list must exceed before a
    /// threshold is derived; images whose neighbors never spread this far
    /// are skipped.
    pub min_stddev: Score,
    /// Fraction of the standard deviation added to the mean to form the
    /// threshold.
    pub stddev_frac: Score,
    /// Nearest neighbors fetched per image.
    pub neighbors: usize,
}

impl Default for DupeOptions {
    fn default() -> Self {
        Self {
            min_stddev: 10.0,
            stddev_frac: 0.5,
            neighbors: 16,
        }
    }
}

/// One cluster of near-duplicate images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DupeCluster {
    /// The member with the highest total intra-cluster similarity.
    pub representative: ImageId,
    /// Remaining members with their similarity to the representative,
    /// most similar first.
    pub members: Vec<(ImageId, Score)>,
}

/// Minimum score to consider a result a relevant match. Walking the
/// list from least to most similar over the non-negative scores, the
/// running average and standard deviation are tracked; once the sample
/// deviation exceeds `min_stddev`, the threshold is
/// `avg + stddev_frac * stddev`. Returns `None` when the scores never
/// spread that far.
pub fn min_sim(results: &[SimValue], min_stddev: Score, stddev_frac: Score) -> Option<Score> {
    if results.len() < 2 {
        return None;
    }
    let min_sq = (min_stddev as f64) * (min_stddev as f64);
    let mut count = 0u32;
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    for value in results.iter().rev() {
        if value.score < 0.0 {
            continue;
        }
        count += 1;
        let score = value.score as f64;
        sum += score;
        sum_sq += score * score;
        if count < 2 {
            continue;
        }
        let avg = sum / count as f64;
        let sq_dev = sum_sq - sum * avg;
        if sq_dev > min_sq * count as f64 {
            let stddev = (sq_dev / count as f64).sqrt();
            return Some((avg + stddev_frac as f64 * stddev) as Score);
        }
    }
    None
}

/// Trim a result list at the adaptive threshold; when no deviation point
/// exists, fall back to a flat 90 cutoff.
pub fn stddev_limit(results: &mut Vec<SimValue>, min_stddev: Score) {
    let cutoff = min_sim(results, min_stddev, 0.5).unwrap_or(90.0);
    if let Some(at) = results.iter().position(|value| value.score < cutoff) {
        results.truncate(at);
    }
}

/// Union-find over image ids with path compression.
#[derive(Default)]
struct UnionFind {
    parent: HashMap<ImageId, ImageId>,
}

impl UnionFind {
    fn find(&mut self, id: ImageId) -> ImageId {
        let mut root = id;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        // Compress the walked path.
        let mut at = id;
        while let Some(&parent) = self.parent.get(&at) {
            if parent == root {
                break;
            }
            self.parent.insert(at, root);
            at = parent;
        }
        root
    }

    fn link(&mut self, one: ImageId, two: ImageId) {
        if one == two {
            return;
        }
        self.parent.entry(one).or_insert(one);
        self.parent.entry(two).or_insert(two);
        let root_one = self.find(one);
        let root_two = self.find(two);
        if root_one != root_two {
            self.parent.insert(root_two, root_one);
        }
    }

    fn groups(mut self) -> Vec<Vec<ImageId>> {
        let ids: Vec<ImageId> = self.parent.keys().copied().collect();
        let mut by_root: HashMap<ImageId, Vec<ImageId>> = HashMap::new();
        for id in ids {
            let root = self.find(id);
            by_root.entry(root).or_default().push(id);
        }
        by_root.into_values().collect()
    }
}

/// Discover clusters of near-duplicate images. The database must provide
/// signature access (normal or readonly mode) since cluster ordering uses
/// pairwise similarity.
pub fn find_duplicates(db: &dyn Database, opts: &DupeOptions) -> Result<Vec<DupeCluster>> {
    let ids = db.image_ids();
    tracing::debug!(
        images = ids.len(),
        min_stddev = opts.min_stddev,
        "scanning for duplicates"
    );

    let mut links = UnionFind::default();
    let query_opts = QueryOptions::with_limit(opts.neighbors);
    for &id in &ids {
        let results = db.query_by_id(id, &query_opts)?;
        let Some(threshold) = min_sim(&results, opts.min_stddev, opts.stddev_frac) else {
            continue;
        };
        for value in results.iter().take_while(|v| v.score >= threshold) {
            links.link(id, value.id);
        }
    }

    let mut clusters = Vec::new();
    for group in links.groups() {
        if group.len() < 2 {
            continue;
        }

        // Total intra-cluster similarity elects the representative.
        let mut totals: HashMap<ImageId, Score> = group.iter().map(|&id| (id, 0.0)).collect();
        for (n, &one) in group.iter().enumerate() {
            for &two in &group[n + 1..] {
                let score = similarity(db, one, two, false)?;
                *totals.get_mut(&one).unwrap() += score;
                *totals.get_mut(&two).unwrap() += score;
            }
        }
        let representative = group
            .iter()
            .copied()
            .max_by(|a, b| totals[a].total_cmp(&totals[b]).then(b.cmp(a)))
            .expect("non-empty group");

        let mut members = Vec::with_capacity(group.len() - 1);
        for &id in group.iter().filter(|&&id| id != representative) {
            members.push((id, similarity(db, id, representative, false)?));
        }
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        clusters.push(DupeCluster {
            representative,
            members,
        });
    }

    // Strongest clusters first, keyed by the representative's similarity
    // to its closest member.
    clusters.sort_by(|a, b| {
        let ka = a.members.first().map(|m| m.1).unwrap_or(0.0);
        let kb = b.members.first().map(|m| m.1).unwrap_or(0.0);
        kb.total_cmp(&ka)
    });
    tracing::debug!(clusters = clusters.len(), "duplicate scan complete");
    Ok(clusters)
}
