//! End-to-end database behavior: mode semantics, persistence round-trips,
//! and duplicate discovery over synthetic corpora.

use imgsim_core::{
    create, find_duplicates, load_file, Database, DbMode, DupeOptions, ImgData, QueryOptions,
    RgbPlanes, NUM_COEFS, NUM_PIXELS, NUM_PIXELS_SQUARED,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tempfile::TempDir;

/// A signature with deterministic pseudo-random positions; not grayscale.
fn random_sig(rng: &mut StdRng, id: u64) -> ImgData {
    let mut sig = [[0i32; NUM_COEFS]; 3];
    for channel in sig.iter_mut() {
        let mut seen = HashSet::new();
        let mut k = 0;
        while k < NUM_COEFS {
            let pos = rng.random_range(1..NUM_PIXELS_SQUARED as i32);
            if seen.insert(pos) {
                channel[k] = if rng.random_bool(0.5) { pos } else { -pos };
                k += 1;
            }
        }
        channel.sort_unstable();
    }
    ImgData {
        id,
        sig,
        avglf: [
            rng.random_range(0.1..0.9),
            rng.random_range(0.05..0.3),
            rng.random_range(-0.3..-0.05),
        ],
        width: 640,
        height: 480,
    }
}

/// A signature occupying a disjoint block of positions per image; all
/// block signatures share the same color averages.
fn block_sig(id: u64, block: usize) -> ImgData {
    let mut sig = [[0i32; NUM_COEFS]; 3];
    for (c, channel) in sig.iter_mut().enumerate() {
        let start = 1 + block * 150 + c * 50;
        for (k, slot) in channel.iter_mut().enumerate() {
            *slot = (start + k) as i32;
        }
    }
    ImgData {
        id,
        sig,
        avglf: [0.5, 0.1, 0.1],
        width: 320,
        height: 240,
    }
}

fn gradient_planes(shift: usize) -> RgbPlanes {
    let mut red = Vec::with_capacity(NUM_PIXELS_SQUARED);
    let mut green = Vec::with_capacity(NUM_PIXELS_SQUARED);
    let mut blue = Vec::with_capacity(NUM_PIXELS_SQUARED);
    for row in 0..NUM_PIXELS {
        for col in 0..NUM_PIXELS {
            red.push(((row + shift) % 256) as u8);
            green.push(((col * 2) % 256) as u8);
            blue.push(((row + col + shift) % 256) as u8);
        }
    }
    RgbPlanes::new(red, green, blue, 800, 600).unwrap()
}

#[test]
fn test_self_similarity_from_pixels() {
    let mut db = create().unwrap();
    db.add_image(17, &gradient_planes(0)).unwrap();
    let sig = db.signature(17).unwrap();
    let results = db.query(&sig, &QueryOptions::default()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, 17);
    assert!(results[0].score >= 99.0, "score={}", results[0].score);
    assert_eq!(results[0].width, 800);
    assert_eq!(results[0].height, 600);
}

#[test]
fn test_disjoint_corpus_ranks_query_first() {
    let mut db = create().unwrap();
    for n in 0..10u64 {
        db.add_signature(&block_sig(n, n as usize)).unwrap();
    }
    let results = db.query_by_id(4, &QueryOptions::with_limit(10)).unwrap();
    assert_eq!(results[0].id, 4);
    assert!(results[0].score > 95.0);
    for runner_up in &results[1..] {
        assert!(runner_up.score < 50.0);
    }
}

#[test]
fn test_duplicate_id_rejected_and_db_unchanged() {
    let mut db = create().unwrap();
    db.add_signature(&block_sig(1, 0)).unwrap();
    let err = db.add_signature(&block_sig(1, 5)).unwrap_err();
    assert_eq!(err.kind(), "duplicate_id");
    assert_eq!(db.image_count(), 1);
    // The stored signature is still the original one.
    assert_eq!(db.signature(1).unwrap().sig, block_sig(1, 0).sig);
}

#[test]
fn test_unknown_id_errors() {
    let mut db = create().unwrap();
    assert_eq!(db.remove_image(9).unwrap_err().kind(), "invalid_id");
    assert_eq!(db.signature(9).unwrap_err().kind(), "invalid_id");
    assert_eq!(
        db.query_by_id(9, &QueryOptions::default())
            .unwrap_err()
            .kind(),
        "invalid_id"
    );
}

#[test]
fn test_has_image_agrees_with_list_ids() {
    let mut db = create().unwrap();
    for n in 0..12u64 {
        db.add_signature(&block_sig(n, n as usize)).unwrap();
    }
    db.remove_image(5).unwrap();
    let ids: HashSet<u64> = db.image_ids().into_iter().collect();
    for n in 0..12u64 {
        assert_eq!(db.has_image(n), ids.contains(&n));
    }
    assert!(!ids.contains(&5));
}

#[test]
fn test_remove_undoes_add() {
    let mut db = create().unwrap();
    for n in 0..6u64 {
        db.add_signature(&block_sig(n, n as usize)).unwrap();
    }
    let before = db.query_by_id(2, &QueryOptions::with_limit(6)).unwrap();

    db.add_signature(&block_sig(99, 40)).unwrap();
    db.remove_image(99).unwrap();

    let after = db.query_by_id(2, &QueryOptions::with_limit(6)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_rehash_preserves_query_results() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut db = create().unwrap();
    for n in 0..40u64 {
        db.add_signature(&random_sig(&mut rng, n)).unwrap();
    }
    db.remove_image(7).unwrap();
    db.remove_image(31).unwrap();

    let before = db.query_by_id(3, &QueryOptions::with_limit(10)).unwrap();
    db.rehash().unwrap();
    let after = db.query_by_id(3, &QueryOptions::with_limit(10)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_save_load_parity_across_modes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("parity.db");

    let mut rng = StdRng::seed_from_u64(0xfeed);
    let mut db = create().unwrap();
    let mut sigs = Vec::new();
    for n in 0..100u64 {
        let sig = random_sig(&mut rng, n);
        db.add_signature(&sig).unwrap();
        sigs.push(sig);
    }
    db.save(&path).unwrap();

    let normal = load_file(&path, DbMode::Normal).unwrap();
    let readonly = load_file(&path, DbMode::ReadOnly).unwrap();
    let simple = load_file(&path, DbMode::Simple).unwrap();
    assert_eq!(normal.image_count(), 100);
    assert_eq!(readonly.image_count(), 100);
    assert_eq!(simple.image_count(), 100);

    let opts = QueryOptions::with_limit(12);
    for sig in sigs.iter().step_by(5) {
        let from_memory = db.query(sig, &opts).unwrap();
        let from_normal = normal.query(sig, &opts).unwrap();
        let from_readonly = readonly.query(sig, &opts).unwrap();
        let from_simple = simple.query(sig, &opts).unwrap();

        let ids: Vec<u64> = from_memory.iter().map(|r| r.id).collect();
        assert_eq!(ids, from_normal.iter().map(|r| r.id).collect::<Vec<_>>());
        assert_eq!(ids, from_readonly.iter().map(|r| r.id).collect::<Vec<_>>());
        assert_eq!(ids, from_simple.iter().map(|r| r.id).collect::<Vec<_>>());
        for (a, b) in from_memory.iter().zip(&from_readonly) {
            assert!((a.score - b.score).abs() < 1e-3);
        }
    }
}

#[test]
fn test_readonly_refuses_save_and_simple_refuses_signatures() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("refuse.db");
    let mut db = create().unwrap();
    db.add_signature(&block_sig(1, 0)).unwrap();
    db.save(&path).unwrap();

    let mut readonly = load_file(&path, DbMode::ReadOnly).unwrap();
    assert_eq!(
        readonly.save(&path).unwrap_err().kind(),
        "usage_error"
    );
    assert_eq!(readonly.rehash().unwrap_err().kind(), "usage_error");
    // The readonly flavor still serves signatures...
    assert!(readonly.signature(1).is_ok());
    // ...the simple flavor does not.
    let simple = load_file(&path, DbMode::Simple).unwrap();
    assert_eq!(simple.signature(1).unwrap_err().kind(), "usage_error");
}

#[test]
fn test_readonly_tombstone_excludes_from_queries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tombstone.db");
    let mut db = create().unwrap();
    for n in 0..8u64 {
        db.add_signature(&block_sig(n, n as usize)).unwrap();
    }
    db.save(&path).unwrap();

    let mut readonly = load_file(&path, DbMode::ReadOnly).unwrap();
    let sig = readonly.signature(3).unwrap();
    readonly.remove_image(3).unwrap();

    assert!(!readonly.has_image(3));
    assert_eq!(readonly.image_count(), 7);
    assert!(!readonly.image_ids().contains(&3));
    let results = readonly.query(&sig, &QueryOptions::with_limit(8)).unwrap();
    assert!(results.iter().all(|r| r.id != 3));
}

#[test]
fn test_set_resolution_persists_through_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("res.db");
    let mut db = create().unwrap();
    db.add_signature(&block_sig(1, 0)).unwrap();
    db.set_resolution(1, 1920, 1080).unwrap();
    assert_eq!(db.image_dimensions(1).unwrap(), (1920, 1080));
    db.save(&path).unwrap();

    let reloaded = load_file(&path, DbMode::Normal).unwrap();
    assert_eq!(reloaded.image_dimensions(1).unwrap(), (1920, 1080));
}

#[test]
fn test_grayscale_image_touches_only_luminance_buckets() {
    let mut db = create().unwrap();
    let mut sig = block_sig(1, 0);
    sig.avglf = [0.5, 0.0, 0.0];
    db.add_signature(&sig).unwrap();

    let stats = db.coeff_stats().unwrap();
    let channel_0_buckets = 2 * NUM_PIXELS_SQUARED as u32;
    let mut filled = 0;
    for (flat, size) in stats {
        if size > 0 {
            assert!(flat < channel_0_buckets, "bucket {flat} outside channel 0");
            filled += size;
        }
    }
    assert_eq!(filled, NUM_COEFS as u64);
}

#[test]
fn test_failed_save_preserves_existing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("keep.db");
    let mut db = create().unwrap();
    db.add_signature(&block_sig(1, 0)).unwrap();
    db.save(&path).unwrap();
    let original = std::fs::read(&path).unwrap();

    // Saving into a directory that does not exist fails before the
    // rename, leaving the original untouched.
    let bad = dir.path().join("missing").join("keep.db");
    assert!(db.save(&bad).is_err());
    assert_eq!(std::fs::read(&path).unwrap(), original);
}

#[test]
fn test_alter_mode_add_remove_compaction() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("alter.db");
    let mut rng = StdRng::seed_from_u64(0xa17e);

    let mut sigs = Vec::new();
    {
        let mut db = load_file(&path, DbMode::Alter).unwrap();
        for n in 0..50u64 {
            let sig = random_sig(&mut rng, n);
            db.add_signature(&sig).unwrap();
            sigs.push(sig);
        }
        for id in [3u64, 17, 30, 49] {
            db.remove_image(id).unwrap();
        }
        db.save(&path).unwrap();
        assert_eq!(db.image_count(), 46);
    }

    {
        let mut db = load_file(&path, DbMode::Alter).unwrap();
        assert_eq!(db.image_count(), 46);
        for n in 50..100u64 {
            let sig = random_sig(&mut rng, n);
            db.add_signature(&sig).unwrap();
            sigs.push(sig);
        }
        db.save(&path).unwrap();
        assert_eq!(db.image_count(), 96);
    }

    // Every alive id is queryable from a full load; deleted ids are gone.
    let db = load_file(&path, DbMode::Normal).unwrap();
    assert_eq!(db.image_count(), 96);
    let removed: HashSet<u64> = [3u64, 17, 30, 49].into_iter().collect();
    for sig in &sigs {
        if removed.contains(&sig.id) {
            assert!(!db.has_image(sig.id));
        } else {
            assert!(db.has_image(sig.id));
            let results = db.query(sig, &QueryOptions::with_limit(1)).unwrap();
            assert_eq!(results[0].id, sig.id);
        }
    }
}

#[test]
fn test_alter_mode_refuses_queries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("noquery.db");
    let mut db = load_file(&path, DbMode::Alter).unwrap();
    let sig = block_sig(1, 0);
    db.add_signature(&sig).unwrap();
    assert_eq!(
        db.query(&sig, &QueryOptions::default()).unwrap_err().kind(),
        "usage_error"
    );
}

#[test]
fn test_alter_header_grows_past_id_headroom() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("grow.db");
    let mut rng = StdRng::seed_from_u64(0x9703);

    // The empty header leaves room for 1024 ids; overflow it.
    let total = 1100u64;
    {
        let mut db = load_file(&path, DbMode::Alter).unwrap();
        for n in 0..total {
            db.add_signature(&random_sig(&mut rng, n)).unwrap();
        }
        db.save(&path).unwrap();
    }

    let db = load_file(&path, DbMode::Normal).unwrap();
    assert_eq!(db.image_count(), total as usize);
    for n in (0..total).step_by(97) {
        assert!(db.has_image(n));
        let results = db.query_by_id(n, &QueryOptions::with_limit(1)).unwrap();
        assert_eq!(results[0].id, n);
    }
}

#[test]
fn test_imgdata_mode_reads_but_never_writes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("imgdata.db");
    let mut db = create().unwrap();
    db.add_signature(&block_sig(1, 0)).unwrap();
    db.save(&path).unwrap();

    let mut imgdata = load_file(&path, DbMode::ImgData).unwrap();
    assert_eq!(imgdata.signature(1).unwrap().id, 1);
    assert_eq!(imgdata.image_dimensions(1).unwrap(), (320, 240));
    assert_eq!(
        imgdata.add_signature(&block_sig(2, 1)).unwrap_err().kind(),
        "usage_error"
    );
    assert_eq!(imgdata.remove_image(1).unwrap_err().kind(), "usage_error");
}

#[test]
fn test_diff_symmetry_via_stored_images() {
    let mut rng = StdRng::seed_from_u64(0xd1ff);
    let mut db = create().unwrap();
    for n in 0..5u64 {
        db.add_signature(&random_sig(&mut rng, n)).unwrap();
    }
    for a in 0..5u64 {
        for b in 0..5u64 {
            let ab = imgsim_core::difference(db.as_ref(), a, b, false).unwrap();
            let ba = imgsim_core::difference(db.as_ref(), b, a, false).unwrap();
            assert!((ab - ba).abs() < 1e-3, "diff({a},{b}) asymmetric");
        }
    }
    let self_diff = imgsim_core::difference(db.as_ref(), 2, 2, false).unwrap();
    assert!(self_diff.abs() < 1e-3);
}

#[test]
fn test_duplicate_clustering_finds_one_cluster() {
    let mut db = create().unwrap();

    // Ten near-copies: 36 shared coefficients per channel plus 4 unique.
    let base = block_sig(0, 0);
    for copy in 0..10u64 {
        let mut sig = base.clone();
        sig.id = copy;
        for (c, channel) in sig.sig.iter_mut().enumerate() {
            for slot in 0..4 {
                channel[NUM_COEFS - 1 - slot] =
                    (5000 + c * 1000 + copy as usize * 20 + slot) as i32;
            }
            channel.sort_unstable();
        }
        db.add_signature(&sig).unwrap();
    }

    // Twenty unrelated images, mutually disjoint, same color averages.
    for n in 0..20u64 {
        db.add_signature(&block_sig(100 + n, 60 + n as usize)).unwrap();
    }

    let clusters = find_duplicates(db.as_ref(), &DupeOptions::default()).unwrap();
    assert_eq!(clusters.len(), 1, "expected exactly one non-trivial cluster");
    let cluster = &clusters[0];
    assert_eq!(cluster.members.len(), 9);
    let mut all: Vec<u64> = cluster.members.iter().map(|m| m.0).collect();
    all.push(cluster.representative);
    all.sort_unstable();
    assert_eq!(all, (0..10).collect::<Vec<_>>());
    // Members are near-copies of the representative.
    for (_, score) in &cluster.members {
        assert!(*score > 80.0);
    }
}

#[test]
fn test_mask_and_uniqueset_tags() {
    let mut db = create().unwrap();
    for n in 0..4u64 {
        db.add_signature(&block_sig(n, n as usize)).unwrap();
    }
    db.set_tags(0, 1, 0b01).unwrap();
    db.set_tags(1, 1, 0b10).unwrap();
    db.set_tags(2, 2, 0b10).unwrap();
    db.set_tags(3, 2, 0b10).unwrap();

    let sig = db.signature(0).unwrap();
    let masked = db
        .query(
            &sig,
            &QueryOptions {
                numres: 8,
                mask: Some(imgsim_core::MaskFilter { and: 0b11, xor: 0b10 }),
                ..QueryOptions::default()
            },
        )
        .unwrap();
    let ids: HashSet<u64> = masked.iter().map(|r| r.id).collect();
    assert_eq!(ids, HashSet::from([1, 2, 3]));

    let unique = db
        .query(
            &sig,
            &QueryOptions {
                numres: 8,
                uniqueset: true,
                ..QueryOptions::default()
            },
        )
        .unwrap();
    let set_one = unique.iter().filter(|r| r.id <= 1).count();
    let set_two = unique.iter().filter(|r| r.id >= 2).count();
    assert_eq!(set_one, 1);
    assert_eq!(set_two, 1);
}

#[test]
fn test_load_missing_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let db = load_file(&dir.path().join("absent.db"), DbMode::Normal).unwrap();
    assert_eq!(db.image_count(), 0);
}
