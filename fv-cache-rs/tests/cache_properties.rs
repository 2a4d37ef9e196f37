//! Property tests for cache insertion, deduplication and shrinking.

use fv_cache_rs::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn config(n: usize) -> CacheConfig {
    CacheConfig::default()
        .with_max_num_fv(n)
        .with_max_fv_dim(6)
        .with_max_num_blocks(3)
}

/// Add a random vector drawn from a small value set so duplicates are common.
fn add_random(cache: &mut FeatureVectorCache, rng: &mut ChaCha8Rng) -> Result<u64> {
    let key = [rng.random_range(-3..4), rng.random_range(0..3), 0, 0];
    let num_blocks = rng.random_range(0..3usize);
    let labels: Vec<i32> = (0..num_blocks).map(|b| b as i32).collect();
    let feat: Vec<f32> = (0..num_blocks * 2)
        .map(|_| f32::from(rng.random_range(0u8..2)))
        .collect();
    let fv = NewFeatureVector::new(key, &labels, &feat).with_belief(rng.random_bool(0.3));
    cache.add(&fv)
}

fn accounted(cache: &FeatureVectorCache) -> u64 {
    cache.records().iter().map(|r| r.byte_size()).sum()
}

#[test]
fn test_byte_size_matches_records_under_random_ops() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut cache = FeatureVectorCache::new(config(64)).unwrap();

    for round in 0..200 {
        match rng.random_range(0..10) {
            0 => {
                cache.build_index();
            }
            1 => {
                let keep: Vec<usize> = (0..cache.len()).filter(|_| rng.random_bool(0.5)).collect();
                cache.shrink(&keep).unwrap();
            }
            _ => match add_random(&mut cache, &mut rng) {
                Ok(bytes) => assert_eq!(bytes, cache.byte_size()),
                Err(e) => assert!(e.is_capacity(), "round {round}: {e}"),
            },
        }
        assert_eq!(cache.byte_size(), accounted(&cache), "round {round}");
    }

    cache.free().unwrap();
    assert_eq!(cache.byte_size(), 0);
}

#[test]
fn test_dedup_is_idempotent() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let mut cache = FeatureVectorCache::new(config(128)).unwrap();
    for _ in 0..100 {
        add_random(&mut cache, &mut rng).unwrap();
    }

    let first = cache.build_index();
    let keys: Vec<_> = cache.records().iter().map(|r| r.key).collect();
    let bytes = cache.byte_size();

    let second = cache.build_index();
    assert_eq!(cache.records().iter().map(|r| r.key).collect::<Vec<_>>(), keys);
    assert_eq!(cache.byte_size(), bytes);
    assert_eq!(first.as_slice().len(), second.as_slice().len());
    assert!(cache.records().iter().all(|r| r.is_unique));
}

#[test]
fn test_no_duplicates_survive() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let mut cache = FeatureVectorCache::new(config(128)).unwrap();
    for _ in 0..120 {
        add_random(&mut cache, &mut rng).unwrap();
    }
    cache.build_index();

    let records = cache.records();
    for pair in records.windows(2) {
        let same = pair[0].key == pair[1].key
            && pair[0].feat_dim == pair[1].feat_dim
            && cache.features(&pair[0]) == cache.features(&pair[1]);
        assert!(!same, "duplicate survived: {}", pair[1]);
    }
}

#[test]
fn test_examples_partition_the_cache() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut cache = FeatureVectorCache::new(config(128)).unwrap();
    for _ in 0..80 {
        add_random(&mut cache, &mut rng).unwrap();
    }
    let index = cache.build_index();
    index.check_fresh(&cache).unwrap();

    let mut next = 0;
    let mut prev_key = None;
    for ex in &index {
        assert_eq!(ex.begin, next);
        assert!(!ex.is_empty());
        let members = index.members(&cache, ex).unwrap();
        let key = members[0].example_key();
        assert!(members.iter().all(|m| m.example_key() == key));
        assert_ne!(prev_key, Some(key));
        if let Some(b) = ex.belief {
            assert!(ex.range().contains(&b));
            assert!(cache.records()[b].is_belief);
            assert!(members[..b - ex.begin].iter().all(|m| !m.is_belief));
        }
        prev_key = Some(key);
        next = ex.end;
    }
    assert_eq!(next, cache.len());
    assert_eq!(index.num_members(), cache.len());
}

#[test]
fn test_capacity_two_rejects_third() {
    let mut cache = FeatureVectorCache::new(config(2)).unwrap();
    for x in 0..2 {
        cache
            .add(&NewFeatureVector::new([1, x, 0, 0], &[0], &[1.0, 2.0]))
            .unwrap();
    }
    let err = cache
        .add(&NewFeatureVector::new([1, 2, 0, 0], &[0], &[1.0, 2.0]))
        .unwrap_err();
    assert!(matches!(err, CacheError::CapacityExceeded { .. }));
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.byte_size(), 16);
}

#[test]
fn test_shrink_then_rebuild() {
    let mut cache = FeatureVectorCache::new(config(8)).unwrap();
    for x in 0..4 {
        let feat = [x as f32, 1.0];
        cache
            .add(&NewFeatureVector::new([x % 2, x, 0, 0], &[0], &feat))
            .unwrap();
    }
    cache.shrink(&[1, 3]).unwrap();
    let xs: Vec<i32> = cache.records().iter().map(|r| r.key[1]).collect();
    assert_eq!(xs, vec![1, 3]);

    let index = cache.build_index();
    assert_eq!(index.len(), 1);
    assert_eq!(cache.byte_size(), 16);
}
