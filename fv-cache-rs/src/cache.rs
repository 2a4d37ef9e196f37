//! The feature-vector cache.
//!
//! Records are appended in arbitrary order by the detector, then sorted,
//! deduplicated and partitioned into examples by
//! [`FeatureVectorCache::build_index`]. Feature and block-label payloads live
//! in two [`ChunkPool`]s sized once at construction.
//!
//! # Example
//!
//! ```
//! use fv_cache_rs::cache::{FeatureVectorCache, NewFeatureVector};
//! use fv_cache_rs::CacheConfig;
//!
//! let mut cache = FeatureVectorCache::new(CacheConfig::default().with_max_num_fv(16)).unwrap();
//! let fv = NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0, 2.0]).with_belief(true);
//! assert_eq!(cache.add(&fv).unwrap(), 8);
//! cache.add(&fv).unwrap();
//!
//! let index = cache.build_index();
//! assert_eq!(cache.len(), 1);
//! assert_eq!(index.len(), 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::{CacheError, PoolKind, Result};
use crate::example::{Example, ExampleIndex};
use crate::fv::{cmp_total, l2_norm, FeatureVector, FvKey, KEY_DATA_ID, KEY_SCALE, KEY_X, KEY_Y};
use crate::model::Model;
use crate::pool::ChunkPool;

/// Input of [`FeatureVectorCache::add`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewFeatureVector<'a> {
    /// (data id, x, y, scale).
    pub key: FvKey,
    /// Blocks touched, in the order their runs appear in `feat`.
    pub block_labels: &'a [i32],
    /// Concatenated block runs.
    pub feat: &'a [f32],
    /// Candidate is consistent with the ground truth.
    pub is_belief: bool,
    /// Candidate came from hard-negative mining.
    pub is_mined: bool,
    /// Structured loss of the candidate.
    pub loss: f64,
}

impl<'a> NewFeatureVector<'a> {
    /// A non-belief, non-mined candidate with zero loss.
    #[must_use]
    pub const fn new(key: FvKey, block_labels: &'a [i32], feat: &'a [f32]) -> Self {
        Self {
            key,
            block_labels,
            feat,
            is_belief: false,
            is_mined: false,
            loss: 0.0,
        }
    }

    /// Mark as belief.
    #[must_use]
    pub const fn with_belief(mut self, is_belief: bool) -> Self {
        self.is_belief = is_belief;
        self
    }

    /// Mark as mined.
    #[must_use]
    pub const fn with_mined(mut self, is_mined: bool) -> Self {
        self.is_mined = is_mined;
        self
    }

    /// Set the structured loss.
    #[must_use]
    pub const fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss;
        self
    }
}

/// One row of [`FeatureVectorCache::info`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FvInfo {
    /// Score under the current model.
    pub score: f64,
    /// Survived deduplication.
    pub is_unique: bool,
    /// Example id.
    pub data_id: i32,
    /// Horizontal location.
    pub x: i32,
    /// Vertical location.
    pub y: i32,
    /// Pyramid level.
    pub scale: i32,
    /// Bytes accounted for the record.
    pub byte_size: u64,
    /// Margin against the example's belief (or the hinge margin).
    pub margin: f64,
    /// Belief flag.
    pub is_belief: bool,
    /// Zero-vector flag.
    pub is_zero: bool,
    /// Mined flag.
    pub is_mined: bool,
}

/// Source of [`FeatureVectorCache::id`]; 0 is never issued.
static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

fn next_cache_id() -> u64 {
    NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Pooled storage for every cached feature vector.
#[derive(Debug)]
pub struct FeatureVectorCache {
    id: u64,
    config: CacheConfig,
    feat_pool: ChunkPool<f32>,
    label_pool: ChunkPool<i32>,
    records: Vec<FeatureVector>,
    byte_size: u64,
    generation: u64,
}

impl Default for FeatureVectorCache {
    fn default() -> Self {
        Self::empty()
    }
}

fn feat_slice<'p>(pool: &'p ChunkPool<f32>, fv: &FeatureVector) -> &'p [f32] {
    fv.feat.map_or(&[] as &[f32], |id| &pool.chunk(id)[..fv.feat_dim])
}

fn label_slice<'p>(pool: &'p ChunkPool<i32>, fv: &FeatureVector) -> &'p [i32] {
    fv.block_labels.map_or(&[] as &[i32], |id| &pool.chunk(id)[..fv.num_blocks])
}

/// Return a record's chunks to their pools and report the bytes freed.
fn release(feat_pool: &mut ChunkPool<f32>, label_pool: &mut ChunkPool<i32>, fv: &FeatureVector) -> u64 {
    if let Some((feat, labels)) = fv.chunks() {
        feat_pool.put(feat);
        label_pool.put(labels);
    }
    fv.byte_size()
}

impl FeatureVectorCache {
    /// Allocate both pools for `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or a pool cannot be
    /// allocated.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let feat_pool = ChunkPool::init(config.max_num_fv, config.max_fv_dim)?;
        let label_pool = ChunkPool::init(config.max_num_fv, config.max_num_blocks)?;
        let mut records = Vec::new();
        records
            .try_reserve_exact(config.max_num_fv)
            .map_err(|_| CacheError::Allocation {
                chunks: config.max_num_fv,
                chunk_size: std::mem::size_of::<FeatureVector>(),
            })?;

        info!(
            "Allocated cache: {} vectors, {} floats x {} blocks per vector ({} MiB of features)",
            config.max_num_fv,
            config.max_fv_dim,
            config.max_num_blocks,
            config.feature_pool_bytes() / (1 << 20)
        );

        Ok(Self {
            id: next_cache_id(),
            config,
            feat_pool,
            label_pool,
            records,
            byte_size: 0,
            generation: 0,
        })
    }

    /// A cache without pools; only zero vectors can be added to it.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: next_cache_id(),
            config: CacheConfig::default().with_max_num_fv(0),
            feat_pool: ChunkPool::default(),
            label_pool: ChunkPool::default(),
            records: Vec::new(),
            byte_size: 0,
            generation: 0,
        }
    }

    /// Append a feature vector.
    ///
    /// Returns the cache byte size after insertion.
    ///
    /// # Errors
    ///
    /// - [`CacheError::DimensionMismatch`] if the input does not fit a chunk,
    ///   or a zero vector carries features.
    /// - [`CacheError::CapacityExceeded`] if either pool is exhausted. The
    ///   cache is left unchanged.
    pub fn add(&mut self, new: &NewFeatureVector<'_>) -> Result<u64> {
        let record = FeatureVector {
            key: new.key,
            num_blocks: new.block_labels.len(),
            feat_dim: new.feat.len(),
            is_unique: true,
            norm: l2_norm(new.feat),
            is_zero: new.block_labels.is_empty(),
            is_belief: new.is_belief,
            is_mined: new.is_mined,
            loss: new.loss,
            ..FeatureVector::default()
        };
        self.push_record(record, new.block_labels, new.feat)?;
        Ok(self.byte_size)
    }

    /// Store `record` with its payload, acquiring chunks unless it is a zero
    /// vector.
    pub(crate) fn push_record(
        &mut self,
        mut record: FeatureVector,
        block_labels: &[i32],
        feat: &[f32],
    ) -> Result<()> {
        if block_labels.is_empty() {
            if !feat.is_empty() {
                return Err(CacheError::DimensionMismatch {
                    expected: 0,
                    actual: feat.len(),
                });
            }
            record.feat = None;
            record.block_labels = None;
            record.is_zero = true;
            record.feat_dim = 0;
            record.num_blocks = 0;
            self.records.push(record);
            self.generation += 1;
            return Ok(());
        }

        if feat.len() > self.feat_pool.chunk_size() {
            return Err(CacheError::DimensionMismatch {
                expected: self.feat_pool.chunk_size(),
                actual: feat.len(),
            });
        }
        if block_labels.len() > self.label_pool.chunk_size() {
            return Err(CacheError::DimensionMismatch {
                expected: self.label_pool.chunk_size(),
                actual: block_labels.len(),
            });
        }

        let feat_id = self.feat_pool.get().ok_or(CacheError::CapacityExceeded {
            pool: PoolKind::Features,
        })?;
        let Some(label_id) = self.label_pool.get() else {
            self.feat_pool.put(feat_id);
            return Err(CacheError::CapacityExceeded {
                pool: PoolKind::BlockLabels,
            });
        };

        self.feat_pool.chunk_mut(feat_id)[..feat.len()].copy_from_slice(feat);
        self.label_pool.chunk_mut(label_id)[..block_labels.len()].copy_from_slice(block_labels);

        record.feat = Some(feat_id);
        record.block_labels = Some(label_id);
        record.is_zero = false;
        record.feat_dim = feat.len();
        record.num_blocks = block_labels.len();
        self.byte_size += record.byte_size();
        self.records.push(record);
        self.generation += 1;
        Ok(())
    }

    /// Features of a record of this cache.
    #[must_use]
    pub fn features(&self, fv: &FeatureVector) -> &[f32] {
        feat_slice(&self.feat_pool, fv)
    }

    /// Block labels of a record of this cache.
    #[must_use]
    pub fn block_labels(&self, fv: &FeatureVector) -> &[i32] {
        label_slice(&self.label_pool, fv)
    }

    /// All records in cache order.
    #[must_use]
    pub fn records(&self) -> &[FeatureVector] {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut [FeatureVector] {
        &mut self.records
    }

    /// Record by position.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<&FeatureVector> {
        self.records.get(i)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes of feature data held by retained non-zero records.
    #[must_use]
    pub const fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Process-unique identity of this cache. Every constructed or loaded
    /// cache gets a fresh one.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Mutation counter; an [`ExampleIndex`] is valid only for the cache and
    /// generation it was built at.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Capacity the cache was built with.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Widest record, as `(feat_dim, num_blocks)`.
    #[must_use]
    pub fn max_record_dims(&self) -> (usize, usize) {
        self.records.iter().fold((0, 0), |(f, b), r| {
            (f.max(r.feat_dim), b.max(r.num_blocks))
        })
    }

    /// Sort, deduplicate and partition the cache into examples.
    ///
    /// Records end up in the total order of [`cmp_total`]; of each run of
    /// identical records only the first is kept.
    pub fn build_index(&mut self) -> ExampleIndex {
        let Self {
            feat_pool,
            label_pool,
            records,
            byte_size,
            ..
        } = self;

        info!("Sorting {} feature vectors", records.len());
        records.sort_by(|a, b| cmp_total(a, feat_slice(feat_pool, a), b, feat_slice(feat_pool, b)));

        info!("Finding unique feature vectors");
        for i in 0..records.len() {
            let unique = i == 0 || {
                let (prev, cur) = (&records[i - 1], &records[i]);
                cmp_total(prev, feat_slice(feat_pool, prev), cur, feat_slice(feat_pool, cur)).is_ne()
            };
            records[i].is_unique = unique;
        }

        let before = records.len();
        records.retain(|r| {
            if r.is_unique {
                true
            } else {
                *byte_size -= release(feat_pool, label_pool, r);
                false
            }
        });
        info!(
            "Removed {} duplicates, {} unique feature vectors remain",
            before - records.len(),
            records.len()
        );

        info!("Indexing examples");
        let mut examples = Vec::new();
        let mut begin = 0;
        while begin < records.len() {
            let key = records[begin].example_key();
            let len = records[begin..]
                .iter()
                .take_while(|r| r.example_key() == key)
                .count();
            examples.push(Example::from_members(begin, &records[begin..begin + len]));
            begin += len;
        }
        info!("{} examples", examples.len());

        self.generation += 1;
        ExampleIndex::new(examples, self.id, self.generation)
    }

    /// Keep only the records at the given strictly increasing positions.
    ///
    /// Positions past the end are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnsortedIndices`] if `keep` is not strictly
    /// increasing; the cache is untouched in that case.
    pub fn shrink(&mut self, keep: &[usize]) -> Result<()> {
        if let Some(position) = keep.windows(2).position(|w| w[0] >= w[1]) {
            return Err(CacheError::UnsortedIndices {
                position: position + 1,
            });
        }

        let Self {
            feat_pool,
            label_pool,
            records,
            byte_size,
            ..
        } = self;

        let before = records.len();
        let mut wanted = keep.iter().copied().peekable();
        let mut pos = 0;
        records.retain(|r| {
            let i = pos;
            pos += 1;
            if wanted.next_if_eq(&i).is_some() {
                true
            } else {
                *byte_size -= release(feat_pool, label_pool, r);
                false
            }
        });
        info!("Shrunk cache from {} to {} feature vectors", before, records.len());

        self.generation += 1;
        Ok(())
    }

    /// Release every record and both pools.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvariantBroken`] if the byte accounting does
    /// not return to zero.
    pub fn free(&mut self) -> Result<()> {
        let Self {
            feat_pool,
            label_pool,
            records,
            byte_size,
            ..
        } = self;

        for r in records.drain(..) {
            *byte_size -= release(feat_pool, label_pool, &r);
        }
        feat_pool.free();
        label_pool.free();
        self.generation += 1;
        info!("Freed feature vector cache");

        if self.byte_size != 0 {
            let leaked = self.byte_size;
            self.byte_size = 0;
            return Err(CacheError::InvariantBroken(format!(
                "{leaked} bytes still accounted after free"
            )));
        }
        Ok(())
    }

    /// Recompute every record's score and margin under `model`.
    ///
    /// With a belief, a member's margin is `(belief_score + belief_loss) -
    /// (score + loss)`; without one it is the hinge margin `y * score - 1`.
    ///
    /// # Errors
    ///
    /// Returns error if `index` is stale or a record does not fit the model's
    /// block layout.
    pub fn info(&mut self, index: &ExampleIndex, model: &Model) -> Result<Vec<FvInfo>> {
        index.check_fresh(self)?;
        for r in &self.records {
            model.check_layout(r.feat_dim, self.block_labels(r))?;
        }

        let Self {
            feat_pool,
            label_pool,
            records,
            ..
        } = self;

        for r in records.iter_mut() {
            r.score = model.score(feat_slice(feat_pool, r), label_slice(label_pool, r));
        }
        for ex in index {
            let members = &mut records[ex.range()];
            match ex.belief {
                Some(b) => {
                    let belief = &members[b - ex.begin];
                    let target = belief.score + belief.loss;
                    for r in members.iter_mut() {
                        r.margin = target - (r.score + r.loss);
                    }
                }
                None => {
                    for r in members.iter_mut() {
                        r.margin = f64::from(r.binary_label()) * r.score - 1.0;
                    }
                }
            }
        }
        debug!("Scored {} feature vectors", records.len());

        Ok(records
            .iter()
            .map(|r| FvInfo {
                score: r.score,
                is_unique: r.is_unique,
                data_id: r.key[KEY_DATA_ID],
                x: r.key[KEY_X],
                y: r.key[KEY_Y],
                scale: r.key[KEY_SCALE],
                byte_size: r.byte_size(),
                margin: r.margin,
                is_belief: r.is_belief,
                is_zero: r.is_zero,
                is_mined: r.is_mined,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParams;

    fn small_cache(n: usize) -> FeatureVectorCache {
        let config = CacheConfig::default()
            .with_max_num_fv(n)
            .with_max_fv_dim(4)
            .with_max_num_blocks(2);
        FeatureVectorCache::new(config).unwrap()
    }

    #[test]
    fn test_add_counts_bytes() {
        let mut cache = small_cache(4);
        let a = NewFeatureVector::new([1, 0, 0, 0], &[0], &[3.0, 4.0]);
        assert_eq!(cache.add(&a).unwrap(), 8);
        assert!((cache.records()[0].norm - 5.0).abs() < 1e-12);
        assert_eq!(cache.features(&cache.records()[0]), &[3.0, 4.0]);
        assert_eq!(cache.block_labels(&cache.records()[0]), &[0]);
    }

    #[test]
    fn test_zero_vector_takes_no_chunk() {
        let mut cache = small_cache(1);
        let zero = NewFeatureVector::new([1, 0, 0, 0], &[], &[]);
        assert_eq!(cache.add(&zero).unwrap(), 0);
        assert_eq!(cache.add(&zero).unwrap(), 0);
        assert!(cache.records()[0].is_zero);
        assert_eq!(cache.features(&cache.records()[0]), &[] as &[f32]);

        let bad = NewFeatureVector::new([1, 0, 0, 0], &[], &[1.0]);
        assert!(matches!(cache.add(&bad), Err(CacheError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_capacity_exceeded_leaves_cache_unchanged() {
        let mut cache = small_cache(2);
        let fv = NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0]);
        cache.add(&fv).unwrap();
        cache.add(&fv).unwrap();
        let err = cache.add(&fv).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.byte_size(), 8);
    }

    #[test]
    fn test_oversized_input_rejected() {
        let mut cache = small_cache(2);
        let wide = NewFeatureVector::new([1, 0, 0, 0], &[0], &[0.0; 5]);
        assert!(matches!(
            cache.add(&wide),
            Err(CacheError::DimensionMismatch { expected: 4, actual: 5 })
        ));
        let many = NewFeatureVector::new([1, 0, 0, 0], &[0, 1, 2], &[0.0]);
        assert!(cache.add(&many).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_build_index_dedups_and_partitions() {
        let mut cache = small_cache(8);
        cache.add(&NewFeatureVector::new([2, 0, 0, 0], &[0], &[1.0])).unwrap();
        cache
            .add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0]).with_belief(true))
            .unwrap();
        cache.add(&NewFeatureVector::new([2, 0, 0, 0], &[0], &[1.0])).unwrap();
        cache.add(&NewFeatureVector::new([1, 1, 0, 0], &[0], &[2.0])).unwrap();

        let index = cache.build_index();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.byte_size(), 12);
        assert_eq!(index.len(), 2);
        assert!(index.check_fresh(&cache).is_ok());

        let first = index.get(0).unwrap();
        assert_eq!(first.range(), 0..2);
        assert_eq!(first.belief, Some(0));
        assert!((first.max_nonbelief_norm - 2.0).abs() < 1e-12);
        assert!(cache.records().iter().all(|r| r.is_unique));
    }

    #[test]
    fn test_mutation_invalidates_index() {
        let mut cache = small_cache(4);
        cache.add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0])).unwrap();
        let index = cache.build_index();
        cache.add(&NewFeatureVector::new([1, 0, 0, 1], &[0], &[1.0])).unwrap();
        assert!(matches!(index.check_fresh(&cache), Err(CacheError::StaleIndex { .. })));
    }

    #[test]
    fn test_shrink_keeps_listed() {
        let mut cache = small_cache(4);
        for x in 0..4 {
            let feat = [x as f32];
            cache.add(&NewFeatureVector::new([1, x, 0, 0], &[0], &feat)).unwrap();
        }
        cache.shrink(&[1, 3]).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.records()[0].key[KEY_X], 1);
        assert_eq!(cache.records()[1].key[KEY_X], 3);
        assert_eq!(cache.byte_size(), 8);

        // released chunks are reusable
        cache.add(&NewFeatureVector::new([1, 9, 0, 0], &[0], &[9.0])).unwrap();
        cache.add(&NewFeatureVector::new([1, 8, 0, 0], &[0], &[8.0])).unwrap();
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_shrink_rejects_unsorted() {
        let mut cache = small_cache(4);
        cache.add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0])).unwrap();
        assert!(matches!(
            cache.shrink(&[0, 0]),
            Err(CacheError::UnsortedIndices { position: 1 })
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_free_returns_to_zero() {
        let mut cache = small_cache(4);
        cache.add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0, 2.0])).unwrap();
        cache.free().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.byte_size(), 0);
    }

    #[test]
    fn test_info_margins() {
        let mut cache = small_cache(4);
        cache
            .add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0]).with_belief(true))
            .unwrap();
        cache
            .add(&NewFeatureVector::new([1, 1, 0, 0], &[0], &[3.0]).with_loss(1.0))
            .unwrap();
        cache.add(&NewFeatureVector::new([-2, 0, 0, 0], &[0], &[0.5])).unwrap();
        let index = cache.build_index();

        let model = Model::new(ModelParams::new(vec![vec![2.0]], 1.0), 2).unwrap();
        let rows = cache.info(&index, &model).unwrap();
        assert_eq!(rows.len(), 3);

        // hinge negative first in key order
        assert_eq!(rows[0].data_id, -2);
        assert!((rows[0].margin - (-1.0 * 1.0 - 1.0)).abs() < 1e-12);
        assert!((rows[1].margin).abs() < 1e-12);
        assert!((rows[2].score - 6.0).abs() < 1e-12);
        assert!((rows[2].margin - (2.0 - 7.0)).abs() < 1e-12);
    }
}
