//! Feature vector records.
//!
//! A [`FeatureVector`] is one candidate latent output of one training example:
//! a block-sparse numeric vector plus the metadata needed by training. The
//! numeric payload itself lives in the cache's chunk pools; the record only
//! holds the chunk handles.

use std::cmp::Ordering;
use std::fmt;

use crate::pool::ChunkId;

/// Source image / example id.
pub const KEY_DATA_ID: usize = 0;
/// Horizontal location of the candidate.
pub const KEY_X: usize = 1;
/// Vertical location of the candidate.
pub const KEY_Y: usize = 2;
/// Scale (pyramid level) of the candidate.
pub const KEY_SCALE: usize = 3;
/// Number of key fields.
pub const KEY_LEN: usize = 4;

/// Key identifying where a candidate output was evaluated.
pub type FvKey = [i32; KEY_LEN];

/// One cached feature vector.
///
/// Identity is the key plus the exact feature bits; everything from `norm`
/// on is derived or training-time annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    /// (data id, x, y, scale).
    pub key: FvKey,
    /// Number of blocks the vector touches.
    pub num_blocks: usize,
    /// Number of valid floats in the feature chunk.
    pub feat_dim: usize,
    /// Cleared on records found to duplicate their predecessor.
    pub is_unique: bool,
    /// Feature chunk, `None` for a zero vector.
    pub(crate) feat: Option<ChunkId>,
    /// Block-label chunk, `None` for a zero vector.
    pub(crate) block_labels: Option<ChunkId>,
    /// L2 norm of the features.
    pub norm: f64,
    /// The vector touches no blocks (an all-absent latent choice).
    pub is_zero: bool,
    /// The candidate is consistent with the ground truth.
    pub is_belief: bool,
    /// The candidate came from hard-negative mining.
    pub is_mined: bool,
    /// Last computed score.
    pub score: f64,
    /// Structured loss of the candidate output.
    pub loss: f64,
    /// Last computed margin.
    pub margin: f64,
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self {
            key: [0; KEY_LEN],
            num_blocks: 0,
            feat_dim: 0,
            is_unique: false,
            feat: None,
            block_labels: None,
            norm: 0.0,
            is_zero: false,
            is_belief: false,
            is_mined: false,
            score: 0.0,
            loss: 0.0,
            margin: 0.0,
        }
    }
}

impl FeatureVector {
    /// Example key shared by every candidate of one training instance.
    #[must_use]
    pub const fn example_key(&self) -> i32 {
        self.key[KEY_DATA_ID]
    }

    /// Class label of a belief-less example, folded into the data id sign.
    #[must_use]
    pub const fn binary_label(&self) -> i32 {
        if self.key[KEY_DATA_ID] > 0 {
            1
        } else {
            -1
        }
    }

    /// Bytes this record accounts for in the cache byte size.
    #[must_use]
    pub const fn byte_size(&self) -> u64 {
        if self.is_zero {
            0
        } else {
            (self.feat_dim * std::mem::size_of::<f32>()) as u64
        }
    }

    /// Chunk handles, if the vector is non-zero.
    #[must_use]
    pub const fn chunks(&self) -> Option<(ChunkId, ChunkId)> {
        match (self.feat, self.block_labels) {
            (Some(f), Some(b)) => Some((f, b)),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dataid: {}  x: {}  y: {}  scale: {}  dim: {}  uniq: {}  belief: {}",
            self.key[KEY_DATA_ID],
            self.key[KEY_X],
            self.key[KEY_Y],
            self.key[KEY_SCALE],
            self.feat_dim,
            self.is_unique,
            self.is_belief
        )
    }
}

/// Lexicographic key comparison.
#[must_use]
pub fn key_cmp(a: &FeatureVector, b: &FeatureVector) -> Ordering {
    a.key.cmp(&b.key)
}

/// Total order used to sort the cache before deduplication: key, then
/// length, then element-wise feature comparison.
///
/// Duplicates come from identical upstream computation, so exact float
/// comparison is the right equality here.
#[must_use]
pub fn cmp_total(a: &FeatureVector, a_feat: &[f32], b: &FeatureVector, b_feat: &[f32]) -> Ordering {
    key_cmp(a, b)
        .then(a.feat_dim.cmp(&b.feat_dim))
        .then_with(|| {
            a_feat
                .iter()
                .zip(b_feat)
                .map(|(x, y)| x.total_cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        })
}

/// L2 norm of a feature buffer, accumulated in double precision.
#[must_use]
pub fn l2_norm(feat: &[f32]) -> f64 {
    feat.iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv_with_key(key: FvKey, dim: usize) -> FeatureVector {
        FeatureVector {
            key,
            feat_dim: dim,
            ..FeatureVector::default()
        }
    }

    #[test]
    fn test_cmp_total_orders_by_key_then_len_then_bits() {
        let a = fv_with_key([1, 0, 0, 0], 2);
        let b = fv_with_key([1, 0, 0, 1], 1);
        assert_eq!(cmp_total(&a, &[0.0, 0.0], &b, &[0.0]), Ordering::Less);

        let c = fv_with_key([1, 0, 0, 0], 1);
        assert_eq!(cmp_total(&c, &[5.0], &a, &[0.0, 0.0]), Ordering::Less);

        let d = fv_with_key([1, 0, 0, 0], 2);
        assert_eq!(cmp_total(&a, &[1.0, 2.0], &d, &[1.0, 3.0]), Ordering::Less);
        assert_eq!(cmp_total(&a, &[1.0, 2.0], &d, &[1.0, 2.0]), Ordering::Equal);
    }

    #[test]
    fn test_binary_label_from_data_id() {
        assert_eq!(fv_with_key([7, 0, 0, 0], 0).binary_label(), 1);
        assert_eq!(fv_with_key([-7, 0, 0, 0], 0).binary_label(), -1);
    }

    #[test]
    fn test_l2_norm() {
        assert!((l2_norm(&[3.0, 4.0]) - 5.0).abs() < 1e-12);
        assert_eq!(l2_norm(&[]), 0.0);
    }

    #[test]
    fn test_zero_vector_has_no_bytes() {
        let mut f = fv_with_key([1, 0, 0, 0], 4);
        assert_eq!(f.byte_size(), 16);
        f.is_zero = true;
        assert_eq!(f.byte_size(), 0);
    }
}
