//! Block-sparse model parameters.
//!
//! The parameter vector is split into blocks; feature vectors only touch some
//! of them. Besides the weights the model carries per-block box constraints
//! and multipliers, the regularizer discipline, and a ring of past weight
//! snapshots used by margin-bound pruning.
//!
//! # Example
//!
//! ```
//! use fv_cache_rs::model::{Model, ModelParams};
//!
//! let params = ModelParams::new(vec![vec![1.0, 2.0], vec![3.0]], 1.0);
//! let model = Model::new(params, 50).unwrap();
//!
//! // one run for block 1, then one for block 0
//! let score = model.score(&[2.0, 0.5, -1.0], &[1, 0]);
//! assert!((score - (6.0 + 0.5 - 2.0)).abs() < 1e-12);
//! ```

use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{read_json, MaxPolicy};
use crate::error::{CacheError, Result};

fn default_j() -> f64 {
    1.0
}

mod lower_bounds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(lb: &[Vec<f64>], s: S) -> Result<S::Ok, S::Error> {
        let bounds: Vec<Vec<Option<f64>>> = lb
            .iter()
            .map(|b| b.iter().map(|&x| x.is_finite().then_some(x)).collect())
            .collect();
        bounds.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<f64>>, D::Error> {
        let bounds = Vec::<Vec<Option<f64>>>::deserialize(d)?;
        Ok(bounds
            .into_iter()
            .map(|b| b.into_iter().map(|x| x.unwrap_or(f64::NEG_INFINITY)).collect())
            .collect())
    }
}

/// Serializable model description, as handed over by the host.
///
/// Empty `lb`, `reg_mult` or `learn_mult` mean "unconstrained" and "1.0"
/// respectively. An empty `components` list selects plain L2
/// regularization; otherwise the max-over-components regularizer is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Weights, one vector per block.
    pub w: Vec<Vec<f64>>,
    /// Lower bounds, same shape as `w`. Unbounded entries are `null` in JSON.
    #[serde(default, with = "lower_bounds")]
    pub lb: Vec<Vec<f64>>,
    /// Per-block regularization multiplier.
    #[serde(default)]
    pub reg_mult: Vec<f32>,
    /// Per-block learning-rate multiplier.
    #[serde(default)]
    pub learn_mult: Vec<f32>,
    /// Blocks of each mixture component.
    #[serde(default)]
    pub components: Vec<Vec<usize>>,
    /// Loss weight.
    pub c: f64,
    /// Extra weight on positive examples of the binary hinge form.
    #[serde(default = "default_j")]
    pub j: f64,
}

impl ModelParams {
    /// Parameters with the given weights and loss weight, no box
    /// constraints, unit multipliers and L2 regularization.
    #[must_use]
    pub fn new(w: Vec<Vec<f64>>, c: f64) -> Self {
        Self {
            w,
            lb: Vec::new(),
            reg_mult: Vec::new(),
            learn_mult: Vec::new(),
            components: Vec::new(),
            c,
            j: 1.0,
        }
    }

    /// Set lower bounds.
    #[must_use]
    pub fn with_lower_bounds(mut self, lb: Vec<Vec<f64>>) -> Self {
        self.lb = lb;
        self
    }

    /// Set regularization multipliers.
    #[must_use]
    pub fn with_reg_mult(mut self, reg_mult: Vec<f32>) -> Self {
        self.reg_mult = reg_mult;
        self
    }

    /// Set learning-rate multipliers.
    #[must_use]
    pub fn with_learn_mult(mut self, learn_mult: Vec<f32>) -> Self {
        self.learn_mult = learn_mult;
        self
    }

    /// Use max-over-components regularization with these components.
    #[must_use]
    pub fn with_components(mut self, components: Vec<Vec<usize>>) -> Self {
        self.components = components;
        self
    }

    /// Set the positive-class weight.
    #[must_use]
    pub const fn with_j(mut self, j: f64) -> Self {
        self.j = j;
        self
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path)
    }

    /// Write to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Regularization discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Regularizer {
    /// `0.5 * sum_b reg_mult[b] * ||w_b||^2`.
    L2,
    /// Max (hard or smoothed) over per-component half squared norms.
    Max {
        /// Block ids of each component; empty components never compete.
        components: Vec<Vec<usize>>,
    },
}

/// Fixed-length ring of past weight vectors and their distance to the
/// current one.
///
/// Slot 0 is always the most recent snapshot. Slots that have not been
/// filled yet report an infinite distance, so nothing can be pruned against
/// them.
#[derive(Debug, Clone)]
pub struct WeightHistory {
    snapshots: VecDeque<Vec<f64>>,
    dw_norm: Vec<f64>,
    capacity: usize,
}

impl WeightHistory {
    /// Empty history with room for `capacity` snapshots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            dw_norm: vec![f64::INFINITY; capacity],
            capacity,
        }
    }

    /// Record `w` as the newest snapshot and refresh all distances.
    pub fn push(&mut self, w: &[f64]) {
        if self.capacity == 0 {
            return;
        }
        let mut slot = if self.snapshots.len() == self.capacity {
            self.snapshots.pop_back().unwrap_or_default()
        } else {
            Vec::with_capacity(w.len())
        };
        slot.clear();
        slot.extend_from_slice(w);
        self.snapshots.push_front(slot);

        for (i, d) in self.dw_norm.iter_mut().enumerate() {
            *d = self.snapshots.get(i).map_or(f64::INFINITY, |old| {
                if i == 0 {
                    0.0
                } else {
                    old.iter()
                        .zip(w)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                        .sqrt()
                }
            });
        }
    }

    /// Distance between the snapshot taken `age` pushes ago and the newest.
    #[must_use]
    pub fn dw_norm(&self, age: usize) -> f64 {
        self.dw_norm.get(age).copied().unwrap_or(f64::INFINITY)
    }

    /// All distances, newest first.
    #[must_use]
    pub fn dw_norms(&self) -> &[f64] {
        &self.dw_norm
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of filled slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no snapshot was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Drop every snapshot.
    pub fn reset(&mut self) {
        self.snapshots.clear();
        self.dw_norm.fill(f64::INFINITY);
    }
}

/// The block-sparse parameter vector with its training metadata.
#[derive(Debug, Clone)]
pub struct Model {
    w: Vec<Vec<f64>>,
    lb: Vec<Vec<f64>>,
    block_sizes: Vec<usize>,
    offsets: Vec<usize>,
    dim: usize,
    reg_mult: Vec<f32>,
    learn_mult: Vec<f32>,
    regularizer: Regularizer,
    c: f64,
    j: f64,
    history: WeightHistory,
}

impl Model {
    /// Build a model from host parameters.
    ///
    /// # Errors
    ///
    /// Returns error if bounds or multipliers do not match the block layout,
    /// or a component names a block that does not exist.
    pub fn new(params: ModelParams, hist_size: usize) -> Result<Self> {
        let ModelParams {
            w,
            lb,
            reg_mult,
            learn_mult,
            components,
            c,
            j,
        } = params;
        let num_blocks = w.len();
        let block_sizes: Vec<usize> = w.iter().map(Vec::len).collect();

        let lb = if lb.is_empty() {
            block_sizes
                .iter()
                .map(|&s| vec![f64::NEG_INFINITY; s])
                .collect()
        } else {
            check_len(num_blocks, lb.len())?;
            for (bounds, &size) in lb.iter().zip(&block_sizes) {
                check_len(size, bounds.len())?;
            }
            lb
        };

        let per_block = |mult: Vec<f32>| -> Result<Vec<f32>> {
            if mult.is_empty() {
                Ok(vec![1.0; num_blocks])
            } else {
                check_len(num_blocks, mult.len())?;
                Ok(mult)
            }
        };
        let reg_mult = per_block(reg_mult)?;
        let learn_mult = per_block(learn_mult)?;

        if let Some(&b) = components.iter().flatten().find(|&&b| b >= num_blocks) {
            return Err(CacheError::InvalidBlock {
                block: b as i64,
                num_blocks,
            });
        }
        if !c.is_finite() || c < 0.0 {
            return Err(CacheError::InvalidConfig(format!("C must be >= 0, got {c}")));
        }

        let regularizer = if components.is_empty() {
            Regularizer::L2
        } else {
            Regularizer::Max { components }
        };

        let mut offsets = Vec::with_capacity(num_blocks);
        let mut dim = 0;
        for &s in &block_sizes {
            offsets.push(dim);
            dim += s;
        }

        Ok(Self {
            w,
            lb,
            block_sizes,
            offsets,
            dim,
            reg_mult,
            learn_mult,
            regularizer,
            c,
            j,
            history: WeightHistory::new(hist_size),
        })
    }

    /// Current parameters in host form.
    #[must_use]
    pub fn params(&self) -> ModelParams {
        ModelParams {
            w: self.w.clone(),
            lb: self.lb.clone(),
            reg_mult: self.reg_mult.clone(),
            learn_mult: self.learn_mult.clone(),
            components: match &self.regularizer {
                Regularizer::L2 => Vec::new(),
                Regularizer::Max { components } => components.clone(),
            },
            c: self.c,
            j: self.j,
        }
    }

    /// Number of blocks.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.w.len()
    }

    /// Size of every block.
    #[must_use]
    pub fn block_sizes(&self) -> &[usize] {
        &self.block_sizes
    }

    /// Offset of every block in the flat parameter vector.
    #[must_use]
    pub fn block_offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Total parameter dimensionality.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Weights, one vector per block.
    #[must_use]
    pub fn blocks(&self) -> &[Vec<f64>] {
        &self.w
    }

    /// Lower bounds, one vector per block.
    #[must_use]
    pub fn lower_bounds(&self) -> &[Vec<f64>] {
        &self.lb
    }

    /// Loss weight.
    #[must_use]
    pub const fn c(&self) -> f64 {
        self.c
    }

    /// Positive-class weight of the hinge form.
    #[must_use]
    pub const fn j(&self) -> f64 {
        self.j
    }

    /// Regularizer discipline.
    #[must_use]
    pub const fn regularizer(&self) -> &Regularizer {
        &self.regularizer
    }

    /// Per-block regularization multipliers.
    #[must_use]
    pub fn reg_mult(&self) -> &[f32] {
        &self.reg_mult
    }

    /// Per-block learning-rate multipliers.
    #[must_use]
    pub fn learn_mult(&self) -> &[f32] {
        &self.learn_mult
    }

    /// Weight snapshots used by pruning.
    #[must_use]
    pub const fn history(&self) -> &WeightHistory {
        &self.history
    }

    /// Mutable access to the snapshot ring.
    pub fn history_mut(&mut self) -> &mut WeightHistory {
        &mut self.history
    }

    /// Weights flattened in block order.
    #[must_use]
    pub fn flat(&self) -> Vec<f64> {
        self.w.iter().flatten().copied().collect()
    }

    /// Overwrite all weights from a flat vector.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::DimensionMismatch`] if `w.len() != dim()`.
    pub fn set_flat(&mut self, w: &[f64]) -> Result<()> {
        check_len(self.dim, w.len())?;
        let mut rest = w;
        for block in &mut self.w {
            let (head, tail) = rest.split_at(block.len());
            block.copy_from_slice(head);
            rest = tail;
        }
        Ok(())
    }

    /// Record the current weights as the newest pruning snapshot.
    pub fn snapshot(&mut self) {
        let flat = self.flat();
        self.history.push(&flat);
    }

    /// Score a block-sparse feature buffer.
    ///
    /// `feat` holds one contiguous run per entry of `block_labels`, each as
    /// long as that block. Blocks missing from `block_labels` contribute
    /// nothing; a zero vector scores exactly 0.
    ///
    /// # Panics
    ///
    /// Panics if a label is out of range or the runs overrun `feat`; use
    /// [`Model::try_score`] on unvalidated input.
    #[must_use]
    pub fn score(&self, feat: &[f32], block_labels: &[i32]) -> f64 {
        let mut val = 0.0;
        let mut off = 0;
        for &b in block_labels {
            let wb = &self.w[b as usize];
            let run = &feat[off..off + wb.len()];
            let block_val: f64 = wb.iter().zip(run).map(|(w, &x)| w * f64::from(x)).sum();
            val += block_val;
            off += wb.len();
        }
        val
    }

    /// Checked variant of [`Model::score`].
    ///
    /// # Errors
    ///
    /// Returns error if a label is out of range or the block runs do not
    /// exactly cover `feat`.
    pub fn try_score(&self, feat: &[f32], block_labels: &[i32]) -> Result<f64> {
        self.check_layout(feat.len(), block_labels)?;
        Ok(self.score(feat, block_labels))
    }

    /// Verify that `block_labels` describes a feature buffer of `feat_dim`
    /// floats under this model's block sizes.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidBlock`] for an unknown label and
    /// [`CacheError::DimensionMismatch`] if the runs do not cover the buffer.
    pub fn check_layout(&self, feat_dim: usize, block_labels: &[i32]) -> Result<()> {
        let mut expected = 0;
        for &b in block_labels {
            let size = usize::try_from(b)
                .ok()
                .and_then(|b| self.block_sizes.get(b))
                .ok_or(CacheError::InvalidBlock {
                    block: i64::from(b),
                    num_blocks: self.num_blocks(),
                })?;
            expected += size;
        }
        check_len(expected, feat_dim)
    }

    /// `grad[block run] += scale * feat` for every run of the vector.
    pub fn accumulate(&self, feat: &[f32], block_labels: &[i32], scale: f64, grad: &mut [f64]) {
        let mut off = 0;
        for &b in block_labels {
            let b = b as usize;
            let size = self.block_sizes[b];
            let start = self.offsets[b];
            for (g, &x) in grad[start..start + size].iter_mut().zip(&feat[off..off + size]) {
                *g += scale * f64::from(x);
            }
            off += size;
        }
    }

    /// `w_b += rate * learn_mult[b] * feat_b` for every run of the vector.
    pub fn step(&mut self, feat: &[f32], block_labels: &[i32], rate: f64) {
        let mut off = 0;
        for &b in block_labels {
            let b = b as usize;
            let mult = rate * f64::from(self.learn_mult[b]);
            let size = self.block_sizes[b];
            for (w, &x) in self.w[b].iter_mut().zip(&feat[off..off + size]) {
                *w += mult * f64::from(x);
            }
            off += size;
        }
    }

    /// Clamp every weight to its lower bound. Idempotent.
    pub fn project(&mut self) {
        for (wb, lbb) in self.w.iter_mut().zip(&self.lb) {
            for (w, &lb) in wb.iter_mut().zip(lbb) {
                *w = w.max(lb);
            }
        }
    }

    fn block_half_sq_norm(&self, b: usize) -> f64 {
        let sq: f64 = self.w[b].iter().map(|w| w * w).sum();
        0.5 * f64::from(self.reg_mult[b]) * sq
    }

    /// Half squared norm of every non-empty component, as `(component, value)`.
    #[must_use]
    pub fn component_norms(&self) -> Vec<(usize, f64)> {
        match &self.regularizer {
            Regularizer::L2 => Vec::new(),
            Regularizer::Max { components } => components
                .iter()
                .enumerate()
                .filter(|(_, blocks)| !blocks.is_empty())
                .map(|(c, blocks)| (c, blocks.iter().map(|&b| self.block_half_sq_norm(b)).sum()))
                .collect(),
        }
    }

    /// Component with the largest half squared norm; the first wins ties.
    #[must_use]
    pub fn max_component(&self) -> Option<usize> {
        let mut best = None;
        let mut best_val = f64::NEG_INFINITY;
        for (c, h) in self.component_norms() {
            if h > best_val {
                best_val = h;
                best = Some(c);
            }
        }
        best
    }

    /// Value of the regularizer, adding its gradient into `grad` (a flat
    /// vector of length `dim()`) when given.
    pub fn regularization(&self, policy: MaxPolicy, grad: Option<&mut [f64]>) -> f64 {
        match &self.regularizer {
            Regularizer::L2 => {
                let value = (0..self.num_blocks()).map(|b| self.block_half_sq_norm(b)).sum::<f64>();
                if let Some(grad) = grad {
                    for b in 0..self.num_blocks() {
                        self.add_block_reg_grad(b, 1.0, grad);
                    }
                }
                value
            }
            Regularizer::Max { components } => {
                let norms = self.component_norms();
                let Some(max) = norms.iter().map(|&(_, h)| h).reduce(f64::max) else {
                    return 0.0;
                };
                match policy {
                    MaxPolicy::Hard => {
                        if let (Some(grad), Some(c)) = (grad, self.max_component()) {
                            for &b in &components[c] {
                                self.add_block_reg_grad(b, 1.0, grad);
                            }
                        }
                        max
                    }
                    MaxPolicy::Softmax { beta } => {
                        let weights: Vec<f64> =
                            norms.iter().map(|&(_, h)| (beta * (h - max)).exp()).collect();
                        let total: f64 = weights.iter().sum();
                        if let Some(grad) = grad {
                            for (&(c, _), &wt) in norms.iter().zip(&weights) {
                                let p = wt / total;
                                for &b in &components[c] {
                                    self.add_block_reg_grad(b, p, grad);
                                }
                            }
                        }
                        max + total.ln() / beta
                    }
                }
            }
        }
    }

    fn add_block_reg_grad(&self, b: usize, p: f64, grad: &mut [f64]) {
        let mult = p * f64::from(self.reg_mult[b]);
        let start = self.offsets[b];
        for (g, &w) in grad[start..start + self.block_sizes[b]].iter_mut().zip(&self.w[b]) {
            *g += mult * w;
        }
    }

    /// Batched lazy regularization step: shrink the regularized blocks by
    /// `(1 - rate * reg_mult * learn_mult)^steps`.
    ///
    /// Under L2 every block decays; under max regularization only the
    /// current arg-max component does.
    pub fn decay(&mut self, rate: f64, steps: u64) {
        let blocks: Vec<usize> = match &self.regularizer {
            Regularizer::L2 => (0..self.num_blocks()).collect(),
            Regularizer::Max { components } => match self.max_component() {
                Some(c) => components[c].clone(),
                None => return,
            },
        };
        let steps = i32::try_from(steps).unwrap_or(i32::MAX);
        for b in blocks {
            let mult = rate * f64::from(self.reg_mult[b]) * f64::from(self.learn_mult[b]);
            let mult = (1.0 - mult).powi(steps);
            for w in &mut self.w[b] {
                *w *= mult;
            }
        }
    }
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CacheError::DimensionMismatch { expected, actual })
    }
}
