//! Objective and gradient of the latent structural SVM over the cache.
//!
//! Each example contributes a loss-augmented hinge term. With a belief
//! member it is `C * (max_m (score_m + loss_m) - score_belief)`; without one
//! the example is a binary hinge `C' * max(0, 1 - y * V)` with the label `y`
//! folded into the data id. The regularizer comes from [`Model::regularization`].
//!
//! [`ObjectiveEngine::gradient`] skips examples whose last evaluation left
//! enough margin to survive every weight change since then (margin-bound
//! pruning). Skipped examples reuse their cached contribution and add no
//! gradient, which is exact under those bounds.
//!
//! The gradient pass splits the examples into one contiguous partition per
//! thread. Every partition accumulates into a private buffer and the buffers
//! are summed in partition order afterwards, so results do not depend on
//! scheduling.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::FeatureVectorCache;
use crate::config::EngineConfig;
use crate::error::{CacheError, Result};
use crate::example::{Example, ExampleIndex};
use crate::model::Model;

/// The three parts of the objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveTerms {
    /// Loss of hinge negatives and of examples whose belief is a zero vector.
    pub bg_loss: f64,
    /// Loss of every other example.
    pub fg_loss: f64,
    /// Regularizer value.
    pub reg: f64,
}

impl ObjectiveTerms {
    /// `bg_loss + fg_loss + reg`.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.bg_loss + self.fg_loss + self.reg
    }

    /// `bg_loss + fg_loss`.
    #[must_use]
    pub fn loss(&self) -> f64 {
        self.bg_loss + self.fg_loss
    }
}

/// Subgradient direction of a violated example.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Violation {
    /// Arg-max `arg` beat the belief.
    Belief { arg: usize, belief: usize },
    /// Hinge term active for arg-max `arg` with label `y` and weight `c`.
    Hinge { arg: usize, y: f64, c: f64 },
}

/// Full evaluation of one example under the current weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ExampleEval {
    pub contribution: f64,
    pub margin_bound: f64,
    pub is_background: bool,
    pub violation: Option<Violation>,
}

/// Score every member of `ex` and derive its objective term.
///
/// The arg-max is the first member reaching the largest `score + loss`.
pub(crate) fn evaluate(cache: &FeatureVectorCache, model: &Model, ex: &Example) -> ExampleEval {
    let members = &cache.records()[ex.range()];

    let mut best = f64::NEG_INFINITY;
    let mut arg = ex.begin;
    let mut belief_score = 0.0;
    let mut best_other = f64::NEG_INFINITY;
    for (pos, r) in ex.range().zip(members) {
        let score = model.score(cache.features(r), cache.block_labels(r));
        let v = score + r.loss;
        if v > best {
            best = v;
            arg = pos;
        }
        if Some(pos) == ex.belief {
            belief_score = score;
        } else {
            best_other = best_other.max(v);
        }
    }

    let c = model.c();
    match ex.belief {
        Some(belief) => {
            let b = &members[belief - ex.begin];
            let (contribution, violation) = if arg == belief {
                (c * b.loss, None)
            } else {
                (c * (best - belief_score), Some(Violation::Belief { arg, belief }))
            };
            ExampleEval {
                contribution,
                margin_bound: (belief_score + b.loss) - best_other,
                is_background: b.is_zero,
                violation,
            }
        }
        None => {
            let label = members.first().map_or(-1, |r| r.binary_label());
            let y = f64::from(label);
            let c = if label > 0 { c * model.j() } else { c };
            let yv = y * best;
            ExampleEval {
                contribution: c * (1.0 - yv).max(0.0),
                margin_bound: yv - 1.0,
                is_background: label < 0,
                violation: (yv < 1.0).then_some(Violation::Hinge { arg, y, c }),
            }
        }
    }
}

struct PassContext<'a> {
    cache: &'a FeatureVectorCache,
    model: &'a Model,
    pruning: bool,
    hist_size: usize,
}

impl PassContext<'_> {
    fn example(&self, ex: &mut Example, grad: &mut [f64]) -> f64 {
        if self.pruning {
            let age = ex.hist + 1;
            let drift = self.model.history().dw_norm(age) * (ex.belief_norm + ex.max_nonbelief_norm);
            if age < self.hist_size && ex.margin_bound - drift > 0.0 {
                ex.hist = age;
                return ex.contribution;
            }
        }

        let eval = evaluate(self.cache, self.model, ex);
        ex.hist = 0;
        ex.margin_bound = eval.margin_bound;
        ex.contribution = eval.contribution;

        let records = self.cache.records();
        match eval.violation {
            Some(Violation::Belief { arg, belief }) => {
                let c = self.model.c();
                let (a, b) = (&records[arg], &records[belief]);
                self.model
                    .accumulate(self.cache.features(a), self.cache.block_labels(a), c, grad);
                self.model
                    .accumulate(self.cache.features(b), self.cache.block_labels(b), -c, grad);
            }
            Some(Violation::Hinge { arg, y, c }) => {
                let a = &records[arg];
                self.model
                    .accumulate(self.cache.features(a), self.cache.block_labels(a), -y * c, grad);
            }
            None => {}
        }
        eval.contribution
    }

    fn partition(&self, part: &mut [Example]) -> (f64, Vec<f64>) {
        let mut grad = vec![0.0; self.model.dim()];
        let loss = part.iter_mut().map(|ex| self.example(ex, &mut grad)).sum();
        (loss, grad)
    }
}

/// Evaluates the objective and its gradient over an [`ExampleIndex`].
///
/// # Example
///
/// ```
/// use fv_cache_rs::cache::{FeatureVectorCache, NewFeatureVector};
/// use fv_cache_rs::model::{Model, ModelParams};
/// use fv_cache_rs::objective::ObjectiveEngine;
/// use fv_cache_rs::{CacheConfig, EngineConfig};
///
/// let mut cache = FeatureVectorCache::new(CacheConfig::default().with_max_num_fv(16)).unwrap();
/// cache.add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0]).with_belief(true)).unwrap();
/// cache.add(&NewFeatureVector::new([1, 1, 0, 0], &[0], &[2.0]).with_loss(1.0)).unwrap();
/// let mut index = cache.build_index();
///
/// let mut model = Model::new(ModelParams::new(vec![vec![0.0]], 1.0), 50).unwrap();
/// let mut engine = ObjectiveEngine::new(EngineConfig::default());
///
/// let (value, grad) = engine.gradient(&mut index, &cache, &mut model, &[0.0]).unwrap();
/// assert!((value - 1.0).abs() < 1e-12);
/// assert!((grad[0] - 1.0).abs() < 1e-12);
/// ```
#[derive(Debug)]
pub struct ObjectiveEngine {
    config: EngineConfig,
    pool: Option<ThreadPool>,
}

impl ObjectiveEngine {
    /// Create an engine; worker threads are spawned on first parallel use.
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self { config, pool: None }
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Change the number of gradient threads (at least one).
    pub fn set_num_threads(&mut self, threads: usize) {
        self.config.num_threads = threads.max(1);
    }

    /// Enable or disable margin-bound pruning.
    pub fn set_pruning(&mut self, pruning: bool) {
        self.config.pruning = pruning;
    }

    /// Check that every record fits the model's block layout, so that the
    /// unchecked scoring path cannot go out of bounds.
    ///
    /// # Errors
    ///
    /// Returns the first layout error found.
    pub fn validate_cache(cache: &FeatureVectorCache, model: &Model) -> Result<()> {
        for r in cache.records() {
            model.check_layout(r.feat_dim, cache.block_labels(r))?;
        }
        Ok(())
    }

    /// Objective value at the model's current weights, without pruning.
    ///
    /// # Errors
    ///
    /// Returns error if `index` is stale or the cache does not fit the model.
    pub fn obj_val(
        &self,
        index: &ExampleIndex,
        cache: &FeatureVectorCache,
        model: &Model,
    ) -> Result<ObjectiveTerms> {
        index.check_fresh(cache)?;
        Self::validate_cache(cache, model)?;

        let mut terms = ObjectiveTerms {
            reg: model.regularization(self.config.max_policy, None),
            ..ObjectiveTerms::default()
        };
        for ex in index {
            let eval = evaluate(cache, model, ex);
            if eval.is_background {
                terms.bg_loss += eval.contribution;
            } else {
                terms.fg_loss += eval.contribution;
            }
        }
        Ok(terms)
    }

    /// Install `w`, then return the objective value and its gradient.
    ///
    /// # Errors
    ///
    /// - [`CacheError::StaleIndex`] if the cache changed since `index` was built
    /// - [`CacheError::DimensionMismatch`] if `w` has the wrong length
    /// - a layout error if a record does not fit the model
    pub fn gradient(
        &mut self,
        index: &mut ExampleIndex,
        cache: &FeatureVectorCache,
        model: &mut Model,
        w: &[f64],
    ) -> Result<(f64, Vec<f64>)> {
        index.check_fresh(cache)?;
        model.set_flat(w)?;
        Self::validate_cache(cache, model)?;
        model.snapshot();

        let mut grad = vec![0.0; model.dim()];
        let reg = model.regularization(self.config.max_policy, Some(&mut grad));

        let examples = index.examples_mut();
        let threads = self.config.num_threads.clamp(1, examples.len().max(1));
        let part_len = examples.len().div_ceil(threads).max(1);
        let ctx = PassContext {
            cache,
            model: &*model,
            pruning: self.config.pruning,
            hist_size: model.history().capacity(),
        };

        let partials: Vec<(f64, Vec<f64>)> = if threads == 1 {
            vec![ctx.partition(examples)]
        } else {
            self.thread_pool(threads)?.install(|| {
                examples
                    .par_chunks_mut(part_len)
                    .map(|part| ctx.partition(part))
                    .collect()
            })
        };

        let mut value = reg;
        for (loss, part_grad) in &partials {
            value += loss;
            for (g, p) in grad.iter_mut().zip(part_grad) {
                *g += p;
            }
        }
        debug!(
            "Gradient pass over {} examples in {} partitions: f = {value}",
            examples.len(),
            partials.len()
        );
        Ok((value, grad))
    }

    fn thread_pool(&mut self, threads: usize) -> Result<&ThreadPool> {
        let stale = self
            .pool
            .as_ref()
            .map_or(true, |p| p.current_num_threads() != threads);
        if stale {
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("fv-gradient-{i}"))
                .build()
                .map_err(|e| CacheError::InvalidConfig(format!("failed to build thread pool: {e}")))?;
            self.pool = Some(pool);
        }
        self.pool
            .as_ref()
            .ok_or_else(|| CacheError::InvariantBroken("thread pool missing".into()))
    }
}
