//! Legacy stochastic sub-gradient solver.
//!
//! Visits examples in a fresh random order every epoch and takes one
//! sub-gradient step on each example of the adaptive hot set. Examples that
//! keep satisfying their margin drift out of the hot set and are only
//! revisited after a randomized wait. Regularization is applied lazily every
//! `reg_freq` steps, and the full objective is checked every `check_freq`
//! steps to detect convergence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::FeatureVectorCache;
use crate::config::{EngineConfig, MaxPolicy, SgdConfig};
use crate::error::Result;
use crate::example::ExampleIndex;
use crate::model::Model;
use crate::objective::{evaluate, ObjectiveEngine, ObjectiveTerms, Violation};

/// Wait counters of the adaptive working set.
///
/// An example is hot while its counter is at most `in_cache`. Every example
/// starts on the fence at `in_cache`, so one that already meets its margin on
/// the first visit is evicted straight away.
#[derive(Debug, Clone)]
pub(crate) struct HotSet {
    wait: Vec<i32>,
    in_cache: i32,
    min_wait: i32,
    max_rnd_wait: i32,
}

impl HotSet {
    pub(crate) fn new(num: usize, cfg: &SgdConfig) -> Self {
        Self {
            wait: vec![cfg.in_cache; num],
            in_cache: cfg.in_cache,
            min_wait: cfg.min_wait,
            max_rnd_wait: cfg.max_rnd_wait,
        }
    }

    pub(crate) fn contains(&self, i: usize) -> bool {
        self.wait[i] <= self.in_cache
    }

    pub(crate) fn count(&self) -> usize {
        self.wait.iter().filter(|&&w| w <= self.in_cache).count()
    }

    /// An out-of-set example moves one epoch closer to re-entry.
    pub(crate) fn skip(&mut self, i: usize) {
        self.wait[i] -= 1;
    }

    /// Update after visiting a hot example.
    pub(crate) fn visit<R: Rng>(&mut self, i: usize, violated: bool, rng: &mut R) {
        let w = &mut self.wait[i];
        if violated {
            *w = 0;
        } else if *w == self.in_cache {
            *w = self.min_wait + rng.random_range(0..self.max_rnd_wait);
        } else {
            *w += 1;
        }
    }
}

/// Cooperative stop flag shared with whoever may interrupt training.
///
/// # Example
///
/// ```
/// use fv_cache_rs::sgd::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; the solver notices at the next epoch boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SgdOutcome {
    /// The relative objective change stayed under the threshold long enough.
    Converged,
    /// The cancellation token was triggered.
    Interrupted,
    /// `max_iter` steps were taken.
    Exhausted,
}

/// One periodic objective check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCheck {
    /// Steps taken so far.
    pub iteration: u64,
    /// Objective at that point.
    pub terms: ObjectiveTerms,
    /// `1 - |previous - current| / current`.
    pub delta: f64,
}

/// Result of a solver run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdReport {
    /// Why the run stopped.
    pub outcome: SgdOutcome,
    /// Steps taken.
    pub iterations: u64,
    /// Objective of the final, projected model.
    pub terms: ObjectiveTerms,
    /// Every periodic check, in order.
    pub checks: Vec<ConvergenceCheck>,
}

/// The legacy SGD optimizer.
#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    max_policy: MaxPolicy,
}

impl Sgd {
    /// Create a solver.
    #[must_use]
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            max_policy: MaxPolicy::default(),
        }
    }

    /// Policy used to report the regularizer in objective checks.
    #[must_use]
    pub const fn with_max_policy(mut self, policy: MaxPolicy) -> Self {
        self.max_policy = policy;
        self
    }

    /// Solver configuration.
    #[must_use]
    pub const fn config(&self) -> &SgdConfig {
        &self.config
    }

    /// Train `model` in place on the examples of `index`.
    ///
    /// Pruning state of `index` and the model's weight history are reset on
    /// return, since the weights moved without recorded snapshots.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, `index` is stale, or a
    /// record does not fit the model.
    #[allow(clippy::cast_precision_loss)]
    pub fn run(
        &self,
        index: &mut ExampleIndex,
        cache: &FeatureVectorCache,
        model: &mut Model,
        cancel: &CancellationToken,
    ) -> Result<SgdReport> {
        let cfg = &self.config;
        cfg.validate()?;
        index.check_fresh(cache)?;
        ObjectiveEngine::validate_cache(cache, model)?;

        let engine = ObjectiveEngine::new(EngineConfig::default().with_max_policy(self.max_policy));
        let num = index.len();
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let mut hot = HotSet::new(num, cfg);
        let mut order: Vec<usize> = (0..num).collect();
        let mut checks = Vec::new();
        let mut prev_total: Option<f64> = None;
        let mut hits = 0u32;
        let mut t = 0u64;
        let mut outcome = SgdOutcome::Exhausted;

        info!("SGD over {} examples, at most {} steps", num, cfg.max_iter);

        'epochs: while t < cfg.max_iter && num > 0 {
            if cancel.is_cancelled() {
                outcome = SgdOutcome::Interrupted;
                break;
            }
            order.shuffle(&mut rng);
            let cnum = hot.count() as f64;

            for &i in &order {
                if !hot.contains(i) {
                    hot.skip(i);
                    continue;
                }

                let horizon = (cfg.max_iter as f64 / 2.0).min(t as f64 + 10_000.0);
                let rate_x = cnum * model.c() / horizon;
                let rate_r = 1.0 / horizon;

                let eval = evaluate(cache, model, &index.as_slice()[i]);
                let records = cache.records();
                match eval.violation {
                    Some(Violation::Belief { arg, belief }) => {
                        let (a, b) = (&records[arg], &records[belief]);
                        model.step(cache.features(b), cache.block_labels(b), rate_x);
                        model.step(cache.features(a), cache.block_labels(a), -rate_x);
                    }
                    Some(Violation::Hinge { arg, y, .. }) => {
                        let a = &records[arg];
                        let j = if y > 0.0 { model.j() } else { 1.0 };
                        model.step(cache.features(a), cache.block_labels(a), y * j * rate_x);
                    }
                    None => {}
                }

                hot.visit(i, eval.violation.is_some(), &mut rng);

                t += 1;
                if t % cfg.reg_freq == 0 {
                    model.project();
                    model.decay(rate_r, cfg.reg_freq);
                }

                if t % cfg.check_freq == 0 {
                    let terms = engine.obj_val(index, cache, model)?;
                    let total = terms.total();
                    let delta = prev_total.map_or(f64::NEG_INFINITY, |prev| {
                        let change = (prev - total).abs();
                        if change == 0.0 {
                            1.0
                        } else {
                            1.0 - change / total
                        }
                    });
                    prev_total = Some(total);
                    checks.push(ConvergenceCheck {
                        iteration: t,
                        terms,
                        delta,
                    });
                    info!(
                        "{t} steps: obj = {total:.6} (bg {:.6}, fg {:.6}, reg {:.6}), delta = {delta:.6}",
                        terms.bg_loss, terms.fg_loss, terms.reg
                    );

                    if t >= cfg.min_iter && delta >= cfg.delta_stop {
                        hits += 1;
                        if hits > cfg.stop_count {
                            outcome = SgdOutcome::Converged;
                            break 'epochs;
                        }
                    } else {
                        hits = 0;
                    }
                }

                if t >= cfg.max_iter {
                    break 'epochs;
                }
            }
        }

        model.project();
        index.reset_pruning();
        model.history_mut().reset();

        let terms = engine.obj_val(index, cache, model)?;
        match outcome {
            SgdOutcome::Interrupted => warn!("SGD interrupted after {t} steps"),
            _ => info!("SGD finished after {t} steps: {outcome:?}, obj = {:.6}", terms.total()),
        }

        Ok(SgdReport {
            outcome,
            iterations: t,
            terms,
            checks,
        })
    }
}
