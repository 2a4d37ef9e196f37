//! Configuration types for the cache, the objective engine and the SGD solver.
//!
//! - [`CacheConfig`]: chunk pool capacity and chunk widths
//! - [`EngineConfig`]: threading, margin-bound pruning, max-regularizer policy
//! - [`SgdConfig`]: stopping criteria and hot-set parameters of the legacy solver

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Default number of weight snapshots kept for margin-bound pruning.
pub const DEFAULT_HIST_SIZE: usize = 50;

/// Default sharpness of the softmax max-regularizer.
pub const DEFAULT_SOFTMAX_BETA: f64 = 1000.0;

/// Capacity of the feature-vector cache.
///
/// Both pools are allocated and zero-filled up front, so the feature pool
/// commits `max_num_fv * max_fv_dim * 4` bytes at construction (16 MiB for
/// the default). Size it to the workload.
///
/// # Example
///
/// ```
/// use fv_cache_rs::CacheConfig;
///
/// let config = CacheConfig::default()
///     .with_max_num_fv(10_000)
///     .with_max_fv_dim(512)
///     .with_max_num_blocks(8);
/// assert_eq!(config.max_num_fv, 10_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of non-zero feature vectors held at once.
    pub max_num_fv: usize,

    /// Maximum feature vector length (floats per feature chunk).
    pub max_fv_dim: usize,

    /// Maximum number of blocks a feature vector may touch.
    pub max_num_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_num_fv: 4096,
            max_fv_dim: 1024,
            max_num_blocks: 32,
        }
    }
}

impl CacheConfig {
    /// Set the maximum number of feature vectors.
    #[must_use]
    pub const fn with_max_num_fv(mut self, n: usize) -> Self {
        self.max_num_fv = n;
        self
    }

    /// Set the maximum feature vector length.
    #[must_use]
    pub const fn with_max_fv_dim(mut self, dim: usize) -> Self {
        self.max_fv_dim = dim;
        self
    }

    /// Set the maximum number of blocks per feature vector.
    #[must_use]
    pub const fn with_max_num_blocks(mut self, blocks: usize) -> Self {
        self.max_num_blocks = blocks;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a chunk width is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_fv_dim == 0 || self.max_num_blocks == 0 {
            return Err(CacheError::InvalidConfig(
                "max_fv_dim and max_num_blocks must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Approximate size of the feature pool in bytes.
    #[must_use]
    pub const fn feature_pool_bytes(&self) -> usize {
        self.max_num_fv * self.max_fv_dim * std::mem::size_of::<f32>()
    }
}

/// How the max-over-components regularizer is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum MaxPolicy {
    /// Regularize only the component with the largest half-squared norm.
    /// The first component wins ties.
    Hard,
    /// Log-sum-exp smoothing of the max with sharpness `beta`; the gradient
    /// is spread over components by their softmax responsibility.
    Softmax {
        /// Sharpness of the smoothing.
        beta: f64,
    },
}

impl Default for MaxPolicy {
    fn default() -> Self {
        Self::Softmax {
            beta: DEFAULT_SOFTMAX_BETA,
        }
    }
}

/// Configuration of the objective/gradient engine.
///
/// # Example
///
/// ```
/// use fv_cache_rs::{EngineConfig, MaxPolicy};
///
/// let config = EngineConfig::default()
///     .with_num_threads(4)
///     .with_pruning(false)
///     .with_max_policy(MaxPolicy::Hard);
/// assert_eq!(config.num_threads, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads for the gradient pass (1 = sequential).
    pub num_threads: usize,

    /// Whether margin-bound pruning may skip examples.
    pub pruning: bool,

    /// Policy for the max-component regularizer.
    pub max_policy: MaxPolicy,

    /// Number of weight snapshots kept for pruning.
    pub hist_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            pruning: true,
            max_policy: MaxPolicy::default(),
            hist_size: DEFAULT_HIST_SIZE,
        }
    }
}

impl EngineConfig {
    /// Set the number of worker threads (clamped to at least one).
    #[must_use]
    pub const fn with_num_threads(mut self, threads: usize) -> Self {
        self.num_threads = if threads == 0 { 1 } else { threads };
        self
    }

    /// Enable or disable margin-bound pruning.
    #[must_use]
    pub const fn with_pruning(mut self, pruning: bool) -> Self {
        self.pruning = pruning;
        self
    }

    /// Set the max-regularizer policy.
    #[must_use]
    pub const fn with_max_policy(mut self, policy: MaxPolicy) -> Self {
        self.max_policy = policy;
        self
    }

    /// Set the number of weight snapshots kept for pruning.
    #[must_use]
    pub const fn with_hist_size(mut self, size: usize) -> Self {
        self.hist_size = size;
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
}

/// Configuration of the legacy stochastic sub-gradient solver.
///
/// Defaults reproduce the reference stopping behavior: at most ten million
/// steps, no termination before five million, and convergence once the
/// relative objective change stays below 0.05% for more than five
/// consecutive checks.
///
/// # Example
///
/// ```
/// use fv_cache_rs::SgdConfig;
///
/// let config = SgdConfig::default()
///     .with_max_iter(10_000)
///     .with_min_iter(1_000)
///     .with_check_freq(500)
///     .with_seed(7);
/// assert_eq!(config.max_iter, 10_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Maximum number of update steps.
    pub max_iter: u64,
    /// Minimum number of steps before convergence may be declared.
    pub min_iter: u64,
    /// Convergence threshold on `1 - |delta loss| / loss`.
    pub delta_stop: f64,
    /// Consecutive threshold hits required (strictly more than this many).
    pub stop_count: u32,
    /// Wait values at or below this are in the hot set.
    pub in_cache: i32,
    /// Minimum wait for an example evicted from the hot set.
    pub min_wait: i32,
    /// Random jitter added to evictions, uniform over `[0, max_rnd_wait)`.
    pub max_rnd_wait: i32,
    /// Steps between lazy regularization updates.
    pub reg_freq: u64,
    /// Steps between full objective evaluations.
    pub check_freq: u64,
    /// Seed of the permutation/jitter generator.
    pub seed: u64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            max_iter: 10_000_000,
            min_iter: 5_000_000,
            delta_stop: 0.9995,
            stop_count: 5,
            in_cache: 25,
            min_wait: 50,
            max_rnd_wait: 50,
            reg_freq: 20,
            check_freq: 100_000,
            seed: 3,
        }
    }
}

impl SgdConfig {
    /// Set the maximum number of steps.
    #[must_use]
    pub const fn with_max_iter(mut self, iters: u64) -> Self {
        self.max_iter = iters;
        self
    }

    /// Set the minimum number of steps before convergence.
    #[must_use]
    pub const fn with_min_iter(mut self, iters: u64) -> Self {
        self.min_iter = iters;
        self
    }

    /// Set the steps between full objective checks.
    #[must_use]
    pub const fn with_check_freq(mut self, freq: u64) -> Self {
        self.check_freq = freq;
        self
    }

    /// Set the steps between lazy regularization updates.
    #[must_use]
    pub const fn with_reg_freq(mut self, freq: u64) -> Self {
        self.reg_freq = freq;
        self
    }

    /// Set the random seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the convergence threshold.
    #[must_use]
    pub const fn with_delta_stop(mut self, delta: f64) -> Self {
        self.delta_stop = delta;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a frequency is zero or wait parameters are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.reg_freq == 0 || self.check_freq == 0 {
            return Err(CacheError::InvalidConfig(
                "reg_freq and check_freq must be positive".into(),
            ));
        }
        if self.max_rnd_wait <= 0 || self.min_wait <= self.in_cache {
            return Err(CacheError::InvalidConfig(
                "min_wait must exceed in_cache and max_rnd_wait must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path)
    }
}

pub(crate) fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::default()
            .with_max_num_fv(2)
            .with_max_fv_dim(3)
            .with_max_num_blocks(1);
        assert_eq!(config.feature_pool_bytes(), 24);
        assert!(config.validate().is_ok());
        assert!(config.with_max_fv_dim(0).validate().is_err());
    }

    #[test]
    fn test_default_cache_config_is_modest() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feature_pool_bytes(), 16 << 20);
    }

    #[test]
    fn test_engine_threads_clamped() {
        let config = EngineConfig::default().with_num_threads(0);
        assert_eq!(config.num_threads, 1);
    }

    #[test]
    fn test_max_policy_json() {
        let json = serde_json::to_string(&MaxPolicy::Hard).unwrap();
        assert_eq!(json, r#"{"kind":"hard"}"#);
        let parsed: MaxPolicy = serde_json::from_str(r#"{"kind":"softmax","beta":10.0}"#).unwrap();
        assert_eq!(parsed, MaxPolicy::Softmax { beta: 10.0 });
    }

    #[test]
    fn test_sgd_config_validation() {
        assert!(SgdConfig::default().validate().is_ok());
        assert!(SgdConfig::default().with_reg_freq(0).validate().is_err());
    }
}
