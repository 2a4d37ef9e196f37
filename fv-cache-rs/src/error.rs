//! Error types for the feature-vector cache and objective engine.

use thiserror::Error;

/// Result type alias for cache, model and engine operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Which chunk pool ran out of free chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Pool holding feature buffers.
    Features,
    /// Pool holding block-label lists.
    BlockLabels,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Features => f.write_str("feature"),
            Self::BlockLabels => f.write_str("block-label"),
        }
    }
}

/// Errors that can occur while filling the cache or evaluating the objective.
///
/// Capacity exhaustion is an expected outcome that callers recover from by
/// shrinking or re-initializing the cache. Precondition failures (stale index,
/// missing model) are surfaced as typed errors rather than aborting.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A chunk pool has no free chunks left.
    #[error("{pool} pool exhausted: no free chunks")]
    CapacityExceeded {
        /// The pool that was exhausted.
        pool: PoolKind,
    },

    /// The backing allocation of a pool could not be created.
    #[error("allocation of {chunks} chunks x {chunk_size} elements failed")]
    Allocation {
        /// Requested number of chunks.
        chunks: usize,
        /// Requested chunk size in elements.
        chunk_size: usize,
    },

    /// Dimension mismatch between an input and what the cache or model expects.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// A block label refers to a block the model does not have, or a feature
    /// run overruns the feature buffer.
    #[error("invalid block {block} (model has {num_blocks} blocks)")]
    InvalidBlock {
        /// Offending block label.
        block: i64,
        /// Number of blocks in the model.
        num_blocks: usize,
    },

    /// Shrink indices were not strictly increasing.
    #[error("shrink indices must be strictly increasing (index {position})")]
    UnsortedIndices {
        /// Position in the index list where ordering broke.
        position: usize,
    },

    /// The example index was built from another cache or an older generation.
    #[error("example index is stale (built at generation {index}, cache is at {cache})")]
    StaleIndex {
        /// Generation the index was built from.
        index: u64,
        /// Current cache generation.
        cache: u64,
    },

    /// An operation needing the example index ran before it was built.
    #[error("example index has not been built")]
    IndexNotBuilt,

    /// An operation needing the model ran before it was set.
    #[error("model has not been set")]
    ModelNotSet,

    /// Invalid configuration or model parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal accounting no longer matches the stored records.
    #[error("invariant broken: {0}")]
    InvariantBroken(String),

    /// Malformed cache file.
    #[error("malformed cache file: {0}")]
    Format(String),

    /// I/O failure during save or load.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for configs and model parameters.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether the error is a recoverable capacity condition.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
