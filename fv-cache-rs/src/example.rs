//! Example index over a sorted, deduplicated cache.
//!
//! An [`Example`] is a half-open range of cache positions whose records share
//! one example key, plus the state margin-bound pruning keeps per example.
//! The index is a read-only view of the one cache it was built from: any
//! mutation of that cache bumps its generation and the index must be rebuilt
//! with
//! [`FeatureVectorCache::build_index`](crate::cache::FeatureVectorCache::build_index).

use std::ops::Range;

use crate::cache::FeatureVectorCache;
use crate::error::{CacheError, Result};
use crate::fv::FeatureVector;

/// Margin bound of an example that has never been evaluated; never prunes.
pub const UNBOUNDED_MARGIN: f64 = -1.0;

/// All candidate outputs of one supervised instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// First cache position of the example.
    pub begin: usize,
    /// One past the last cache position.
    pub end: usize,
    /// Cache position of the belief member, if any.
    pub belief: Option<usize>,
    /// Norm of the belief member (0 without one).
    pub belief_norm: f64,
    /// Largest norm among the other members.
    pub max_nonbelief_norm: f64,
    /// Lower bound on the score gap protecting the current optimum, in
    /// weight-change units. Non-positive values never prune.
    pub margin_bound: f64,
    /// Gradient passes since the last full evaluation.
    pub hist: usize,
    /// Objective contribution from the last full evaluation.
    pub contribution: f64,
}

impl Example {
    pub(crate) fn from_members(begin: usize, members: &[FeatureVector]) -> Self {
        let mut belief = None;
        let mut belief_norm = 0.0;
        let mut max_nonbelief_norm: f64 = 0.0;
        for (offset, f) in members.iter().enumerate() {
            if f.is_belief && belief.is_none() {
                belief = Some(begin + offset);
                belief_norm = f.norm;
            } else {
                max_nonbelief_norm = max_nonbelief_norm.max(f.norm);
            }
        }
        Self {
            begin,
            end: begin + members.len(),
            belief,
            belief_norm,
            max_nonbelief_norm,
            margin_bound: UNBOUNDED_MARGIN,
            hist: 0,
            contribution: 0.0,
        }
    }

    /// Cache positions covered by the example.
    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.begin..self.end
    }

    /// Number of candidate outputs.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.begin
    }

    /// Whether the example has no members (never true for a built index).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.begin
    }

    /// Forget pruning state so the next pass evaluates the example fully.
    pub fn reset_pruning(&mut self) {
        self.margin_bound = UNBOUNDED_MARGIN;
        self.hist = 0;
        self.contribution = 0.0;
    }
}

/// Examples of one cache generation, in cache order.
#[derive(Debug, Clone, Default)]
pub struct ExampleIndex {
    examples: Vec<Example>,
    cache_id: u64,
    generation: u64,
}

impl ExampleIndex {
    pub(crate) fn new(examples: Vec<Example>, cache_id: u64, generation: u64) -> Self {
        Self {
            examples,
            cache_id,
            generation,
        }
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the index holds no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Iterate over examples.
    pub fn iter(&self) -> std::slice::Iter<'_, Example> {
        self.examples.iter()
    }

    /// Example by position.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<&Example> {
        self.examples.get(i)
    }

    /// All examples as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Example] {
        &self.examples
    }

    pub(crate) fn examples_mut(&mut self) -> &mut [Example] {
        &mut self.examples
    }

    /// Member records of `example`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::StaleIndex`] if the index does not describe
    /// `cache`, or [`CacheError::InvariantBroken`] if `example` lies outside
    /// the cache.
    pub fn members<'c>(
        &self,
        cache: &'c FeatureVectorCache,
        example: &Example,
    ) -> Result<&'c [FeatureVector]> {
        self.check_fresh(cache)?;
        cache.records().get(example.range()).ok_or_else(|| {
            CacheError::InvariantBroken(format!(
                "example range {:?} outside a cache of {} records",
                example.range(),
                cache.len()
            ))
        })
    }

    /// Identity of the cache the index was built from.
    #[must_use]
    pub const fn cache_id(&self) -> u64 {
        self.cache_id
    }

    /// Cache generation the index was built from.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Total number of member records across all examples.
    #[must_use]
    pub fn num_members(&self) -> usize {
        self.examples.iter().map(Example::len).sum()
    }

    /// Fail unless the index still describes `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::StaleIndex`] if the index was built from another
    /// cache or the cache was mutated after the index was built.
    pub fn check_fresh(&self, cache: &FeatureVectorCache) -> Result<()> {
        if self.cache_id == cache.id() && self.generation == cache.generation() {
            Ok(())
        } else {
            Err(CacheError::StaleIndex {
                index: self.generation,
                cache: cache.generation(),
            })
        }
    }

    /// Reset the pruning state of every example.
    pub fn reset_pruning(&mut self) {
        self.examples.iter_mut().for_each(Example::reset_pruning);
    }
}

impl<'a> IntoIterator for &'a ExampleIndex {
    type Item = &'a Example;
    type IntoIter = std::slice::Iter<'a, Example>;

    fn into_iter(self) -> Self::IntoIter {
        self.examples.iter()
    }
}
