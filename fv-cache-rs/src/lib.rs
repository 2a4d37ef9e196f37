//! # fv-cache-rs
//!
//! Feature-vector cache and objective engine for training weakly-supervised
//! latent structural SVMs over block-sparse features.
//!
//! A detector produces many candidate outputs per training example, each a
//! block-sparse feature vector. This crate stores them in fixed-chunk pools,
//! deduplicates and groups them into examples, and evaluates the training
//! objective and its gradient for an external optimizer, or trains the model
//! itself with a legacy stochastic sub-gradient solver.
//!
//! ## Key Properties
//!
//! - **Bounded memory**: every vector borrows one chunk from each of two
//!   pools sized once; eviction never fragments the heap
//! - **Exact pruning**: examples whose margin provably survives the weight
//!   change since their last evaluation are skipped without changing results
//! - **Deterministic reduction**: per-thread partial gradients are summed in
//!   partition order
//!
//! ## Quick Start
//!
//! ```
//! use fv_cache_rs::prelude::*;
//!
//! let mut session = Session::default();
//! session.init(CacheConfig::default().with_max_num_fv(1_000))?;
//!
//! session.add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0, 0.0]).with_belief(true))?;
//! session.add(&NewFeatureVector::new([1, 4, 2, 0], &[0], &[0.0, 1.0]).with_loss(1.0))?;
//! session.ex_prepare();
//!
//! session.set_model(ModelParams::new(vec![vec![0.0, 0.0]], 1.0))?;
//! let (value, grad) = session.gradient(&[0.0, 0.0], 1)?;
//! assert!((value - 1.0).abs() < 1e-12);
//! assert_eq!(grad, vec![-1.0, 1.0]);
//! # Ok::<(), fv_cache_rs::CacheError>(())
//! ```
//!
//! ## Modules
//!
//! - [`pool`]: fixed-chunk allocator
//! - [`fv`]: feature vector records and ordering
//! - [`cache`]: insertion, deduplication, shrinking, scoring reports
//! - [`persist`]: binary save/load
//! - [`example`]: example ranges and pruning state
//! - [`model`]: block-sparse weights, projection, regularization
//! - [`objective`]: objective value and (parallel) gradient
//! - [`sgd`]: legacy stochastic sub-gradient solver
//! - [`session`]: host command surface

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod error;
pub mod example;
pub mod fv;
pub mod model;
pub mod objective;
pub mod persist;
pub mod pool;
pub mod session;
pub mod sgd;

pub use cache::{FeatureVectorCache, FvInfo, NewFeatureVector};
pub use config::{CacheConfig, EngineConfig, MaxPolicy, SgdConfig};
pub use error::{CacheError, PoolKind, Result};
pub use example::{Example, ExampleIndex};
pub use fv::{FeatureVector, FvKey};
pub use model::{Model, ModelParams, Regularizer, WeightHistory};
pub use objective::{ObjectiveEngine, ObjectiveTerms};
pub use session::{Command, FeatureVectorInput, Response, Session};
pub use sgd::{CancellationToken, Sgd, SgdOutcome, SgdReport};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cache::{FeatureVectorCache, NewFeatureVector};
    pub use crate::config::{CacheConfig, EngineConfig, MaxPolicy, SgdConfig};
    pub use crate::error::{CacheError, Result};
    pub use crate::model::{Model, ModelParams};
    pub use crate::objective::{ObjectiveEngine, ObjectiveTerms};
    pub use crate::session::Session;
    pub use crate::sgd::{CancellationToken, Sgd, SgdOutcome};
}
