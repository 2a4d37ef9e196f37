//! Host-facing training session.
//!
//! A [`Session`] owns one cache, the example index built from it, the current
//! model and the objective engine. Every host operation is available both as
//! a method and as a [`Command`] routed through [`Session::dispatch`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{FeatureVectorCache, FvInfo, NewFeatureVector};
use crate::config::{CacheConfig, EngineConfig, SgdConfig};
use crate::error::{CacheError, Result};
use crate::example::ExampleIndex;
use crate::fv::FvKey;
use crate::model::{Model, ModelParams};
use crate::objective::{ObjectiveEngine, ObjectiveTerms};
use crate::sgd::{CancellationToken, Sgd, SgdReport};

/// Owned feature vector, for commands that outlive the caller's buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVectorInput {
    /// (data id, x, y, scale).
    pub key: FvKey,
    /// Blocks touched.
    #[serde(default)]
    pub block_labels: Vec<i32>,
    /// Concatenated block runs.
    #[serde(default)]
    pub feat: Vec<f32>,
    /// Belief flag.
    #[serde(default)]
    pub is_belief: bool,
    /// Mined flag.
    #[serde(default)]
    pub is_mined: bool,
    /// Structured loss.
    #[serde(default)]
    pub loss: f64,
}

impl FeatureVectorInput {
    /// Borrow as an insertion request.
    #[must_use]
    pub fn as_new(&self) -> NewFeatureVector<'_> {
        NewFeatureVector::new(self.key, &self.block_labels, &self.feat)
            .with_belief(self.is_belief)
            .with_mined(self.is_mined)
            .with_loss(self.loss)
    }
}

/// A host command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Replace the cache with an empty one of the given capacity.
    Init(CacheConfig),
    /// Append a feature vector.
    Add(FeatureVectorInput),
    /// Release the cache.
    Free,
    /// Keep only the listed records.
    Shrink(Vec<usize>),
    /// Sort, deduplicate and index the cache.
    ExPrepare,
    /// Drop the example index.
    ExFree,
    /// Install model parameters.
    SetModel(ModelParams),
    /// Read back model parameters.
    GetModel,
    /// Objective at the current weights.
    ObjVal,
    /// Objective and gradient at `w`.
    Gradient {
        /// Flat weight vector.
        w: Vec<f64>,
        /// Worker threads.
        num_threads: usize,
    },
    /// Current cache byte size.
    ByteSize,
    /// Write the cache to a file.
    Save(PathBuf),
    /// Replace the cache with one read from a file.
    Load(PathBuf),
    /// Score every record and report it.
    Info,
    /// Run the legacy SGD solver.
    Sgd {
        /// Solver configuration.
        config: SgdConfig,
        /// Stop flag.
        cancel: CancellationToken,
    },
}

/// Result of a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Response {
    /// The command has no result value.
    Done,
    /// Cache byte size.
    ByteSize {
        /// Bytes.
        bytes: u64,
    },
    /// Number of examples in the new index.
    Examples {
        /// Example count.
        count: usize,
    },
    /// Model parameters.
    Model(ModelParams),
    /// Objective parts.
    Objective(ObjectiveTerms),
    /// Objective value and gradient.
    Gradient {
        /// Objective value.
        value: f64,
        /// Flat gradient.
        grad: Vec<f64>,
    },
    /// Per-record report.
    Info {
        /// One row per record.
        rows: Vec<FvInfo>,
    },
    /// Solver report.
    Sgd(SgdReport),
}

/// Cache, index, model and engine of one training run.
#[derive(Debug)]
pub struct Session {
    cache: FeatureVectorCache,
    index: Option<ExampleIndex>,
    model: Option<Model>,
    engine: ObjectiveEngine,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Session {
    /// Session with an empty, unallocated cache.
    #[must_use]
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            cache: FeatureVectorCache::empty(),
            index: None,
            model: None,
            engine: ObjectiveEngine::new(engine),
        }
    }

    /// Execute one command.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation.
    pub fn dispatch(&mut self, command: Command) -> Result<Response> {
        Ok(match command {
            Command::Init(config) => {
                self.init(config)?;
                Response::Done
            }
            Command::Add(fv) => Response::ByteSize {
                bytes: self.add(&fv.as_new())?,
            },
            Command::Free => {
                self.free()?;
                Response::Done
            }
            Command::Shrink(keep) => {
                self.shrink(&keep)?;
                Response::Done
            }
            Command::ExPrepare => Response::Examples {
                count: self.ex_prepare(),
            },
            Command::ExFree => {
                self.ex_free();
                Response::Done
            }
            Command::SetModel(params) => {
                self.set_model(params)?;
                Response::Done
            }
            Command::GetModel => Response::Model(self.get_model()?),
            Command::ObjVal => Response::Objective(self.obj_val()?),
            Command::Gradient { w, num_threads } => {
                let (value, grad) = self.gradient(&w, num_threads)?;
                Response::Gradient { value, grad }
            }
            Command::ByteSize => Response::ByteSize {
                bytes: self.byte_size(),
            },
            Command::Save(path) => {
                self.save(path)?;
                Response::Done
            }
            Command::Load(path) => {
                self.load(path)?;
                Response::Done
            }
            Command::Info => Response::Info { rows: self.info()? },
            Command::Sgd { config, cancel } => Response::Sgd(self.sgd(config, &cancel)?),
        })
    }

    /// Replace the cache with a freshly allocated one.
    ///
    /// # Errors
    ///
    /// Returns error if the old cache fails its release check or the new
    /// pools cannot be allocated.
    pub fn init(&mut self, config: CacheConfig) -> Result<()> {
        self.release_cache()?;
        self.cache = FeatureVectorCache::new(config)?;
        Ok(())
    }

    /// Append a feature vector; returns the byte size afterwards.
    ///
    /// # Errors
    ///
    /// See [`FeatureVectorCache::add`].
    pub fn add(&mut self, fv: &NewFeatureVector<'_>) -> Result<u64> {
        self.cache.add(fv)
    }

    /// Release the cache, the index and the model.
    ///
    /// # Errors
    ///
    /// See [`FeatureVectorCache::free`].
    pub fn free(&mut self) -> Result<()> {
        self.model = None;
        self.release_cache()
    }

    fn release_cache(&mut self) -> Result<()> {
        self.index = None;
        self.cache.free()
    }

    /// Keep only the listed records.
    ///
    /// # Errors
    ///
    /// See [`FeatureVectorCache::shrink`].
    pub fn shrink(&mut self, keep: &[usize]) -> Result<()> {
        self.cache.shrink(keep)
    }

    /// Rebuild the example index; returns the number of examples.
    pub fn ex_prepare(&mut self) -> usize {
        let index = self.cache.build_index();
        let count = index.len();
        self.index = Some(index);
        count
    }

    /// Drop the example index.
    pub fn ex_free(&mut self) {
        self.index = None;
    }

    /// Install a model; pruning state starts over.
    ///
    /// # Errors
    ///
    /// Returns error if the parameters are inconsistent.
    pub fn set_model(&mut self, params: ModelParams) -> Result<()> {
        let model = Model::new(params, self.engine.config().hist_size)?;
        info!(
            "Model: {} blocks, {} parameters, C = {}, {:?} regularization",
            model.num_blocks(),
            model.dim(),
            model.c(),
            model.regularizer()
        );
        self.model = Some(model);
        if let Some(index) = &mut self.index {
            index.reset_pruning();
        }
        Ok(())
    }

    /// Current model parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ModelNotSet`] without a model.
    pub fn get_model(&self) -> Result<ModelParams> {
        self.model.as_ref().map(Model::params).ok_or(CacheError::ModelNotSet)
    }

    /// Objective at the current weights.
    ///
    /// # Errors
    ///
    /// Returns error if the index or model is missing or stale.
    pub fn obj_val(&self) -> Result<ObjectiveTerms> {
        let index = self.index.as_ref().ok_or(CacheError::IndexNotBuilt)?;
        let model = self.model.as_ref().ok_or(CacheError::ModelNotSet)?;
        self.engine.obj_val(index, &self.cache, model)
    }

    /// Objective and gradient at `w`, using `num_threads` workers.
    ///
    /// # Errors
    ///
    /// Returns error if the index or model is missing or stale, or `w` has
    /// the wrong length.
    pub fn gradient(&mut self, w: &[f64], num_threads: usize) -> Result<(f64, Vec<f64>)> {
        let index = self.index.as_mut().ok_or(CacheError::IndexNotBuilt)?;
        let model = self.model.as_mut().ok_or(CacheError::ModelNotSet)?;
        self.engine.set_num_threads(num_threads);
        self.engine.gradient(index, &self.cache, model, w)
    }

    /// Cache byte size.
    #[must_use]
    pub const fn byte_size(&self) -> u64 {
        self.cache.byte_size()
    }

    /// Write the cache to `path`.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.cache.save_to_file(path)
    }

    /// Replace the cache with the contents of `path`.
    ///
    /// The current capacity is kept unless the file needs more.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is malformed; the current
    /// cache is kept in that case.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let config = self.cache.config().clone();
        let loaded = FeatureVectorCache::load_from_file(path, config)?;
        self.release_cache()?;
        self.cache = loaded;
        Ok(())
    }

    /// Score every record under the current model.
    ///
    /// # Errors
    ///
    /// Returns error if the index or model is missing or stale.
    pub fn info(&mut self) -> Result<Vec<FvInfo>> {
        let index = self.index.as_ref().ok_or(CacheError::IndexNotBuilt)?;
        let model = self.model.as_ref().ok_or(CacheError::ModelNotSet)?;
        self.cache.info(index, model)
    }

    /// Train the current model with the legacy solver.
    ///
    /// # Errors
    ///
    /// Returns error if the index or model is missing or stale, or the
    /// configuration is invalid.
    pub fn sgd(&mut self, config: SgdConfig, cancel: &CancellationToken) -> Result<SgdReport> {
        let index = self.index.as_mut().ok_or(CacheError::IndexNotBuilt)?;
        let model = self.model.as_mut().ok_or(CacheError::ModelNotSet)?;
        Sgd::new(config)
            .with_max_policy(self.engine.config().max_policy)
            .run(index, &self.cache, model, cancel)
    }

    /// The cache.
    #[must_use]
    pub const fn cache(&self) -> &FeatureVectorCache {
        &self.cache
    }

    /// The example index, if built.
    #[must_use]
    pub const fn index(&self) -> Option<&ExampleIndex> {
        self.index.as_ref()
    }

    /// The model, if set.
    #[must_use]
    pub const fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    /// The objective engine.
    pub fn engine_mut(&mut self) -> &mut ObjectiveEngine {
        &mut self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(key: FvKey, feat: &[f32], belief: bool, loss: f64) -> FeatureVectorInput {
        FeatureVectorInput {
            key,
            block_labels: vec![0],
            feat: feat.to_vec(),
            is_belief: belief,
            is_mined: false,
            loss,
        }
    }

    #[test]
    fn test_dispatch_flow() {
        let mut session = Session::default();
        session
            .dispatch(Command::Init(CacheConfig::default().with_max_num_fv(8)))
            .unwrap();
        let r = session
            .dispatch(Command::Add(input([1, 0, 0, 0], &[1.0], true, 0.0)))
            .unwrap();
        assert_eq!(r, Response::ByteSize { bytes: 4 });
        session
            .dispatch(Command::Add(input([1, 1, 0, 0], &[2.0], false, 1.0)))
            .unwrap();

        assert_eq!(
            session.dispatch(Command::ExPrepare).unwrap(),
            Response::Examples { count: 1 }
        );
        session
            .dispatch(Command::SetModel(ModelParams::new(vec![vec![0.0]], 1.0)))
            .unwrap();

        let Response::Gradient { value, grad } = session
            .dispatch(Command::Gradient {
                w: vec![0.0],
                num_threads: 2,
            })
            .unwrap()
        else {
            panic!("expected gradient");
        };
        assert!((value - 1.0).abs() < 1e-12);
        assert!((grad[0] - 1.0).abs() < 1e-12);

        let Response::Objective(terms) = session.dispatch(Command::ObjVal).unwrap() else {
            panic!("expected objective");
        };
        assert!((terms.fg_loss - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_preconditions_are_errors() {
        let mut session = Session::default();
        assert!(matches!(session.obj_val(), Err(CacheError::IndexNotBuilt)));
        session.ex_prepare();
        assert!(matches!(session.obj_val(), Err(CacheError::ModelNotSet)));
        assert!(matches!(session.get_model(), Err(CacheError::ModelNotSet)));
    }

    #[test]
    fn test_add_after_prepare_makes_index_stale() {
        let mut session = Session::default();
        session.init(CacheConfig::default().with_max_num_fv(4)).unwrap();
        session.add(&input([1, 0, 0, 0], &[1.0], true, 0.0).as_new()).unwrap();
        session.ex_prepare();
        session
            .set_model(ModelParams::new(vec![vec![1.0]], 1.0))
            .unwrap();
        session.add(&input([2, 0, 0, 0], &[1.0], true, 0.0).as_new()).unwrap();
        assert!(matches!(session.obj_val(), Err(CacheError::StaleIndex { .. })));
    }

    #[test]
    fn test_set_model_resets_pruning() {
        let mut session = Session::default();
        session.init(CacheConfig::default().with_max_num_fv(4)).unwrap();
        session.add(&input([1, 0, 0, 0], &[1.0], true, 0.0).as_new()).unwrap();
        session.add(&input([1, 1, 0, 0], &[-1.0], false, 0.0).as_new()).unwrap();
        session.ex_prepare();
        session
            .set_model(ModelParams::new(vec![vec![1.0]], 1.0))
            .unwrap();
        session.gradient(&[1.0], 1).unwrap();
        assert!(session.index().unwrap().get(0).unwrap().margin_bound > 0.0);

        session
            .set_model(ModelParams::new(vec![vec![1.0]], 1.0))
            .unwrap();
        let ex = session.index().unwrap().get(0).unwrap();
        assert_eq!(ex.margin_bound, crate::example::UNBOUNDED_MARGIN);
        assert_eq!(ex.hist, 0);
    }

    #[test]
    fn test_free_drops_model_but_init_keeps_it() {
        let mut session = Session::default();
        session.init(CacheConfig::default().with_max_num_fv(4)).unwrap();
        session
            .set_model(ModelParams::new(vec![vec![1.0]], 1.0))
            .unwrap();

        session.init(CacheConfig::default().with_max_num_fv(2)).unwrap();
        assert!(session.model().is_some());

        session.add(&input([1, 0, 0, 0], &[1.0], true, 0.0).as_new()).unwrap();
        session.ex_prepare();
        session.dispatch(Command::Free).unwrap();
        assert!(session.model().is_none());
        assert!(session.index().is_none());
        assert_eq!(session.byte_size(), 0);
        assert!(matches!(session.get_model(), Err(CacheError::ModelNotSet)));
    }

    #[test]
    fn test_get_model_roundtrip() {
        let mut session = Session::default();
        let params = ModelParams::new(vec![vec![1.0, 2.0]], 0.5).with_j(2.0);
        session.set_model(params.clone()).unwrap();
        let back = session.get_model().unwrap();
        assert_eq!(back.w, params.w);
        assert_eq!(back.j, 2.0);
        assert_eq!(back.c, 0.5);
    }
}
