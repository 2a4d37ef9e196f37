//! CLI entry point for fv-cache.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fv_cache_rs::{CancellationToken, EngineConfig, ModelParams, Session, SgdConfig};

#[derive(Parser)]
#[command(name = "fv-cache")]
#[command(about = "Inspect feature-vector caches and train latent SVM models on them")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a saved cache
    Info {
        /// Path to cache file
        cache: PathBuf,
        /// Score records under this model (JSON) and print one row per record
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Evaluate the objective of a model on a cache
    Objective {
        /// Path to cache file
        #[arg(long)]
        cache: PathBuf,
        /// Path to model parameters (JSON)
        #[arg(long)]
        model: PathBuf,
        /// Engine configuration (JSON)
        #[arg(long)]
        engine: Option<PathBuf>,
    },
    /// Train a model on a cache with the SGD solver
    Train {
        /// Path to cache file
        #[arg(long)]
        cache: PathBuf,
        /// Initial model parameters (JSON)
        #[arg(long)]
        model: PathBuf,
        /// Where to write the trained parameters
        #[arg(long)]
        output: PathBuf,
        /// Solver configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn open_session(cache: &Path, engine: EngineConfig) -> anyhow::Result<Session> {
    let mut session = Session::new(engine);
    session
        .load(cache)
        .with_context(|| format!("failed to load cache {}", cache.display()))?;
    Ok(session)
}

fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout carries the JSON results
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { cache, model } => {
            let mut session = open_session(&cache, EngineConfig::default())?;
            match model {
                None => {
                    let c = session.cache();
                    for fv in c.records() {
                        println!("{fv}");
                    }
                    println!("{} feature vectors, {} bytes", c.len(), session.byte_size());
                }
                Some(model) => {
                    session.ex_prepare();
                    session.set_model(ModelParams::from_file(&model)?)?;
                    let rows = session.info()?;
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Objective {
            cache,
            model,
            engine,
        } => {
            let engine = engine
                .map(EngineConfig::from_file)
                .transpose()?
                .unwrap_or_default();
            let mut session = open_session(&cache, engine)?;
            let examples = session.ex_prepare();
            session.set_model(ModelParams::from_file(&model)?)?;
            let terms = session.obj_val()?;
            tracing::info!("{examples} examples, objective {}", terms.total());
            println!("{}", serde_json::to_string_pretty(&terms)?);
        }
        Commands::Train {
            cache,
            model,
            output,
            config,
        } => {
            let config = config
                .map(SgdConfig::from_file)
                .transpose()?
                .unwrap_or_default();
            let mut session = open_session(&cache, EngineConfig::default())?;
            session.ex_prepare();
            session.set_model(ModelParams::from_file(&model)?)?;

            let report = session.sgd(config, &CancellationToken::new())?;
            session
                .get_model()?
                .to_file(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
