//! Integration tests for the fv-cache CLI.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use fv_cache_rs::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Write a small two-example cache and an initial model into `dir`.
fn write_fixtures(dir: &Path) -> (PathBuf, PathBuf) {
    let mut cache = FeatureVectorCache::new(CacheConfig::default().with_max_num_fv(8)).unwrap();
    cache
        .add(&NewFeatureVector::new([1, 0, 0, 0], &[0], &[1.0, 0.0]).with_belief(true))
        .unwrap();
    cache
        .add(&NewFeatureVector::new([1, 1, 0, 0], &[0], &[0.0, 1.0]).with_loss(1.0))
        .unwrap();
    cache
        .add(&NewFeatureVector::new([-2, 0, 0, 0], &[0], &[0.5, 0.5]))
        .unwrap();
    let cache_path = dir.join("cache.bin");
    cache.save_to_file(&cache_path).unwrap();

    let model_path = dir.join("model.json");
    ModelParams::new(vec![vec![0.0, 0.0]], 1.0)
        .to_file(&model_path)
        .unwrap();
    (cache_path, model_path)
}

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("fv-cache").expect("Failed to find fv-cache binary");
    cmd.args(args);
    cmd
}

fn path_str(p: &Path) -> &str {
    p.to_str().expect("temp path is valid UTF-8")
}

#[test]
fn test_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("objective"))
        .stdout(predicate::str::contains("train"));
}

#[test]
fn test_info_lists_records() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = write_fixtures(dir.path());
    run_cli(&["info", path_str(&cache)])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 feature vectors, 24 bytes"))
        .stdout(predicate::str::contains("dataid: -2"));
}

#[test]
fn test_info_with_model_reports_margins() {
    let dir = TempDir::new().unwrap();
    let (cache, model) = write_fixtures(dir.path());
    run_cli(&["info", path_str(&cache), "--model", path_str(&model)])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"margin\""));
}

#[test]
fn test_objective_prints_terms() {
    let dir = TempDir::new().unwrap();
    let (cache, model) = write_fixtures(dir.path());
    let output = run_cli(&["objective", "--cache", path_str(&cache), "--model", path_str(&model)])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let terms: ObjectiveTerms = serde_json::from_slice(&output).unwrap();
    // belief example loses by the candidate's loss, the negative sits at 0
    assert!((terms.fg_loss - 1.0).abs() < 1e-12);
    assert!((terms.bg_loss - 1.0).abs() < 1e-12);
    assert_eq!(terms.reg, 0.0);
}

#[test]
fn test_train_writes_model() {
    let dir = TempDir::new().unwrap();
    let (cache, model) = write_fixtures(dir.path());
    let config_path = dir.path().join("sgd.json");
    let config = SgdConfig::default()
        .with_max_iter(500)
        .with_min_iter(0)
        .with_check_freq(50)
        .with_reg_freq(5);
    fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();
    let output = dir.path().join("trained.json");

    run_cli(&[
        "train",
        "--cache",
        path_str(&cache),
        "--model",
        path_str(&model),
        "--output",
        path_str(&output),
        "--config",
        path_str(&config_path),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"outcome\""));

    let trained = ModelParams::from_file(&output).unwrap();
    assert_eq!(trained.w.len(), 1);
    assert!(trained.w[0][0] > trained.w[0][1]);
}

#[test]
fn test_missing_cache_fails() {
    let dir = TempDir::new().unwrap();
    run_cli(&["info", path_str(&dir.path().join("nope.bin"))])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load cache"));
}
