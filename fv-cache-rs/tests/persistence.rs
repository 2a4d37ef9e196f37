//! Save/load round trips through the filesystem.

use fv_cache_rs::prelude::*;
use tempfile::TempDir;

fn populated_session() -> Session {
    let mut session = Session::default();
    session
        .init(
            CacheConfig::default()
                .with_max_num_fv(16)
                .with_max_fv_dim(4)
                .with_max_num_blocks(2),
        )
        .unwrap();
    let vectors = [
        NewFeatureVector::new([2, 0, 0, 1], &[1, 0], &[0.1, 0.2, -0.3]).with_belief(true),
        NewFeatureVector::new([2, 5, 1, 1], &[0], &[1.5, f32::EPSILON]).with_loss(1.0),
        NewFeatureVector::new([2, 5, 1, 1], &[0], &[1.5, f32::EPSILON]).with_loss(1.0),
        NewFeatureVector::new([-4, 3, 3, 2], &[], &[]).with_mined(true),
        NewFeatureVector::new([-4, 3, 4, 2], &[1], &[-7.25]).with_mined(true),
    ];
    for fv in &vectors {
        session.add(fv).unwrap();
    }
    session.ex_prepare();
    session
        .set_model(ModelParams::new(vec![vec![1.0, -1.0], vec![0.5]], 1.0))
        .unwrap();
    session.info().unwrap();
    session
}

#[test]
fn test_roundtrip_preserves_everything() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.bin");

    let original = populated_session();
    original.save(&path).unwrap();

    let mut restored = Session::default();
    restored.load(&path).unwrap();

    assert_eq!(restored.byte_size(), original.byte_size());
    let (a, b) = (original.cache(), restored.cache());
    assert_eq!(a.len(), b.len());
    for (x, y) in a.records().iter().zip(b.records()) {
        assert_eq!(x.key, y.key);
        assert_eq!(x.is_unique, y.is_unique);
        assert_eq!(x.is_zero, y.is_zero);
        assert_eq!(x.is_belief, y.is_belief);
        assert_eq!(x.is_mined, y.is_mined);
        assert_eq!(x.score.to_bits(), y.score.to_bits());
        assert_eq!(x.norm.to_bits(), y.norm.to_bits());
        assert_eq!(x.loss.to_bits(), y.loss.to_bits());
        let fa: Vec<u32> = a.features(x).iter().map(|f| f.to_bits()).collect();
        let fb: Vec<u32> = b.features(y).iter().map(|f| f.to_bits()).collect();
        assert_eq!(fa, fb);
        assert_eq!(a.block_labels(x), b.block_labels(y));
    }
}

#[test]
fn test_restored_cache_gives_same_objective() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.bin");

    let original = populated_session();
    original.save(&path).unwrap();

    let mut restored = Session::default();
    restored.load(&path).unwrap();
    restored.ex_prepare();
    restored.set_model(original.get_model().unwrap()).unwrap();

    let before = original.obj_val().unwrap();
    let after = restored.obj_val().unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_load_missing_file_keeps_session() {
    let dir = TempDir::new().unwrap();
    let mut session = populated_session();
    let len = session.cache().len();

    let err = session.load(dir.path().join("absent.bin")).unwrap_err();
    assert!(matches!(err, CacheError::Io(_)));
    assert_eq!(session.cache().len(), len);
}

#[test]
fn test_truncated_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.bin");
    populated_session().save(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let mut session = Session::default();
    assert!(matches!(session.load(&path), Err(CacheError::Io(_))));
}
