//! Binary persistence of a feature-vector cache.
//!
//! All values are little-endian. The file starts with the record count
//! (`i32`) and the cache byte size (`i64`), followed by one entry per record:
//!
//! | field | type |
//! |---|---|
//! | key | `i32 x 4` |
//! | num_blocks | `i32` |
//! | feat_dim | `i32` |
//! | is_unique | `u8` |
//! | score | `f64` |
//! | block labels | `i32 x num_blocks` (only if `num_blocks > 0`) |
//! | features | `f32 x feat_dim` (only if `num_blocks > 0`) |
//! | norm | `f64` |
//! | is_zero, is_belief, is_mined | `u8` each |
//! | loss | `f64` |

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::info;

use crate::cache::FeatureVectorCache;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fv::{FeatureVector, KEY_LEN};

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| CacheError::Format(format!("{what} {value} does not fit in i32")))
}

fn to_usize(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| CacheError::Format(format!("negative {what}: {value}")))
}

/// Write `cache` to `writer`.
///
/// # Errors
///
/// Returns error on I/O failure or if a count does not fit the on-disk width.
pub fn save<W: Write>(cache: &FeatureVectorCache, mut writer: W) -> Result<()> {
    writer.write_all(&to_i32(cache.len(), "record count")?.to_le_bytes())?;
    let byte_size = i64::try_from(cache.byte_size())
        .map_err(|_| CacheError::Format("byte size does not fit in i64".into()))?;
    writer.write_all(&byte_size.to_le_bytes())?;

    for r in cache.records() {
        for k in r.key {
            writer.write_all(&k.to_le_bytes())?;
        }
        writer.write_all(&to_i32(r.num_blocks, "num_blocks")?.to_le_bytes())?;
        writer.write_all(&to_i32(r.feat_dim, "feat_dim")?.to_le_bytes())?;
        writer.write_all(&[u8::from(r.is_unique)])?;
        writer.write_all(&r.score.to_le_bytes())?;
        if r.num_blocks > 0 {
            for b in cache.block_labels(r) {
                writer.write_all(&b.to_le_bytes())?;
            }
            for x in cache.features(r) {
                writer.write_all(&x.to_le_bytes())?;
            }
        }
        writer.write_all(&r.norm.to_le_bytes())?;
        writer.write_all(&[u8::from(r.is_zero), u8::from(r.is_belief), u8::from(r.is_mined)])?;
        writer.write_all(&r.loss.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

struct LeReader<R> {
    inner: R,
}

impl<R: Read> LeReader<R> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.bytes()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.bytes()?))
    }

    fn flag(&mut self) -> Result<bool> {
        let [b] = self.bytes::<1>()?;
        Ok(b != 0)
    }
}

struct StoredRecord {
    record: FeatureVector,
    block_labels: Vec<i32>,
    feat: Vec<f32>,
}

fn read_record<R: Read>(r: &mut LeReader<R>) -> Result<StoredRecord> {
    let mut key = [0; KEY_LEN];
    for k in &mut key {
        *k = r.i32()?;
    }
    let num_blocks = to_usize(r.i32()?, "num_blocks")?;
    let feat_dim = to_usize(r.i32()?, "feat_dim")?;
    let is_unique = r.flag()?;
    let score = r.f64()?;

    let (block_labels, feat) = if num_blocks > 0 {
        let labels = (0..num_blocks).map(|_| r.i32()).collect::<Result<Vec<_>>>()?;
        let feat = (0..feat_dim).map(|_| r.f32()).collect::<Result<Vec<_>>>()?;
        (labels, feat)
    } else if feat_dim > 0 {
        return Err(CacheError::Format(format!(
            "zero vector with feat_dim {feat_dim}"
        )));
    } else {
        (Vec::new(), Vec::new())
    };

    let norm = r.f64()?;
    let is_zero = r.flag()?;
    let is_belief = r.flag()?;
    let is_mined = r.flag()?;
    let loss = r.f64()?;

    if is_zero != (num_blocks == 0) {
        return Err(CacheError::Format(format!(
            "zero flag {is_zero} inconsistent with {num_blocks} blocks"
        )));
    }

    Ok(StoredRecord {
        record: FeatureVector {
            key,
            num_blocks,
            feat_dim,
            is_unique,
            norm,
            is_zero,
            is_belief,
            is_mined,
            score,
            loss,
            ..FeatureVector::default()
        },
        block_labels,
        feat,
    })
}

/// Read a cache from `reader`.
///
/// The pools are sized from `config`, grown as needed to hold every record
/// of the file.
///
/// # Errors
///
/// Returns [`CacheError::Io`] on truncated input and [`CacheError::Format`]
/// if the content is inconsistent, including a header byte size that does
/// not match the records.
pub fn load<R: Read>(reader: R, config: CacheConfig) -> Result<FeatureVectorCache> {
    let mut r = LeReader { inner: reader };
    let count = to_usize(r.i32()?, "record count")?;
    let byte_size = r.i64()?;

    let stored = (0..count)
        .map(|_| read_record(&mut r))
        .collect::<Result<Vec<_>>>()?;

    let (max_dim, max_blocks) = stored.iter().fold((0, 0), |(f, b), s| {
        (f.max(s.record.feat_dim), b.max(s.record.num_blocks))
    });
    let config = CacheConfig {
        max_num_fv: config.max_num_fv.max(count),
        max_fv_dim: config.max_fv_dim.max(max_dim),
        max_num_blocks: config.max_num_blocks.max(max_blocks),
    };

    let mut cache = FeatureVectorCache::new(config)?;
    for s in stored {
        cache.push_record(s.record, &s.block_labels, &s.feat)?;
    }

    if i64::try_from(cache.byte_size()).ok() != Some(byte_size) {
        return Err(CacheError::Format(format!(
            "header byte size {byte_size} does not match records ({})",
            cache.byte_size()
        )));
    }
    Ok(cache)
}

impl FeatureVectorCache {
    /// Save the cache to a file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        save(self, BufWriter::new(file))?;
        info!("Saved {} feature vectors to {:?}", self.len(), path);
        Ok(())
    }

    /// Load a cache from a file written by [`FeatureVectorCache::save_to_file`].
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is malformed.
    pub fn load_from_file<P: AsRef<Path>>(path: P, config: CacheConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let cache = load(BufReader::new(file), config)?;
        info!("Loaded {} feature vectors from {:?}", cache.len(), path);
        Ok(cache)
    }
}
