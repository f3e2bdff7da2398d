//! Dataset loading, distributed sampling and batching.
//!
//! A dataset file is a JSON array of [`GraphRecord`]s. Training data is either
//! held in memory as collated batches or streamed from shard files, one shard
//! resident at a time.

use std::path::{Path, PathBuf};

use candle_core::Device;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::batch::{GraphBatch, GraphRecord};
use crate::distributed::ProcessContext;
use crate::error::{ForceFieldError, Result};

/// Seed stride between shards of one epoch.
pub const SHARD_SEED_STRIDE: u64 = 131;

/// Where training or validation batches come from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Pre-collated batches of a single dataset.
    Batches(Vec<GraphBatch>),
    /// Shard files loaded one at a time.
    Shards(Vec<PathBuf>),
    /// One batch list per dataset, in head order.
    MultiHead(Vec<Vec<GraphBatch>>),
}

impl DataSource {
    /// Number of batches, when known without touching disk.
    pub fn num_batches(&self) -> Option<usize> {
        match self {
            Self::Batches(batches) => Some(batches.len()),
            Self::Shards(_) => None,
            Self::MultiHead(sources) => Some(sources.iter().map(Vec::len).sum()),
        }
    }
}

/// Read every record from a JSON array file.
///
/// # Errors
///
/// Returns [`ForceFieldError::Data`] when the file is not a valid record
/// array or a record fails validation.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<GraphRecord>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let records: Vec<GraphRecord> = serde_json::from_str(&content).map_err(|e| {
        ForceFieldError::data(format!("failed to parse {}: {e}", path.display()))
    })?;
    for (i, record) in records.iter().enumerate() {
        record
            .validate()
            .map_err(|e| ForceFieldError::data(format!("{} record {i}: {e}", path.display())))?;
    }
    Ok(records)
}

/// Write records as a JSON array.
pub fn save_records<P: AsRef<Path>>(path: P, records: &[GraphRecord]) -> Result<()> {
    if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string(records)?)?;
    Ok(())
}

/// Collate records into consecutive batches of at most `batch_size`.
pub fn make_batches(records: &[GraphRecord], batch_size: usize, device: &Device) -> Result<Vec<GraphBatch>> {
    if batch_size == 0 {
        return Err(ForceFieldError::invalid_config("batch_size must be at least 1"));
    }
    records
        .chunks(batch_size)
        .map(|chunk| GraphBatch::collate(chunk, device))
        .collect()
}

/// Load a file and collate it into batches.
pub fn load_batches<P: AsRef<Path>>(path: P, batch_size: usize, device: &Device) -> Result<Vec<GraphBatch>> {
    make_batches(&load_records(path)?, batch_size, device)
}

/// Shuffled index partition across processes.
///
/// Indices are permuted with `seed`, padded by wrapping around until every
/// process gets the same count, then dealt out round-robin by rank.
#[derive(Debug, Clone, Copy)]
pub struct DistributedSampler {
    process: ProcessContext,
    seed: u64,
}

impl DistributedSampler {
    /// Sampler for `process` seeded with `seed`.
    pub fn new(process: ProcessContext, seed: u64) -> Self {
        Self { process, seed }
    }

    /// Indices this process visits for a dataset of `len` items.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(self.seed));

        let world = self.process.world_size;
        let total = len.div_ceil(world) * world;
        let mut padded = order.clone();
        while padded.len() < total {
            let missing = total - padded.len();
            padded.extend(order.iter().take(missing));
        }

        padded
            .into_iter()
            .skip(self.process.rank)
            .step_by(world)
            .collect()
    }
}

/// Shard order of one epoch, shuffled with `seed + epoch`.
pub fn shard_order(shards: &[PathBuf], seed: u64, epoch: usize) -> Vec<PathBuf> {
    let mut order = shards.to_vec();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64)));
    order
}

/// Load shard `index` of the epoch and batch the records this process owns.
pub fn load_shard(
    path: &Path,
    index: usize,
    epoch: usize,
    seed: u64,
    process: ProcessContext,
    batch_size: usize,
    device: &Device,
) -> Result<Vec<GraphBatch>> {
    let records = load_records(path)?;
    let sampler_seed = seed
        .wrapping_add(index as u64 * SHARD_SEED_STRIDE)
        .wrapping_add(epoch as u64);
    let owned: Vec<GraphRecord> = DistributedSampler::new(process, sampler_seed)
        .indices(records.len())
        .into_iter()
        .map(|i| records[i].clone())
        .collect();
    tracing::info!(
        "TRAIN: loading {} with {} data points, {} on this process",
        path.display(),
        records.len(),
        owned.len()
    );
    make_batches(&owned, batch_size, device)
}
