//! Best-checkpoint selection, periodic snapshots and early stopping.
//!
//! One [`CheckpointPolicy`] covers both single-process and distributed runs.
//! Two switches tell them apart:
//!
//! - [`BestSource`]: compare against the best checkpoint on disk, or against
//!   the best metric held in memory
//! - [`WriterGate`]: every process writes, or only rank 0 does
//!
//! Every checkpoint is written with the EMA weights loaded into the model.

use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointSummary;
use crate::config::{SelectionMetric, TrainOptions};
use crate::distributed::ProcessContext;
use crate::error::Result;
use crate::metrics::EpochSummary;
use crate::potential::Potential;

/// File name of the best checkpoint.
pub const BEST_MODEL: &str = "best_model.safetensors";
/// File name of the most recent checkpoint.
pub const LAST_MODEL: &str = "last_model.safetensors";

/// File name of the periodic checkpoint of `epoch`.
pub fn periodic_name(epoch: usize) -> String {
    format!("ckpt_{epoch}.safetensors")
}

/// Where the best metric so far comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestSource {
    /// Re-read the stored best checkpoint every epoch.
    Disk,
    /// Track the best value in [`TrainingContext`].
    Memory,
}

/// Which processes write checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterGate {
    /// The (only) process writes.
    Always,
    /// Only rank 0 writes.
    RankZero,
}

/// Per-run selection state threaded through the epoch loop.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    /// Process identity.
    pub process: ProcessContext,
    /// Metric driving selection.
    pub metric: SelectionMetric,
    /// Best metric value seen.
    pub best_metric: f64,
    /// Epoch of the best metric, when known.
    pub best_epoch: Option<i64>,
    early_stop_noted: bool,
}

impl TrainingContext {
    /// Fresh context with no best metric yet.
    pub fn new(process: ProcessContext, metric: SelectionMetric) -> Self {
        Self {
            process,
            metric,
            best_metric: f64::INFINITY,
            best_epoch: None,
            early_stop_noted: false,
        }
    }
}

/// What to do after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochDecision {
    /// Keep training.
    Continue,
    /// Patience exhausted.
    Stop,
}

/// Checkpoint and early-stop rules of a run.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    /// Comparison source.
    pub source: BestSource,
    /// Writer gate.
    pub gate: WriterGate,
    /// Write checkpoints at all.
    pub enabled: bool,
    /// Checkpoint directory.
    pub save_path: PathBuf,
    /// Periodic checkpoint interval in epochs.
    pub interval: usize,
    /// Epochs without improvement before stopping.
    pub patience: usize,
}

impl CheckpointPolicy {
    /// Policy for `options`: in-memory best tracking and a rank-zero writer
    /// for distributed runs, disk comparison otherwise.
    pub fn from_options(options: &TrainOptions) -> Self {
        let (source, gate) = if options.is_distributed {
            (BestSource::Memory, WriterGate::RankZero)
        } else {
            (BestSource::Disk, WriterGate::Always)
        };
        Self {
            source,
            gate,
            enabled: options.save_checkpoint,
            save_path: options.save_path.clone(),
            interval: options.ckpt_interval.max(1),
            patience: options.early_stop_patience,
        }
    }

    fn may_write(&self, ctx: &TrainingContext) -> bool {
        self.enabled
            && match self.gate {
                WriterGate::Always => true,
                WriterGate::RankZero => ctx.process.is_coordinator(),
            }
    }

    fn save(&self, potential: &mut Potential, name: &str) -> Result<()> {
        let path = self.save_path.join(name);
        potential.with_ema_weights(|p| p.save(&path))
    }

    /// Apply the rules after `epoch` finished with validation `summary`.
    pub fn after_epoch(
        &self,
        potential: &mut Potential,
        ctx: &mut TrainingContext,
        epoch: usize,
        summary: &EpochSummary,
    ) -> Result<EpochDecision> {
        let value = summary.metric(ctx.metric);
        match self.source {
            BestSource::Disk => {
                if self.select_against_disk(potential, ctx, epoch, value)? == EpochDecision::Stop {
                    return Ok(EpochDecision::Stop);
                }
            }
            BestSource::Memory => self.select_in_memory(potential, ctx, epoch, value)?,
        }

        if self.may_write(ctx) {
            if epoch % self.interval == 0 {
                self.save(potential, &periodic_name(epoch))?;
            }
            self.save(potential, LAST_MODEL)?;
        }
        Ok(EpochDecision::Continue)
    }

    fn select_against_disk(
        &self,
        potential: &mut Potential,
        ctx: &mut TrainingContext,
        epoch: usize,
        value: f64,
    ) -> Result<EpochDecision> {
        let stored = stored_best(&self.save_path.join(BEST_MODEL), ctx.metric);
        let epoch_i = epoch as i64;

        match stored {
            Some((best_value, best_epoch)) => {
                ctx.best_metric = best_value;
                ctx.best_epoch = Some(best_epoch);
                if self.may_write(ctx) && value < best_value {
                    self.save(potential, BEST_MODEL)?;
                    ctx.best_metric = value;
                    ctx.best_epoch = Some(epoch_i);
                }
            }
            None => {
                if self.may_write(ctx) {
                    self.save(potential, BEST_MODEL)?;
                    ctx.best_metric = value;
                    ctx.best_epoch = Some(epoch_i);
                }
            }
        }

        if let Some(best_epoch) = ctx.best_epoch {
            if epoch_i > best_epoch + self.patience as i64 {
                tracing::info!(
                    "Early stopping: no improvement of {} since epoch {best_epoch}",
                    ctx.metric
                );
                return Ok(EpochDecision::Stop);
            }
        }
        Ok(EpochDecision::Continue)
    }

    fn select_in_memory(
        &self,
        potential: &mut Potential,
        ctx: &mut TrainingContext,
        epoch: usize,
        value: f64,
    ) -> Result<()> {
        if value < ctx.best_metric {
            ctx.best_metric = value;
            ctx.best_epoch = Some(epoch as i64);
            if self.may_write(ctx) {
                self.save(potential, BEST_MODEL)?;
            }
        }
        if !ctx.early_stop_noted {
            tracing::info!("Early stopping is not available for distributed training");
            ctx.early_stop_noted = true;
        }
        Ok(())
    }
}

/// Metric value and epoch of the stored best checkpoint. A missing or
/// unreadable file, or one without the metric, means there is no prior best.
fn stored_best(path: &Path, metric: SelectionMetric) -> Option<(f64, i64)> {
    match CheckpointSummary::read(path) {
        Ok(summary) => {
            let value = summary.validation_metrics.get(metric.saved_key()).copied();
            if value.is_none() {
                tracing::debug!("{} has no `{}` entry", path.display(), metric.saved_key());
            }
            value.map(|v| (v, summary.last_epoch))
        }
        Err(e) => {
            tracing::debug!("No best checkpoint to compare against ({e})");
            None
        }
    }
}
