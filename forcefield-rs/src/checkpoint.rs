//! Checkpoint persistence.
//!
//! # Format
//!
//! A checkpoint is a single safetensors file. Tensors are stored under four
//! prefixes:
//!
//! - `model.` - model parameters
//! - `optimizer.exp_avg.` / `optimizer.exp_avg_sq.` - Adam moments
//! - `ema.shadow.` - EMA shadow parameters
//!
//! Everything else lives in the header metadata as JSON strings under the
//! keys `model_name`, `model_args`, `optimizer`, `scheduler`, `ema`,
//! `last_epoch`, `validation_metrics` and `description`. Files are written to
//! a temporary sibling and renamed into place, so readers never observe a
//! partial record.
//!
//! # Restoring training state
//!
//! Weights and model arguments must load. Optimizer, scheduler, EMA and epoch
//! metadata are restored through ordered strategy lists: the first strategy
//! that succeeds wins, and when all fail the documented default is used and
//! recorded in a [`RestoreReport`].

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor, Var};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ema::{EmaMeta, ExponentialMovingAverage};
use crate::error::{ForceFieldError, Result};
use crate::model::{named_vars, EnergyModel};
use crate::optimizer::{Adam, AdamConfig, AdamMeta};
use crate::scheduler::{LRScheduler, SchedulerKind};

/// Prefix of model parameter tensors.
pub const MODEL_PREFIX: &str = "model.";
/// Prefix of Adam first-moment tensors.
pub const EXP_AVG_PREFIX: &str = "optimizer.exp_avg.";
/// Prefix of Adam second-moment tensors.
pub const EXP_AVG_SQ_PREFIX: &str = "optimizer.exp_avg_sq.";
/// Prefix of EMA shadow tensors.
pub const EMA_PREFIX: &str = "ema.shadow.";

/// Prefix added to parameter names by data-parallel wrappers.
const DATA_PARALLEL_PREFIX: &str = "module.";

/// Parameter name without a data-parallel wrapper prefix.
pub fn canonical_name(name: &str) -> &str {
    name.strip_prefix(DATA_PARALLEL_PREFIX).unwrap_or(name)
}

/// Dense tensor as plain JSON, used by inline optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f64>,
}

impl TensorRecord {
    /// Copy a tensor to the host.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor
                .to_dtype(crate::batch::FLOAT)?
                .flatten_all()?
                .to_vec1::<f64>()?,
        })
    }

    /// Rebuild the tensor on `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// Optimizer state with moments inlined as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineAdamState {
    /// Hyperparameters.
    pub config: AdamConfig,
    /// Update count per parameter.
    pub steps: BTreeMap<String, u64>,
    /// First moments.
    pub exp_avg: BTreeMap<String, TensorRecord>,
    /// Second moments.
    pub exp_avg_sq: BTreeMap<String, TensorRecord>,
}

/// Borrowed training state to persist.
pub struct TrainingSnapshot<'a> {
    /// Model identifier.
    pub model_name: &'a str,
    /// Model whose parameters are saved.
    pub model: &'a dyn EnergyModel,
    /// Optimizer, if any.
    pub optimizer: Option<&'a Adam>,
    /// Scheduler.
    pub scheduler: &'a LRScheduler,
    /// EMA, if any.
    pub ema: Option<&'a ExponentialMovingAverage>,
    /// Last completed epoch, -1 before training.
    pub last_epoch: i64,
    /// Validation metrics of the last epoch.
    pub validation_metrics: &'a BTreeMap<String, f64>,
    /// Free-text description.
    pub description: &'a str,
}

/// Raw checkpoint contents: tensors plus string metadata.
#[derive(Debug, Clone, Default)]
pub struct CheckpointRecord {
    /// Metadata entries, values are JSON.
    pub metadata: HashMap<String, String>,
    /// Every stored tensor under its prefixed name.
    pub tensors: HashMap<String, Tensor>,
}

impl CheckpointRecord {
    /// Capture a complete record from live training state.
    pub fn capture(snapshot: &TrainingSnapshot<'_>) -> Result<Self> {
        let mut record = Self::default();

        for (name, var) in named_vars(snapshot.model.var_map())? {
            record.tensors.insert(
                format!("{MODEL_PREFIX}{}", canonical_name(&name)),
                var.as_tensor().detach().copy()?,
            );
        }

        if let Some(optimizer) = snapshot.optimizer {
            for (name, state) in optimizer.state() {
                let name = canonical_name(name);
                record
                    .tensors
                    .insert(format!("{EXP_AVG_PREFIX}{name}"), state.exp_avg.clone());
                record
                    .tensors
                    .insert(format!("{EXP_AVG_SQ_PREFIX}{name}"), state.exp_avg_sq.clone());
            }
            record.set("optimizer", &optimizer.meta())?;
        }

        if let Some(ema) = snapshot.ema {
            for (name, shadow) in ema.shadow() {
                record
                    .tensors
                    .insert(format!("{EMA_PREFIX}{}", canonical_name(name)), shadow.clone());
            }
            record.set("ema", &ema.meta())?;
        }

        record.set("model_name", &snapshot.model_name)?;
        record.set("model_args", &snapshot.model.model_args()?)?;
        record.set("scheduler", snapshot.scheduler)?;
        record.set("last_epoch", &snapshot.last_epoch)?;
        record.set("validation_metrics", snapshot.validation_metrics)?;
        record.set("description", &snapshot.description)?;
        Ok(record)
    }

    /// Store a metadata entry as JSON.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        self.metadata
            .insert(key.to_string(), serde_json::to_string(value)?);
        Ok(())
    }

    /// Parse a metadata entry.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self
            .metadata
            .get(key)
            .ok_or_else(|| ForceFieldError::checkpoint(format!("missing `{key}` entry")))?;
        serde_json::from_str(raw)
            .map_err(|e| ForceFieldError::checkpoint(format!("malformed `{key}` entry: {e}")))
    }

    /// Stored model identifier.
    pub fn model_name(&self) -> Result<String> {
        self.get("model_name")
    }

    /// Stored constructor arguments.
    pub fn model_args(&self) -> Result<serde_json::Value> {
        self.get("model_args")
    }

    /// Tensors under `prefix`, keyed by the remainder of their name.
    pub fn tensors_with_prefix(&self, prefix: &str) -> HashMap<String, Tensor> {
        self.tensors
            .iter()
            .filter_map(|(name, tensor)| {
                name.strip_prefix(prefix)
                    .map(|rest| (canonical_name(rest).to_string(), tensor.clone()))
            })
            .collect()
    }

    /// Model parameters by canonical name.
    pub fn weights(&self) -> HashMap<String, Tensor> {
        self.tensors_with_prefix(MODEL_PREFIX)
    }

    /// Replace the model parameters.
    pub fn set_weights(&mut self, weights: HashMap<String, Tensor>) {
        self.tensors.retain(|name, _| !name.starts_with(MODEL_PREFIX));
        for (name, tensor) in weights {
            self.tensors.insert(format!("{MODEL_PREFIX}{name}"), tensor);
        }
    }

    /// Serialize to safetensors bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let metadata = Some(self.metadata.clone());
        Ok(safetensors::tensor::serialize(
            self.tensors.iter().map(|(k, v)| (k.as_str(), v)),
            &metadata,
        )?)
    }

    /// Parse safetensors bytes, placing tensors on `device`.
    pub fn from_bytes(bytes: &[u8], device: &Device) -> Result<Self> {
        let (_, header) = safetensors::SafeTensors::read_metadata(bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = candle_core::safetensors::load_buffer(bytes, device)?;
        Ok(Self { metadata, tensors })
    }

    /// Write atomically to `path`, creating parent directories.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temporary_sibling(path);
        std::fs::write(&tmp, self.to_bytes()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read a record from `path`.
    pub fn read<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, device)
    }
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Epoch and metrics of a stored checkpoint, read from the header alone.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    /// Model identifier.
    pub model_name: String,
    /// Last completed epoch.
    pub last_epoch: i64,
    /// Validation metrics.
    pub validation_metrics: BTreeMap<String, f64>,
}

impl CheckpointSummary {
    /// Read the header of the checkpoint at `path` without loading tensors.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut len = [0u8; 8];
        file.read_exact(&mut len)?;
        let len = usize::try_from(u64::from_le_bytes(len))
            .map_err(|_| ForceFieldError::checkpoint("header length overflows"))?;
        let mut header = vec![0u8; len];
        file.read_exact(&mut header)?;

        #[derive(Deserialize)]
        struct Header {
            #[serde(rename = "__metadata__", default)]
            metadata: HashMap<String, String>,
        }
        let header: Header = serde_json::from_slice(&header)?;
        let record = CheckpointRecord {
            metadata: header.metadata,
            tensors: HashMap::new(),
        };
        Ok(Self {
            model_name: record.model_name()?,
            last_epoch: record.get("last_epoch")?,
            validation_metrics: record.get("validation_metrics")?,
        })
    }
}

/// How one piece of auxiliary state was restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Restored by the named strategy.
    Restored(&'static str),
    /// Replaced by a default; the reason lists every failed strategy.
    Defaulted(String),
    /// Not requested.
    Skipped,
}

impl RestoreOutcome {
    /// Whether a default was substituted.
    pub fn is_defaulted(&self) -> bool {
        matches!(self, Self::Defaulted(_))
    }
}

/// Outcome of restoring auxiliary training state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Optimizer state.
    pub optimizer: RestoreOutcome,
    /// Scheduler state.
    pub scheduler: RestoreOutcome,
    /// EMA state.
    pub ema: RestoreOutcome,
    /// Epoch, metrics and description.
    pub metadata: RestoreOutcome,
}

impl RestoreReport {
    /// Report for a load that skipped training state.
    pub fn skipped() -> Self {
        Self {
            optimizer: RestoreOutcome::Skipped,
            scheduler: RestoreOutcome::Skipped,
            ema: RestoreOutcome::Skipped,
            metadata: RestoreOutcome::Skipped,
        }
    }

    /// Whether any piece fell back to a default.
    pub fn is_degraded(&self) -> bool {
        [&self.optimizer, &self.scheduler, &self.ema, &self.metadata]
            .iter()
            .any(|o| o.is_defaulted())
    }
}

/// Training state recovered from a record.
pub struct RestoredState {
    /// Optimizer, `None` when it could not be restored.
    pub optimizer: Option<Adam>,
    /// Scheduler, the default `StepLR` when it could not be restored.
    pub scheduler: LRScheduler,
    /// EMA, `None` when it could not be restored.
    pub ema: Option<ExponentialMovingAverage>,
    /// Last completed epoch.
    pub last_epoch: i64,
    /// Validation metrics.
    pub validation_metrics: BTreeMap<String, f64>,
    /// Description.
    pub description: String,
    /// What was restored and what was defaulted.
    pub report: RestoreReport,
}

type Strategy<T> = (&'static str, fn(&CheckpointRecord, &[(String, Var)]) -> Result<T>);

const OPTIMIZER_STRATEGIES: [Strategy<Adam>; 2] = [
    ("split tensors", optimizer_from_split),
    ("inline json", optimizer_from_inline),
];

const SCHEDULER_STRATEGIES: [Strategy<LRScheduler>; 2] = [
    ("scheduler state", scheduler_from_state),
    ("scheduler kind", scheduler_from_kind),
];

const EMA_STRATEGIES: [Strategy<ExponentialMovingAverage>; 1] = [("split tensors", ema_from_split)];

fn optimizer_from_split(record: &CheckpointRecord, params: &[(String, Var)]) -> Result<Adam> {
    let meta: AdamMeta = record.get("optimizer")?;
    Adam::from_state(
        params.to_vec(),
        meta,
        record.tensors_with_prefix(EXP_AVG_PREFIX),
        record.tensors_with_prefix(EXP_AVG_SQ_PREFIX),
    )
}

fn optimizer_from_inline(record: &CheckpointRecord, params: &[(String, Var)]) -> Result<Adam> {
    let inline: InlineAdamState = record.get("optimizer")?;
    let device = params
        .first()
        .map(|(_, v)| v.device().clone())
        .unwrap_or(Device::Cpu);
    let convert = |moments: &BTreeMap<String, TensorRecord>| -> Result<HashMap<String, Tensor>> {
        moments
            .iter()
            .map(|(name, t)| Ok((canonical_name(name).to_string(), t.to_tensor(&device)?)))
            .collect()
    };
    Adam::from_state(
        params.to_vec(),
        AdamMeta {
            config: inline.config,
            steps: inline.steps,
        },
        convert(&inline.exp_avg)?,
        convert(&inline.exp_avg_sq)?,
    )
}

fn scheduler_from_state(record: &CheckpointRecord, _: &[(String, Var)]) -> Result<LRScheduler> {
    record.get("scheduler")
}

fn scheduler_from_kind(record: &CheckpointRecord, _: &[(String, Var)]) -> Result<LRScheduler> {
    let kind: SchedulerKind = record.get("scheduler")?;
    kind.validate()?;
    Ok(LRScheduler::new(kind, AdamConfig::default().learning_rate))
}

fn ema_from_split(record: &CheckpointRecord, params: &[(String, Var)]) -> Result<ExponentialMovingAverage> {
    let meta: EmaMeta = record.get("ema")?;
    ExponentialMovingAverage::from_state(params.to_vec(), meta, record.tensors_with_prefix(EMA_PREFIX))
}

/// Try `strategies` in order. Returns the first success and its name, or the
/// collected failure messages.
fn first_success<T>(
    strategies: &[Strategy<T>],
    record: &CheckpointRecord,
    params: &[(String, Var)],
) -> std::result::Result<(T, &'static str), String> {
    let mut failures = Vec::new();
    for (name, strategy) in strategies {
        match strategy(record, params) {
            Ok(value) => return Ok((value, name)),
            Err(e) => failures.push(format!("{name}: {e}")),
        }
    }
    Err(failures.join("; "))
}

/// Restore optimizer, scheduler, EMA and epoch metadata for `params`.
///
/// Never fails: every piece that cannot be restored is replaced by its
/// default, logged, and flagged in the returned report.
pub fn restore_training_state(record: &CheckpointRecord, params: &[(String, Var)]) -> RestoredState {
    let (optimizer, optimizer_outcome) = match first_success(&OPTIMIZER_STRATEGIES, record, params) {
        Ok((adam, how)) => (Some(adam), RestoreOutcome::Restored(how)),
        Err(why) => {
            tracing::warn!("Optimizer state not restored ({why}); continuing without one");
            (None, RestoreOutcome::Defaulted(why))
        }
    };

    let (scheduler, scheduler_outcome) = match first_success(&SCHEDULER_STRATEGIES, record, params) {
        Ok((scheduler, how)) => (scheduler, RestoreOutcome::Restored(how)),
        Err(why) => {
            tracing::warn!("Scheduler state not restored ({why}); using StepLR");
            let lr = optimizer
                .as_ref()
                .map_or(AdamConfig::default().learning_rate, Adam::learning_rate);
            (
                LRScheduler::new(SchedulerKind::default(), lr),
                RestoreOutcome::Defaulted(why),
            )
        }
    };

    let (ema, ema_outcome) = match first_success(&EMA_STRATEGIES, record, params) {
        Ok((ema, how)) => (Some(ema), RestoreOutcome::Restored(how)),
        Err(why) => {
            tracing::warn!("EMA state not restored ({why}); continuing without one");
            (None, RestoreOutcome::Defaulted(why))
        }
    };

    let metadata = (|| -> Result<(i64, BTreeMap<String, f64>, String)> {
        Ok((
            record.get("last_epoch")?,
            record.get("validation_metrics")?,
            record.get("description")?,
        ))
    })();
    let ((last_epoch, validation_metrics, description), metadata_outcome) = match metadata {
        Ok(values) => (values, RestoreOutcome::Restored("metadata entries")),
        Err(e) => {
            tracing::warn!("Epoch metadata not restored ({e}); starting from epoch -1");
            (
                (-1, BTreeMap::new(), String::new()),
                RestoreOutcome::Defaulted(e.to_string()),
            )
        }
    };

    RestoredState {
        optimizer,
        scheduler,
        ema,
        last_epoch,
        validation_metrics,
        description,
        report: RestoreReport {
            optimizer: optimizer_outcome,
            scheduler: scheduler_outcome,
            ema: ema_outcome,
            metadata: metadata_outcome,
        },
    }
}

/// Copy stored weights into `params`.
///
/// Stored names without a matching parameter are ignored and parameters
/// without a stored value keep their current value. With `strict`, both
/// cases are errors instead.
///
/// # Errors
///
/// Returns [`ForceFieldError::Checkpoint`] on shape mismatches, or on
/// unmatched names when `strict`.
pub fn load_weights(
    params: &[(String, Var)],
    weights: &HashMap<String, Tensor>,
    strict: bool,
) -> Result<()> {
    for (name, var) in params {
        let Some(stored) = weights.get(canonical_name(name)) else {
            if strict {
                return Err(ForceFieldError::checkpoint(format!("no stored value for `{name}`")));
            }
            tracing::debug!("Parameter {name} not in checkpoint; keeping initial value");
            continue;
        };
        if stored.dims() != var.dims() {
            return Err(ForceFieldError::checkpoint(format!(
                "`{name}` is stored with shape {:?}, model expects {:?}",
                stored.dims(),
                var.dims()
            )));
        }
        var.set(&stored.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }

    for name in weights.keys() {
        if !params.iter().any(|(n, _)| canonical_name(n) == name) {
            if strict {
                return Err(ForceFieldError::checkpoint(format!(
                    "stored value `{name}` matches no parameter"
                )));
            }
            tracing::debug!("Ignoring checkpoint entry {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MorseConfig, MorsePotential};

    fn snapshot_record(model: &MorsePotential, scheduler: &LRScheduler) -> CheckpointRecord {
        let metrics = BTreeMap::from([("loss".to_string(), 0.25)]);
        CheckpointRecord::capture(&TrainingSnapshot {
            model_name: "morse",
            model,
            optimizer: None,
            scheduler,
            ema: None,
            last_epoch: 4,
            validation_metrics: &metrics,
            description: "unit",
        })
        .unwrap()
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("module.terms.0.r0"), "terms.0.r0");
        assert_eq!(canonical_name("terms.0.r0"), "terms.0.r0");
    }

    #[test]
    fn test_write_read_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/best_model.safetensors");
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let scheduler = LRScheduler::new(SchedulerKind::default(), 1e-3);
        let record = snapshot_record(&model, &scheduler);
        record.write(&path).unwrap();
        assert!(!dir.path().join("nested/.best_model.safetensors.tmp").exists());

        let loaded = CheckpointRecord::read(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.model_name().unwrap(), "morse");
        assert_eq!(loaded.weights().len(), record.weights().len());

        let summary = CheckpointSummary::read(&path).unwrap();
        assert_eq!(summary.last_epoch, 4);
        assert_eq!(summary.validation_metrics["loss"], 0.25);
    }

    #[test]
    fn test_metrics_survive_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let scheduler = LRScheduler::new(SchedulerKind::default(), 1e-3);
        // Shortest decimal forms that a fast float parser rounds off by one ULP.
        let metrics = BTreeMap::from([
            ("MAE_force".to_string(), 0.235_501_746_993_216_02),
            ("loss".to_string(), 0.1 + 0.2),
            ("MAE_energy".to_string(), 1.0 / 3.0),
        ]);
        let mut record = snapshot_record(&model, &scheduler);
        record.set("validation_metrics", &metrics).unwrap();
        record.write(&path).unwrap();

        let bits = |m: &BTreeMap<String, f64>| -> Vec<u64> { m.values().map(|v| v.to_bits()).collect() };
        let loaded: BTreeMap<String, f64> = CheckpointRecord::read(&path, &Device::Cpu)
            .unwrap()
            .get("validation_metrics")
            .unwrap();
        assert_eq!(bits(&loaded), bits(&metrics));
        let summary = CheckpointSummary::read(&path).unwrap();
        assert_eq!(bits(&summary.validation_metrics), bits(&metrics));
    }

    #[test]
    fn test_summary_of_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointSummary::read(dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_restore_defaults_without_state() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let scheduler = LRScheduler::new(SchedulerKind::default(), 1e-3);
        let mut record = snapshot_record(&model, &scheduler);
        record.metadata.insert("scheduler".into(), "{not json".into());
        let params = named_vars(model.var_map()).unwrap();

        let restored = restore_training_state(&record, &params);
        assert!(restored.optimizer.is_none());
        assert!(restored.ema.is_none());
        assert!(restored.report.optimizer.is_defaulted());
        assert!(restored.report.scheduler.is_defaulted());
        assert_eq!(restored.scheduler.kind(), &SchedulerKind::default());
        assert_eq!(restored.last_epoch, 4);
        assert!(restored.report.is_degraded());
    }

    #[test]
    fn test_scheduler_kind_fallback() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let scheduler = LRScheduler::new(SchedulerKind::default(), 1e-3);
        let mut record = snapshot_record(&model, &scheduler);
        record
            .set(
                "scheduler",
                &SchedulerKind::StepLR {
                    step_size: 2,
                    gamma: 0.5,
                },
            )
            .unwrap();
        let params = named_vars(model.var_map()).unwrap();
        let restored = restore_training_state(&record, &params);
        assert_eq!(
            restored.report.scheduler,
            RestoreOutcome::Restored("scheduler kind")
        );
    }

    #[test]
    fn test_metadata_defaults() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let scheduler = LRScheduler::new(SchedulerKind::default(), 1e-3);
        let mut record = snapshot_record(&model, &scheduler);
        record.metadata.remove("description");
        let params = named_vars(model.var_map()).unwrap();
        let restored = restore_training_state(&record, &params);
        assert_eq!(restored.last_epoch, -1);
        assert!(restored.validation_metrics.is_empty());
        assert_eq!(restored.description, "");
    }

    #[test]
    fn test_load_weights_tolerates_extra_and_missing() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let params = named_vars(model.var_map()).unwrap();
        let weights = HashMap::from([
            (
                "module.heads.0.shift".to_string(),
                Tensor::new(&[2.5f64], &Device::Cpu).unwrap(),
            ),
            (
                "legacy.extra".to_string(),
                Tensor::new(&[1.0f64], &Device::Cpu).unwrap(),
            ),
        ]);
        let weights: HashMap<String, Tensor> = weights
            .into_iter()
            .map(|(k, v)| (canonical_name(&k).to_string(), v))
            .collect();
        load_weights(&params, &weights, false).unwrap();
        let shift = params
            .iter()
            .find(|(n, _)| n == "heads.0.shift")
            .unwrap()
            .1
            .as_tensor()
            .to_vec1::<f64>()
            .unwrap();
        assert_eq!(shift, vec![2.5]);
        assert!(load_weights(&params, &weights, true).is_err());
    }

    #[test]
    fn test_load_weights_shape_mismatch() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let params = named_vars(model.var_map()).unwrap();
        let weights = HashMap::from([(
            "atom_ref".to_string(),
            Tensor::zeros(3, crate::batch::FLOAT, &Device::Cpu).unwrap(),
        )]);
        assert!(load_weights(&params, &weights, false).is_err());
    }

    #[test]
    fn test_tensor_record() {
        let tensor = Tensor::new(&[[1.0f64, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let record = TensorRecord::from_tensor(&tensor).unwrap();
        assert_eq!(record.shape, vec![2, 2]);
        let back = record.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(back.to_vec2::<f64>().unwrap(), tensor.to_vec2::<f64>().unwrap());
    }
}
