//! Training state wrapped around an energy model.
//!
//! A [`Potential`] owns the model together with everything that evolves while
//! it trains: the Adam optimizer, the learning rate scheduler, the EMA shadow
//! weights, the set of frozen parameters and the epoch bookkeeping persisted
//! in checkpoints.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use serde::Serialize;

use crate::batch::{split_per_structure, GraphBatch};
use crate::checkpoint::{
    load_weights, restore_training_state, CheckpointRecord, RestoreReport, TrainingSnapshot,
};
use crate::config::{PotentialConfig, RunConfig};
use crate::ema::ExponentialMovingAverage;
use crate::engine::{self, ForwardOutput};
use crate::error::{ForceFieldError, Result};
use crate::model::{named_vars, parameter_count, EnergyModel, ModelRegistry};
use crate::optimizer::{clip_grad_norm, Adam, AdamConfig};
use crate::scheduler::LRScheduler;

/// Largest global gradient norm applied by a training step.
pub const MAX_GRAD_NORM: f64 = 1.0;

/// Prefix of output head parameters in multi-head models. Head `k` lives
/// under `heads.{k}.` and the head count is the `num_heads` argument.
pub const HEAD_PREFIX: &str = "heads.";

/// Per-structure predictions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Predictions {
    /// Total energy per structure.
    pub energies: Vec<f64>,
    /// Forces per structure, one row per atom. Empty unless requested.
    pub forces: Vec<Vec<[f64; 3]>>,
    /// Stress per structure in GPa. Empty unless requested.
    pub stresses: Vec<[[f64; 3]; 3]>,
}

/// A model with its optimizer, scheduler and EMA.
///
/// # Example
///
/// ```rust
/// use candle_core::Device;
/// use forcefield_rs::{Potential, PotentialConfig};
///
/// # fn main() -> forcefield_rs::Result<()> {
/// let args = serde_json::json!({ "num_terms": 1, "num_species": 4 });
/// let potential = Potential::new("morse", &args, &PotentialConfig::default(), &Device::Cpu)?;
/// assert_eq!(potential.model_name(), "morse");
/// assert_eq!(potential.last_epoch(), -1);
/// # Ok(())
/// # }
/// ```
pub struct Potential {
    model_name: String,
    model: Box<dyn EnergyModel>,
    optimizer: Adam,
    scheduler: LRScheduler,
    ema: ExponentialMovingAverage,
    frozen: BTreeSet<String>,
    last_epoch: i64,
    validation_metrics: BTreeMap<String, f64>,
    description: String,
    device: Device,
    restore_report: Option<RestoreReport>,
}

impl Potential {
    /// Build the model registered as `model_name` and wrap it with fresh
    /// training state.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::UnsupportedModel`] for unknown or
    /// unsupported model families and [`ForceFieldError::InvalidConfig`] for
    /// bad settings.
    pub fn new(
        model_name: &str,
        args: &serde_json::Value,
        config: &PotentialConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::with_registry(&ModelRegistry::with_defaults(), model_name, args, config, device)
    }

    /// Like [`Potential::new`], resolving the model through `registry`.
    pub fn with_registry(
        registry: &ModelRegistry,
        model_name: &str,
        args: &serde_json::Value,
        config: &PotentialConfig,
        device: &Device,
    ) -> Result<Self> {
        let model = registry.build(model_name, args, device)?;
        Self::with_model(model_name, model, config, device)
    }

    /// Wrap an already built model.
    pub fn with_model(
        model_name: &str,
        model: Box<dyn EnergyModel>,
        config: &PotentialConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let params = named_vars(model.var_map())?;
        let optimizer = Adam::new(
            params.clone(),
            AdamConfig {
                learning_rate: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        );
        let scheduler = LRScheduler::new(config.scheduler_kind()?, config.lr);
        let ema = ExponentialMovingAverage::new(params, config.ema_decay)?;
        Ok(Self {
            model_name: model_name.to_string(),
            model,
            optimizer,
            scheduler,
            ema,
            frozen: BTreeSet::new(),
            last_epoch: -1,
            validation_metrics: BTreeMap::from([("loss".to_string(), 10_000.0)]),
            description: config.description.clone(),
            device: device.clone(),
            restore_report: None,
        })
    }

    /// Build from a run configuration.
    pub fn from_config(config: &RunConfig, device: &Device) -> Result<Self> {
        Self::new(&config.model.name, &config.model.args, &config.potential, device)
    }

    /// Model identifier.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Wrapped model.
    pub fn model(&self) -> &dyn EnergyModel {
        self.model.as_ref()
    }

    /// Device of the model parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Optimizer.
    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Scheduler.
    pub fn scheduler(&self) -> &LRScheduler {
        &self.scheduler
    }

    /// EMA shadow weights.
    pub fn ema(&self) -> &ExponentialMovingAverage {
        &self.ema
    }

    /// Last completed epoch, -1 before training.
    pub fn last_epoch(&self) -> i64 {
        self.last_epoch
    }

    /// Record the last completed epoch.
    pub fn set_last_epoch(&mut self, epoch: i64) {
        self.last_epoch = epoch;
    }

    /// Validation metrics of the last epoch, keyed as in checkpoints.
    pub fn validation_metrics(&self) -> &BTreeMap<String, f64> {
        &self.validation_metrics
    }

    /// Replace the validation metrics.
    pub fn set_validation_metrics(&mut self, metrics: BTreeMap<String, f64>) {
        self.validation_metrics = metrics;
    }

    /// Free-text description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Set the free-text description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// Parameters excluded from optimisation.
    pub fn frozen(&self) -> &BTreeSet<String> {
        &self.frozen
    }

    /// How auxiliary state was restored by the last [`Potential::load`].
    pub fn restore_report(&self) -> Option<&RestoreReport> {
        self.restore_report.as_ref()
    }

    /// Named model parameters.
    pub fn parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(self.model.var_map())
    }

    /// Number of scalar parameters not frozen.
    pub fn trainable_parameter_count(&self) -> Result<usize> {
        let params = self.parameters()?;
        Ok(parameter_count(
            params.iter().filter(|(name, _)| !self.frozen.contains(name)),
        ))
    }

    /// Switch the model between training and evaluation mode.
    pub fn set_training(&mut self, training: bool) {
        self.model.set_training(training);
    }

    /// Energies, and forces and stresses as requested, for one batch.
    pub fn evaluate(
        &self,
        batch: &GraphBatch,
        include_forces: bool,
        include_stresses: bool,
        head: Option<usize>,
    ) -> Result<ForwardOutput> {
        engine::evaluate(self.model.as_ref(), batch, include_forces, include_stresses, head)
    }

    /// Clip `grads`, step the optimizer and update the EMA. Returns the
    /// gradient norm before clipping.
    pub fn apply_gradients(&mut self, grads: &mut GradStore) -> Result<f64> {
        let params = self.parameters()?;
        let norm = clip_grad_norm(grads, &params, &self.frozen, MAX_GRAD_NORM)?;
        self.optimizer.step(grads, &self.frozen)?;
        self.ema.update(&self.frozen)?;
        Ok(norm)
    }

    /// Step the learning rate scheduler once. `val_loss` feeds the plateau
    /// scheduler.
    pub fn step_scheduler(&mut self, val_loss: f64) -> Result<()> {
        self.scheduler.step(Some(&mut self.optimizer), Some(val_loss))
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.scheduler.get_last_lr()
    }

    /// Run `f` with the EMA weights loaded into the model. The raw weights
    /// are put back afterwards, also when `f` fails.
    pub fn with_ema_weights<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let backup = self.ema.swap_in()?;
        let result = f(self);
        backup.restore()?;
        result
    }

    /// Freeze everything except the last `layers` interaction layers and the
    /// output heads. `-1` trains every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::UnsupportedModel`] when the model cannot be
    /// partially fine-tuned, and [`ForceFieldError::InvalidConfig`] unless
    /// `layers` is -1 or below the model's layer count.
    pub fn finetune_mode(&mut self, layers: i64, reset_heads: bool) -> Result<()> {
        if !self.model.capabilities().finetune {
            return Err(ForceFieldError::unsupported(format!(
                "`{}` does not support freezing layers",
                self.model_name
            )));
        }
        let num_layers = self.model.num_layers();
        match usize::try_from(layers) {
            Err(_) if layers == -1 => {
                tracing::info!("Fine-tuning all layers");
                self.frozen.clear();
            }
            Ok(k) if k < num_layers => {
                tracing::info!("Fine-tuning the last {k} layers");
                let trainable: BTreeSet<String> =
                    self.model.finetune_parameters(k)?.into_iter().collect();
                self.frozen = self
                    .parameters()?
                    .into_iter()
                    .map(|(name, _)| name)
                    .filter(|name| !trainable.contains(name))
                    .collect();
            }
            _ => {
                return Err(ForceFieldError::invalid_config(format!(
                    "finetune layers should be -1 or a non-negative integer below {num_layers}, got {layers}"
                )));
            }
        }
        if reset_heads {
            self.model.reset_heads()?;
        }
        Ok(())
    }

    /// Capture the complete training state.
    pub fn checkpoint(&self) -> Result<CheckpointRecord> {
        CheckpointRecord::capture(&TrainingSnapshot {
            model_name: &self.model_name,
            model: self.model.as_ref(),
            optimizer: Some(&self.optimizer),
            scheduler: &self.scheduler,
            ema: Some(&self.ema),
            last_epoch: self.last_epoch,
            validation_metrics: &self.validation_metrics,
            description: &self.description,
        })
    }

    /// Write the complete training state to `path` atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.checkpoint()?.write(path.as_ref())?;
        tracing::debug!("Saved checkpoint to {}", path.as_ref().display());
        Ok(())
    }

    /// Load a checkpoint written for `model_name`.
    ///
    /// Weights and model arguments must load. With `load_training_state`,
    /// optimizer, scheduler, EMA and epoch metadata are restored where
    /// possible; anything that cannot be restored is replaced by a fresh
    /// default and noted in [`Potential::restore_report`].
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::CheckpointMismatch`] when the checkpoint
    /// belongs to another model identifier.
    pub fn load<P: AsRef<Path>>(
        model_name: &str,
        path: P,
        device: &Device,
        load_training_state: bool,
    ) -> Result<Self> {
        Self::load_with_registry(
            &ModelRegistry::with_defaults(),
            model_name,
            path,
            device,
            load_training_state,
        )
    }

    /// Like [`Potential::load`], resolving the model through `registry`.
    pub fn load_with_registry<P: AsRef<Path>>(
        registry: &ModelRegistry,
        model_name: &str,
        path: P,
        device: &Device,
        load_training_state: bool,
    ) -> Result<Self> {
        tracing::info!("Loading the model from {}", path.as_ref().display());
        let record = CheckpointRecord::read(path, device)?;
        let found = record.model_name()?;
        if found != model_name {
            return Err(ForceFieldError::CheckpointMismatch {
                requested: model_name.to_string(),
                found,
            });
        }

        let mut model = registry.build(model_name, &record.model_args()?, device)?;
        let params = named_vars(model.var_map())?;
        load_weights(&params, &record.weights(), false)?;
        model.set_training(false);

        let mut potential = Self::with_model(model_name, model, &PotentialConfig::default(), device)?;
        if !load_training_state {
            potential.validation_metrics = BTreeMap::from([("loss".to_string(), 0.0)]);
            potential.restore_report = Some(RestoreReport::skipped());
            return Ok(potential);
        }

        let restored = restore_training_state(&record, &params);
        if let Some(optimizer) = restored.optimizer {
            potential.optimizer = optimizer;
        }
        if let Some(ema) = restored.ema {
            potential.ema = ema;
        }
        potential.scheduler = restored.scheduler;
        potential
            .optimizer
            .set_learning_rate(potential.scheduler.get_last_lr());
        potential.last_epoch = restored.last_epoch;
        potential.validation_metrics = restored.validation_metrics;
        potential.description = restored.description;
        potential.restore_report = Some(restored.report);
        Ok(potential)
    }

    /// Load one head of a multi-head checkpoint into a single-head model.
    ///
    /// Head `head` becomes head 0 of the new model. With `head = -1` every
    /// head is dropped and left freshly initialised. All other parameters
    /// must be present in the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] when `head` does not exist,
    /// or a checkpoint error when shared parameters are missing.
    pub fn load_from_multi_head_model<P: AsRef<Path>>(
        model_name: &str,
        head: i64,
        path: P,
        device: &Device,
    ) -> Result<Self> {
        let registry = ModelRegistry::with_defaults();
        let record = CheckpointRecord::read(path, device)?;
        let found = record.model_name()?;
        if found != model_name {
            return Err(ForceFieldError::CheckpointMismatch {
                requested: model_name.to_string(),
                found,
            });
        }

        let mut args = record.model_args()?;
        let num_heads = args
            .get("num_heads")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);
        let keep = match u64::try_from(head) {
            Ok(k) if k < num_heads => Some(k),
            Err(_) if head == -1 => {
                tracing::info!("Resetting the output heads");
                None
            }
            _ => {
                return Err(ForceFieldError::invalid_config(format!(
                    "head {head} requested from a checkpoint with {num_heads} heads"
                )));
            }
        };
        if let Some(obj) = args.as_object_mut() {
            obj.insert("num_heads".into(), 1.into());
        }

        let weights = single_head_weights(record.weights(), keep);
        let mut model = registry.build(model_name, &args, device)?;
        let params = named_vars(model.var_map())?;
        let (head_params, shared): (Vec<_>, Vec<_>) = params
            .into_iter()
            .partition(|(name, _)| name.starts_with(HEAD_PREFIX));
        load_weights(&shared, &weights.shared, true)?;
        load_weights(&head_params, &weights.head, keep.is_some())?;
        model.set_training(false);

        let mut potential = Self::with_model(model_name, model, &PotentialConfig::default(), device)?;
        potential.description = record.get("description").unwrap_or_default();
        Ok(potential)
    }

    /// Predict energies, and forces and stresses as requested, structure by
    /// structure.
    pub fn predict_properties(
        &mut self,
        batches: &[GraphBatch],
        include_forces: bool,
        include_stresses: bool,
    ) -> Result<Predictions> {
        self.set_training(false);
        let mut predictions = Predictions::default();
        for batch in batches {
            let batch = batch.to_device(&self.device)?;
            let output = self.evaluate(&batch, include_forces, include_stresses, None)?;
            predictions.energies.extend(output.energy.to_vec1::<f64>()?);
            if include_forces {
                for forces in split_per_structure(output.forces()?, &batch.num_atoms)? {
                    predictions.forces.push(rows3(&forces)?);
                }
            }
            if include_stresses {
                for stress in output.stresses()?.to_vec3::<f64>()? {
                    predictions.stresses.push(matrix3(&stress)?);
                }
            }
        }
        Ok(predictions)
    }
}

struct SplitWeights {
    shared: HashMap<String, Tensor>,
    head: HashMap<String, Tensor>,
}

/// Separate head weights from shared ones, keeping head `keep` as head 0.
fn single_head_weights(weights: HashMap<String, Tensor>, keep: Option<u64>) -> SplitWeights {
    let mut split = SplitWeights {
        shared: HashMap::new(),
        head: HashMap::new(),
    };
    for (name, tensor) in weights {
        let Some(rest) = name.strip_prefix(HEAD_PREFIX) else {
            split.shared.insert(name, tensor);
            continue;
        };
        let Some((index, param)) = rest.split_once('.') else {
            continue;
        };
        if keep.is_some_and(|k| index == k.to_string()) {
            split.head.insert(format!("{HEAD_PREFIX}0.{param}"), tensor);
        }
    }
    split
}

fn rows3(t: &Tensor) -> Result<Vec<[f64; 3]>> {
    t.to_vec2::<f64>()?
        .into_iter()
        .map(|row| {
            <[f64; 3]>::try_from(row.as_slice())
                .map_err(|_| ForceFieldError::invalid_batch("expected 3 components per row"))
        })
        .collect()
}

fn matrix3(m: &[Vec<f64>]) -> Result<[[f64; 3]; 3]> {
    let mut out = [[0.0; 3]; 3];
    if m.len() != 3 {
        return Err(ForceFieldError::invalid_batch("expected a 3x3 matrix"));
    }
    for (row, values) in out.iter_mut().zip(m) {
        *row = <[f64; 3]>::try_from(values.as_slice())
            .map_err(|_| ForceFieldError::invalid_batch("expected a 3x3 matrix"))?;
    }
    Ok(out)
}
