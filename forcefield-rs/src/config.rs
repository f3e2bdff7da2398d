//! Configuration parsing and validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{ForceFieldError, Result};
use crate::scheduler::SchedulerKind;

/// Full run configuration, as read from a YAML file.
///
/// # Example
///
/// ```rust
/// use forcefield_rs::RunConfig;
///
/// # fn main() -> forcefield_rs::Result<()> {
/// let mut config = RunConfig::from_preset("morse")?;
/// config.training.epochs = 5;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model family and constructor arguments.
    pub model: ModelSection,

    /// Optimizer, scheduler and EMA settings.
    #[serde(default)]
    pub potential: PotentialConfig,

    /// Training loop options.
    #[serde(default)]
    pub training: TrainOptions,

    /// Dataset locations.
    #[serde(default)]
    pub data: DataConfig,

    /// Compute device (`cpu` or `cuda`).
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String {
    "cpu".into()
}

/// Model family selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Registered model identifier.
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Constructor arguments forwarded to the model builder.
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn default_model_name() -> String {
    "morse".into()
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            args: empty_args(),
        }
    }
}

/// Scheduler selection: a registered name or an explicit parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchedulerSpec {
    /// `StepLR` or `ReduceLROnPlateau`, parameterised from [`PotentialConfig`].
    Named(String),
    /// Fully specified scheduler.
    Explicit(SchedulerKind),
}

impl Default for SchedulerSpec {
    fn default() -> Self {
        Self::Named("StepLR".into())
    }
}

/// Settings of the training state wrapped around a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PotentialConfig {
    /// Adam learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// L2 penalty added to gradients.
    #[serde(default)]
    pub weight_decay: f64,

    /// Learning rate scheduler.
    #[serde(default)]
    pub scheduler: SchedulerSpec,

    /// `StepLR` period in epochs.
    #[serde(default = "default_step_size")]
    pub step_size: usize,

    /// `StepLR` decay factor.
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// `ReduceLROnPlateau` decay factor.
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// `ReduceLROnPlateau` patience in epochs.
    #[serde(default = "default_plateau_patience")]
    pub patience: usize,

    /// EMA decay.
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,

    /// Free-text description stored in checkpoints.
    #[serde(default)]
    pub description: String,
}

fn default_lr() -> f64 {
    1e-3
}
fn default_step_size() -> usize {
    10
}
fn default_gamma() -> f64 {
    0.95
}
fn default_factor() -> f64 {
    0.8
}
fn default_plateau_patience() -> usize {
    50
}
fn default_ema_decay() -> f64 {
    0.99
}

impl Default for PotentialConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: 0.0,
            scheduler: SchedulerSpec::default(),
            step_size: default_step_size(),
            gamma: default_gamma(),
            factor: default_factor(),
            patience: default_plateau_patience(),
            ema_decay: default_ema_decay(),
            description: String::new(),
        }
    }
}

impl PotentialConfig {
    /// Resolve the scheduler selection into concrete parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] for unknown scheduler names.
    pub fn scheduler_kind(&self) -> Result<SchedulerKind> {
        match &self.scheduler {
            SchedulerSpec::Explicit(kind) => Ok(kind.clone()),
            SchedulerSpec::Named(name) => match name.as_str() {
                "StepLR" => Ok(SchedulerKind::StepLR {
                    step_size: self.step_size,
                    gamma: self.gamma,
                }),
                "ReduceLROnPlateau" => Ok(SchedulerKind::ReduceLROnPlateau {
                    factor: self.factor,
                    patience: self.patience,
                    threshold: crate::scheduler::DEFAULT_PLATEAU_THRESHOLD,
                }),
                other => Err(ForceFieldError::invalid_config(format!(
                    "unknown scheduler `{other}`; supported schedulers: `StepLR`, `ReduceLROnPlateau`"
                ))),
            },
        }
    }

    /// Validate numeric ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0) {
            return Err(ForceFieldError::invalid_config("lr must be positive"));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(ForceFieldError::invalid_config(
                "ema_decay must be in [0, 1]",
            ));
        }
        if self.weight_decay < 0.0 {
            return Err(ForceFieldError::invalid_config(
                "weight_decay must be non-negative",
            ));
        }
        self.scheduler_kind()?.validate()
    }
}

/// A physical quantity the engine can fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    /// Total energy.
    Energy,
    /// Atomic forces.
    Forces,
    /// Cell stress.
    Stress,
}

/// Elementwise loss applied to each quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Mean squared error.
    #[default]
    Mse,
    /// Mean absolute error.
    L1,
    /// Huber loss with unit threshold.
    Huber,
}

/// Validation metric used for best-checkpoint selection and early stopping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SelectionMetric {
    /// Validation loss.
    #[default]
    ValLoss,
    /// Validation energy MAE.
    ValMaeE,
    /// Validation force MAE.
    ValMaeF,
    /// Validation stress MAE.
    ValMaeS,
}

impl SelectionMetric {
    /// Accepted metric names, in result-tuple order.
    pub const NAMES: [&'static str; 4] = ["val_loss", "val_mae_e", "val_mae_f", "val_mae_s"];

    /// Parse a metric name.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] listing the accepted names.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "val_loss" => Ok(Self::ValLoss),
            "val_mae_e" => Ok(Self::ValMaeE),
            "val_mae_f" => Ok(Self::ValMaeF),
            "val_mae_s" => Ok(Self::ValMaeS),
            other => Err(ForceFieldError::invalid_config(format!(
                "`{other}` metric name not supported. supported metrics: `val_loss`, `val_mae_e`, `val_mae_f`, `val_mae_s`"
            ))),
        }
    }

    /// Configuration name of the metric.
    pub fn name(self) -> &'static str {
        Self::NAMES[self.index()]
    }

    /// Position of the metric in a `(loss, mae_e, mae_f, mae_s)` tuple.
    pub fn index(self) -> usize {
        match self {
            Self::ValLoss => 0,
            Self::ValMaeE => 1,
            Self::ValMaeF => 2,
            Self::ValMaeS => 3,
        }
    }

    /// Key under which the metric is stored in checkpoint validation metrics.
    pub fn saved_key(self) -> &'static str {
        match self {
            Self::ValLoss => "loss",
            Self::ValMaeE => "MAE_energy",
            Self::ValMaeF => "MAE_force",
            Self::ValMaeS => "MAE_stress",
        }
    }
}

impl fmt::Display for SelectionMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for SelectionMetric {
    type Error = ForceFieldError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_name(&value)
    }
}

impl From<SelectionMetric> for String {
    fn from(metric: SelectionMetric) -> Self {
        metric.name().to_string()
    }
}

/// Options of a training run.
///
/// # Example
///
/// ```rust
/// use forcefield_rs::TrainOptions;
///
/// let options = TrainOptions {
///     epochs: 20,
///     include_forces: true,
///     ..Default::default()
/// };
/// assert_eq!(options.force_loss_ratio, 1.0);
/// assert_eq!(options.stress_loss_ratio, 0.1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOptions {
    /// Elementwise loss.
    #[serde(default)]
    pub loss: LossKind,

    /// Fit energies.
    #[serde(default = "default_true")]
    pub include_energy: bool,

    /// Fit forces.
    #[serde(default)]
    pub include_forces: bool,

    /// Fit stresses.
    #[serde(default)]
    pub include_stresses: bool,

    /// Weight of the force term.
    #[serde(default = "default_force_ratio")]
    pub force_loss_ratio: f64,

    /// Weight of the stress term.
    #[serde(default = "default_stress_ratio")]
    pub stress_loss_ratio: f64,

    /// Exclusive upper bound on the epoch index.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Epochs without improvement before stopping.
    #[serde(default = "default_early_stop")]
    pub early_stop_patience: usize,

    /// Metric driving checkpoint selection.
    #[serde(default)]
    pub metric_name: SelectionMetric,

    /// Persist best, periodic and last checkpoints.
    #[serde(default)]
    pub save_checkpoint: bool,

    /// Checkpoint directory.
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,

    /// Periodic checkpoint interval in epochs.
    #[serde(default = "default_ckpt_interval")]
    pub ckpt_interval: usize,

    /// Train one head per dataset.
    #[serde(default)]
    pub multi_head: bool,

    /// Dataset names, one per training source in multi-head mode.
    #[serde(default)]
    pub dataset_names: Vec<String>,

    /// Quantities skipped for a named dataset.
    #[serde(default = "default_excluded")]
    pub excluded_quantities: BTreeMap<String, Vec<Quantity>>,

    /// Checkpoint with the rank-zero writer and in-memory best tracking.
    #[serde(default)]
    pub is_distributed: bool,

    /// Base seed for shard, sampler and interleave shuffles.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Structures per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Show a progress bar per epoch.
    #[serde(default)]
    pub progress_bar: bool,
}

fn default_true() -> bool {
    true
}
fn default_force_ratio() -> f64 {
    1.0
}
fn default_stress_ratio() -> f64 {
    0.1
}
fn default_epochs() -> usize {
    100
}
fn default_early_stop() -> usize {
    100
}
fn default_save_path() -> PathBuf {
    PathBuf::from("./results/")
}
fn default_ckpt_interval() -> usize {
    10
}
fn default_excluded() -> BTreeMap<String, Vec<Quantity>> {
    BTreeMap::from([("QM9".to_string(), vec![Quantity::Forces])])
}
fn default_seed() -> u64 {
    42
}
fn default_batch_size() -> usize {
    32
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            loss: LossKind::default(),
            include_energy: true,
            include_forces: false,
            include_stresses: false,
            force_loss_ratio: default_force_ratio(),
            stress_loss_ratio: default_stress_ratio(),
            epochs: default_epochs(),
            early_stop_patience: default_early_stop(),
            metric_name: SelectionMetric::default(),
            save_checkpoint: false,
            save_path: default_save_path(),
            ckpt_interval: default_ckpt_interval(),
            multi_head: false,
            dataset_names: Vec::new(),
            excluded_quantities: default_excluded(),
            is_distributed: false,
            seed: default_seed(),
            batch_size: default_batch_size(),
            progress_bar: false,
        }
    }
}

impl TrainOptions {
    /// Whether `quantity` is fitted for the dataset called `dataset`.
    pub fn includes(&self, quantity: Quantity, dataset: Option<&str>) -> bool {
        let requested = match quantity {
            Quantity::Energy => self.include_energy,
            Quantity::Forces => self.include_forces,
            Quantity::Stress => self.include_stresses,
        };
        let excluded = dataset
            .and_then(|name| self.excluded_quantities.get(name))
            .is_some_and(|skipped| skipped.contains(&quantity));
        requested && !excluded
    }

    /// Validate option ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if an option is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(self.include_energy || self.include_forces || self.include_stresses) {
            return Err(ForceFieldError::invalid_config(
                "at least one of include_energy, include_forces, include_stresses must be set",
            ));
        }
        if self.ckpt_interval == 0 {
            return Err(ForceFieldError::invalid_config(
                "ckpt_interval must be at least 1",
            ));
        }
        if self.batch_size == 0 {
            return Err(ForceFieldError::invalid_config(
                "batch_size must be at least 1",
            ));
        }
        for (name, ratio) in [
            ("force_loss_ratio", self.force_loss_ratio),
            ("stress_loss_ratio", self.stress_loss_ratio),
        ] {
            if !ratio.is_finite() || ratio < 0.0 {
                return Err(ForceFieldError::invalid_config(format!(
                    "{name} must be a non-negative number, got {ratio}"
                )));
            }
        }
        if self.multi_head && self.dataset_names.is_empty() {
            return Err(ForceFieldError::invalid_config(
                "multi-head training requires dataset_names",
            ));
        }
        Ok(())
    }
}

/// Dataset locations.
///
/// Every path is a JSON array of [`crate::batch::GraphRecord`]s.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// Training files. One per dataset in multi-head mode, or the shard list
    /// when streaming.
    #[serde(default)]
    pub train: Vec<PathBuf>,

    /// Validation files, matched to `train` in multi-head mode.
    #[serde(default)]
    pub val: Vec<PathBuf>,

    /// Load training shards from disk one at a time.
    #[serde(default)]
    pub streaming: bool,
}

impl RunConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"morse"` - single-head Morse pair potential fitting energies and forces
    /// - `"morse-multi-head"` - two-head Morse potential over two datasets
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] for unknown presets.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "morse" => Ok(Self::morse_preset()),
            "morse-multi-head" => Ok(Self::morse_multi_head_preset()),
            _ => Err(ForceFieldError::invalid_config(format!(
                "unknown preset `{preset}`; available presets: `morse`, `morse-multi-head`"
            ))),
        }
    }

    /// Single-head Morse preset.
    #[must_use]
    pub fn morse_preset() -> Self {
        Self {
            model: ModelSection {
                name: "morse".into(),
                args: serde_json::json!({ "num_terms": 2, "num_species": 8, "cutoff": 5.0 }),
            },
            potential: PotentialConfig::default(),
            training: TrainOptions {
                include_forces: true,
                save_checkpoint: true,
                ..Default::default()
            },
            data: DataConfig {
                train: vec![PathBuf::from("./data/train.json")],
                val: vec![PathBuf::from("./data/val.json")],
                streaming: false,
            },
            device: default_device(),
        }
    }

    /// Two-head Morse preset.
    #[must_use]
    pub fn morse_multi_head_preset() -> Self {
        Self {
            model: ModelSection {
                name: "morse".into(),
                args: serde_json::json!({
                    "num_terms": 2,
                    "num_species": 8,
                    "cutoff": 5.0,
                    "num_heads": 2
                }),
            },
            potential: PotentialConfig::default(),
            training: TrainOptions {
                include_forces: true,
                multi_head: true,
                dataset_names: vec!["MPF".into(), "QM9".into()],
                ..Default::default()
            },
            data: DataConfig {
                train: vec![
                    PathBuf::from("./data/mpf_train.json"),
                    PathBuf::from("./data/qm9_train.json"),
                ],
                val: vec![
                    PathBuf::from("./data/mpf_val.json"),
                    PathBuf::from("./data/qm9_val.json"),
                ],
                streaming: false,
            },
            device: default_device(),
        }
    }

    /// Resolve the configured compute device. `cuda` falls back to the CPU
    /// with a warning when the crate was built without CUDA or no GPU answers.
    pub fn resolve_device(&self) -> Device {
        if self.device != "cuda" {
            return Device::Cpu;
        }
        if !cfg!(feature = "cuda") {
            tracing::warn!("CUDA feature disabled; falling back to CPU. Enable with --features cuda.");
            return Device::Cpu;
        }
        match Device::cuda_if_available(0) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device 0)");
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                Device::Cpu
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Checks for:
    /// - Option ranges of every section
    /// - Matching dataset counts in multi-head mode
    /// - Streaming shards are not combined with multi-head training
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.potential.validate()?;
        self.training.validate()?;

        if self.data.train.is_empty() {
            return Err(ForceFieldError::invalid_config(
                "data.train must list at least one file",
            ));
        }
        if self.training.multi_head {
            if self.data.streaming {
                return Err(ForceFieldError::invalid_config(
                    "streaming shards are not supported for multi-head training",
                ));
            }
            let names = self.training.dataset_names.len();
            if self.data.train.len() != names || self.data.val.len() != names {
                return Err(ForceFieldError::invalid_config(format!(
                    "multi-head training needs one train and one val file per dataset: \
                     {names} names, {} train, {} val",
                    self.data.train.len(),
                    self.data.val.len()
                )));
            }
        }
        if !matches!(self.device.as_str(), "cpu" | "cuda") {
            return Err(ForceFieldError::invalid_config(format!(
                "unknown device `{}`; expected `cpu` or `cuda`",
                self.device
            )));
        }
        Ok(())
    }
}
