//! Energy model interface and model registry.
//!
//! The engine treats the model as an opaque function from a structure batch
//! to per-structure total energies. Everything it needs beyond that (which
//! derived quantities may be requested, how to rebuild the model from a
//! checkpoint, which parameters to keep trainable when fine-tuning) is
//! negotiated through [`EnergyModel`] once, when the model is built.

pub mod morse;

use std::collections::BTreeMap;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

use crate::batch::GraphBatch;
use crate::error::{ForceFieldError, Result};

pub use morse::{MorseConfig, MorsePotential};

/// Derived quantities and training modes a model supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Energy is differentiable with respect to positions.
    pub forces: bool,
    /// Energy is differentiable with respect to the cell.
    pub stress: bool,
    /// Model exposes layered parameters for partial fine-tuning.
    pub finetune: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            forces: true,
            stress: true,
            finetune: false,
        }
    }
}

/// A learnable potential energy model.
pub trait EnergyModel {
    /// Per-structure total energy, shape `(B,)`.
    ///
    /// `head` selects the output branch of a multi-head model; `None` uses
    /// the default head.
    fn forward(&self, batch: &GraphBatch, head: Option<usize>) -> Result<Tensor>;

    /// Constructor arguments sufficient to rebuild an untrained model of the
    /// same shape.
    fn model_args(&self) -> Result<serde_json::Value>;

    /// Parameter storage.
    fn var_map(&self) -> &VarMap;

    /// Supported derived quantities.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Switch between training and evaluation behaviour.
    fn set_training(&mut self, training: bool);

    /// Whether the model is in training mode.
    fn is_training(&self) -> bool;

    /// Number of output heads.
    fn num_heads(&self) -> usize {
        1
    }

    /// Number of interaction layers available for fine-tuning.
    fn num_layers(&self) -> usize {
        0
    }

    /// Parameter names left trainable when fine-tuning the last `layers`
    /// interaction layers. Output heads are always included.
    fn finetune_parameters(&self, _layers: usize) -> Result<Vec<String>> {
        Err(ForceFieldError::unsupported(
            "model does not support partial fine-tuning",
        ))
    }

    /// Re-initialise the output heads.
    fn reset_heads(&mut self) -> Result<()> {
        Err(ForceFieldError::unsupported(
            "model does not support resetting its output heads",
        ))
    }
}

/// Named parameters of a model, sorted by name.
pub fn named_vars(var_map: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| ForceFieldError::training("parameter map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Total number of scalar parameters in `vars`.
pub fn parameter_count<'a>(vars: impl IntoIterator<Item = &'a (String, Var)>) -> usize {
    vars.into_iter().map(|(_, var)| var.elem_count()).sum()
}

/// Builds a boxed model from constructor arguments.
pub type ModelBuilder = Box<dyn Fn(&serde_json::Value, &Device) -> Result<Box<dyn EnergyModel>>>;

/// Model families known to the engine but not implemented by it.
const UNSUPPORTED_FAMILIES: [&str; 2] = ["graphormer", "geomformer"];

/// Outcome of resolving a model identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelKind {
    /// A registered, buildable model family.
    Registered(String),
    /// A family this engine does not implement.
    Unsupported {
        /// Requested identifier.
        name: String,
        /// Why it cannot be built.
        reason: String,
    },
}

impl ModelKind {
    /// The resolved identifier, or [`ForceFieldError::UnsupportedModel`].
    pub fn into_supported(self) -> Result<String> {
        match self {
            Self::Registered(name) => Ok(name),
            Self::Unsupported { name, reason } => {
                Err(ForceFieldError::unsupported(format!("{name}: {reason}")))
            }
        }
    }
}

/// Maps model identifiers to builders.
///
/// # Example
///
/// ```rust
/// use candle_core::Device;
/// use forcefield_rs::model::ModelRegistry;
///
/// # fn main() -> forcefield_rs::Result<()> {
/// let registry = ModelRegistry::with_defaults();
/// let model = registry.build("morse", &serde_json::json!({ "num_terms": 1 }), &Device::Cpu)?;
/// assert_eq!(model.num_layers(), 1);
/// assert!(registry.build("graphormer", &serde_json::json!({}), &Device::Cpu).is_err());
/// # Ok(())
/// # }
/// ```
pub struct ModelRegistry {
    builders: BTreeMap<String, ModelBuilder>,
}

impl ModelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry with the built-in model families.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("morse", |args, device| {
            let config = MorseConfig::from_args(args)?;
            Ok(Box::new(MorsePotential::new(config, device)?) as Box<dyn EnergyModel>)
        });
        registry
    }

    /// Register a builder under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&serde_json::Value, &Device) -> Result<Box<dyn EnergyModel>> + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
    }

    /// Registered identifiers.
    pub fn names(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }

    /// Resolve an identifier without building anything.
    pub fn resolve(&self, name: &str) -> ModelKind {
        if UNSUPPORTED_FAMILIES.contains(&name) {
            ModelKind::Unsupported {
                name: name.to_string(),
                reason: "transformer model families are not supported by this engine".into(),
            }
        } else if self.builders.contains_key(name) {
            ModelKind::Registered(name.to_string())
        } else {
            ModelKind::Unsupported {
                name: name.to_string(),
                reason: format!("not registered; known models: {}", self.names().join(", ")),
            }
        }
    }

    /// Build the model registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::UnsupportedModel`] for unknown or
    /// unsupported families, or the builder's own error.
    pub fn build(
        &self,
        name: &str,
        args: &serde_json::Value,
        device: &Device,
    ) -> Result<Box<dyn EnergyModel>> {
        let name = self.resolve(name).into_supported()?;
        let builder = self
            .builders
            .get(&name)
            .ok_or_else(|| ForceFieldError::unsupported(name.clone()))?;
        builder(args, device)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
