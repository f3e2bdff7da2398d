//! Adam optimizer with inspectable moment state, and global-norm clipping.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{ForceFieldError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
        }
    }
}

/// Per-parameter moment estimates.
#[derive(Debug, Clone)]
pub struct MomentState {
    /// Number of updates applied to the parameter.
    pub step: u64,
    /// First moment.
    pub exp_avg: Tensor,
    /// Second moment.
    pub exp_avg_sq: Tensor,
}

/// Non-tensor optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamMeta {
    /// Hyperparameters, including the current learning rate.
    pub config: AdamConfig,
    /// Update count of every parameter with moment state.
    pub steps: BTreeMap<String, u64>,
}

/// Adam with bias correction and L2 weight decay.
pub struct Adam {
    config: AdamConfig,
    params: Vec<(String, Var)>,
    state: BTreeMap<String, MomentState>,
}

impl Adam {
    /// Create an optimizer over named parameters.
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> Self {
        Self {
            config,
            params,
            state: BTreeMap::new(),
        }
    }

    /// Rebuild an optimizer from saved state.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::Checkpoint`] when the state references an
    /// unknown parameter, lacks a moment tensor, or has a mismatched shape.
    pub fn from_state(
        params: Vec<(String, Var)>,
        meta: AdamMeta,
        mut exp_avg: HashMap<String, Tensor>,
        mut exp_avg_sq: HashMap<String, Tensor>,
    ) -> Result<Self> {
        let mut state = BTreeMap::new();
        for (name, step) in meta.steps {
            let var = params
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    ForceFieldError::checkpoint(format!("optimizer state for unknown parameter `{name}`"))
                })?;
            let take = |moments: &mut HashMap<String, Tensor>, what: &str| -> Result<Tensor> {
                let tensor = moments.remove(&name).ok_or_else(|| {
                    ForceFieldError::checkpoint(format!("missing {what} for `{name}`"))
                })?;
                if tensor.dims() != var.dims() {
                    return Err(ForceFieldError::checkpoint(format!(
                        "{what} for `{name}` has shape {:?}, parameter has {:?}",
                        tensor.dims(),
                        var.dims()
                    )));
                }
                Ok(tensor.to_device(var.device())?.to_dtype(var.dtype())?)
            };
            let m = take(&mut exp_avg, "exp_avg")?;
            let v = take(&mut exp_avg_sq, "exp_avg_sq")?;
            state.insert(
                name,
                MomentState {
                    step,
                    exp_avg: m,
                    exp_avg_sq: v,
                },
            );
        }
        Ok(Self {
            config: meta.config,
            params,
            state,
        })
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Hyperparameters.
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Moment state by parameter name.
    pub fn state(&self) -> &BTreeMap<String, MomentState> {
        &self.state
    }

    /// Non-tensor state for persistence.
    pub fn meta(&self) -> AdamMeta {
        AdamMeta {
            config: self.config.clone(),
            steps: self
                .state
                .iter()
                .map(|(name, s)| (name.clone(), s.step))
                .collect(),
        }
    }

    /// Apply one update to every parameter that has a gradient and is not
    /// frozen.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn step(&mut self, grads: &GradStore, frozen: &BTreeSet<String>) -> Result<()> {
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        for (name, var) in &self.params {
            if frozen.contains(name) {
                continue;
            }
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let param = var.as_tensor().detach();
            let mut grad = grad.detach();
            if weight_decay != 0.0 {
                grad = (grad + (&param * weight_decay)?)?;
            }

            let entry = match self.state.remove(name) {
                Some(entry) => entry,
                None => MomentState {
                    step: 0,
                    exp_avg: param.zeros_like()?,
                    exp_avg_sq: param.zeros_like()?,
                },
            };
            let step = entry.step + 1;
            let exp_avg = ((entry.exp_avg * beta1)? + (&grad * (1.0 - beta1))?)?;
            let exp_avg_sq = ((entry.exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let bias1 = 1.0 - beta1.powi(step as i32);
            let bias2 = 1.0 - beta2.powi(step as i32);
            let denom = ((exp_avg_sq.sqrt()? / bias2.sqrt())? + eps)?;
            let update = ((&exp_avg / &denom)? * (learning_rate / bias1))?;
            var.set(&(param - update)?)?;

            self.state.insert(
                name.clone(),
                MomentState {
                    step,
                    exp_avg,
                    exp_avg_sq,
                },
            );
        }
        Ok(())
    }
}

/// Global L2 norm of the gradients of trainable parameters.
pub fn compute_grad_norm(
    grads: &GradStore,
    params: &[(String, Var)],
    frozen: &BTreeSet<String>,
) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for (name, var) in params {
        if frozen.contains(name) {
            continue;
        }
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_norm_sq += grad.detach().sqr()?.sum_all()?.to_scalar::<f64>()?;
        }
    }
    Ok(total_norm_sq.sqrt())
}

/// Clip gradients by global norm. Returns the norm before clipping.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    params: &[(String, Var)],
    frozen: &BTreeSet<String>,
    max_norm: f64,
) -> Result<f64> {
    let total_norm = compute_grad_norm(grads, params, frozen)?;

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for (name, var) in params {
            if frozen.contains(name) {
                continue;
            }
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = (grad.detach() * clip_coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }

    Ok(total_norm)
}
