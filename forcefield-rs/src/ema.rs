//! Exponential moving average of model parameters.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{ForceFieldError, Result};

/// Non-tensor EMA state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaMeta {
    /// Target decay.
    pub decay: f64,
    /// Updates applied so far.
    pub num_updates: u64,
}

/// Shadow copy of the parameters, updated after every optimizer step.
///
/// The effective decay ramps up as `min(decay, (1 + n) / (10 + n))` so early
/// updates track the raw weights closely.
pub struct ExponentialMovingAverage {
    decay: f64,
    num_updates: u64,
    params: Vec<(String, Var)>,
    shadow: BTreeMap<String, Tensor>,
}

/// Raw parameter values saved while the shadow weights are swapped in.
#[must_use = "the raw weights stay replaced until the backup is restored"]
pub struct ParameterBackup {
    values: Vec<(Var, Tensor)>,
}

impl ParameterBackup {
    /// Put the saved values back.
    pub fn restore(self) -> Result<()> {
        for (var, value) in self.values {
            var.set(&value)?;
        }
        Ok(())
    }
}

fn snapshot(var: &Var) -> Result<Tensor> {
    Ok(var.as_tensor().detach().copy()?)
}

impl ExponentialMovingAverage {
    /// Start averaging from the current parameter values.
    pub fn new(params: Vec<(String, Var)>, decay: f64) -> Result<Self> {
        let shadow = params
            .iter()
            .map(|(name, var)| Ok((name.clone(), snapshot(var)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            decay,
            num_updates: 0,
            params,
            shadow,
        })
    }

    /// Rebuild from saved state.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::Checkpoint`] unless every parameter has a
    /// shadow tensor of matching shape.
    pub fn from_state(
        params: Vec<(String, Var)>,
        meta: EmaMeta,
        mut shadow: HashMap<String, Tensor>,
    ) -> Result<Self> {
        let mut restored = BTreeMap::new();
        for (name, var) in &params {
            let tensor = shadow.remove(name).ok_or_else(|| {
                ForceFieldError::checkpoint(format!("EMA state has no shadow for `{name}`"))
            })?;
            if tensor.dims() != var.dims() {
                return Err(ForceFieldError::checkpoint(format!(
                    "EMA shadow for `{name}` has shape {:?}, parameter has {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            restored.insert(
                name.clone(),
                tensor.to_device(var.device())?.to_dtype(var.dtype())?,
            );
        }
        if let Some(extra) = shadow.keys().next() {
            return Err(ForceFieldError::checkpoint(format!(
                "EMA state has a shadow for unknown parameter `{extra}`"
            )));
        }
        Ok(Self {
            decay: meta.decay,
            num_updates: meta.num_updates,
            params,
            shadow: restored,
        })
    }

    /// Target decay.
    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Non-tensor state for persistence.
    pub fn meta(&self) -> EmaMeta {
        EmaMeta {
            decay: self.decay,
            num_updates: self.num_updates,
        }
    }

    /// Shadow tensors by parameter name.
    pub fn shadow(&self) -> &BTreeMap<String, Tensor> {
        &self.shadow
    }

    /// Blend the current parameters into the shadow. Frozen parameters are
    /// copied as they are.
    pub fn update(&mut self, frozen: &BTreeSet<String>) -> Result<()> {
        self.num_updates += 1;
        let n = self.num_updates as f64;
        let decay = self.decay.min((1.0 + n) / (10.0 + n));

        for (name, var) in &self.params {
            let param = var.as_tensor().detach();
            let next = if frozen.contains(name) {
                param.copy()?
            } else {
                let shadow = self.shadow.get(name).ok_or_else(|| {
                    ForceFieldError::training(format!("no EMA shadow for `{name}`"))
                })?;
                ((shadow * decay)? + (param * (1.0 - decay))?)?
            };
            self.shadow.insert(name.clone(), next);
        }
        Ok(())
    }

    /// Load the shadow values into the parameters, returning the raw values.
    pub fn swap_in(&self) -> Result<ParameterBackup> {
        let mut values = Vec::with_capacity(self.params.len());
        for (name, var) in &self.params {
            let shadow = self.shadow.get(name).ok_or_else(|| {
                ForceFieldError::training(format!("no EMA shadow for `{name}`"))
            })?;
            values.push((var.clone(), snapshot(var)?));
            var.set(shadow)?;
        }
        Ok(ParameterBackup { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn param(value: f64) -> Vec<(String, Var)> {
        vec![("w".into(), Var::new(&[value], &Device::Cpu).unwrap())]
    }

    fn read(t: &Tensor) -> f64 {
        t.to_vec1::<f64>().unwrap()[0]
    }

    #[test]
    fn test_warmup_decay() {
        let params = param(0.0);
        let mut ema = ExponentialMovingAverage::new(params.clone(), 0.99).unwrap();
        params[0].1.set(&Tensor::new(&[1.0f64], &Device::Cpu).unwrap()).unwrap();
        ema.update(&BTreeSet::new()).unwrap();
        // First update uses decay 2/11.
        let expected = 1.0 - 2.0 / 11.0;
        assert!((read(&ema.shadow()["w"]) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_swap_in_and_restore() {
        let params = param(0.0);
        let mut ema = ExponentialMovingAverage::new(params.clone(), 0.99).unwrap();
        params[0].1.set(&Tensor::new(&[1.0f64], &Device::Cpu).unwrap()).unwrap();
        ema.update(&BTreeSet::new()).unwrap();

        let backup = ema.swap_in().unwrap();
        assert!((read(params[0].1.as_tensor()) - 9.0 / 11.0).abs() < 1e-12);
        backup.restore().unwrap();
        assert_eq!(read(params[0].1.as_tensor()), 1.0);
    }

    #[test]
    fn test_frozen_parameters_copied() {
        let params = param(0.0);
        let mut ema = ExponentialMovingAverage::new(params.clone(), 0.99).unwrap();
        params[0].1.set(&Tensor::new(&[4.0f64], &Device::Cpu).unwrap()).unwrap();
        ema.update(&BTreeSet::from(["w".to_string()])).unwrap();
        assert_eq!(read(&ema.shadow()["w"]), 4.0);
    }

    #[test]
    fn test_state_requires_every_shadow() {
        let params = param(2.0);
        let meta = EmaMeta {
            decay: 0.99,
            num_updates: 3,
        };
        assert!(ExponentialMovingAverage::from_state(params.clone(), meta.clone(), HashMap::new()).is_err());

        let shadow = HashMap::from([(
            "w".to_string(),
            Tensor::new(&[1.5f64], &Device::Cpu).unwrap(),
        )]);
        let ema = ExponentialMovingAverage::from_state(params, meta.clone(), shadow).unwrap();
        assert_eq!(ema.meta(), meta);
    }
}
