//! Energy evaluation with forces and stresses by reverse-mode differentiation.

use std::cell::Cell;
use std::sync::Once;

use candle_core::{Device, Tensor, Var};

use crate::batch::GraphBatch;
use crate::error::{ForceFieldError, Result};
use crate::model::EnergyModel;
use crate::strain::apply_strain;

/// Converts eV/Å³ to GPa.
pub const EV_PER_A3_TO_GPA: f64 = 160.217_662_08;

static SECOND_ORDER: Once = Once::new();

/// Keep gradient graphs alive so forces and stresses can be differentiated
/// again during training.
///
/// candle reads this switch lazily per thread, so it has to be set before the
/// first backward pass of every thread that trains.
pub fn enable_second_order() {
    SECOND_ORDER.call_once(|| std::env::set_var("CANDLE_GRAD_DO_NOT_DETACH", "1"));
}

thread_local! {
    static SECOND_ORDER_READY: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Whether backward passes on this thread keep the graph of their gradients.
///
/// Checked once per thread by differentiating `x⁴` twice at `x = 1`: a
/// connected graph gives 12, a detached one 4.
pub fn second_order_available() -> Result<bool> {
    if let Some(ready) = SECOND_ORDER_READY.with(Cell::get) {
        return Ok(ready);
    }
    let x = Var::new(&[1.0f64], &Device::Cpu)?;
    let first = x.as_tensor().sqr()?.sqr()?.sum_all()?.backward()?;
    let ready = match first.get(x.as_tensor()) {
        Some(grad) => {
            let second = grad.sum_all()?.backward()?;
            match second.get(x.as_tensor()) {
                Some(curvature) => (curvature.sum_all()?.to_scalar::<f64>()? - 12.0).abs() < 1e-9,
                None => false,
            }
        }
        None => false,
    };
    SECOND_ORDER_READY.with(|cell| cell.set(Some(ready)));
    Ok(ready)
}

/// Predicted quantities for one batch.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Total energy per structure, `(B,)`.
    pub energy: Tensor,
    /// Forces per atom, `(N, 3)`. Absent when not requested or when the
    /// energy does not depend on positions.
    pub forces: Option<Tensor>,
    /// Stress per structure in GPa, `(B, 3, 3)`. Absent when not requested or
    /// when the energy does not depend on the strain.
    pub stresses: Option<Tensor>,
}

impl ForwardOutput {
    /// Forces, or [`ForceFieldError::MissingQuantity`].
    pub fn forces(&self) -> Result<&Tensor> {
        self.forces
            .as_ref()
            .ok_or_else(|| ForceFieldError::MissingQuantity("forces were not computed".into()))
    }

    /// Stresses, or [`ForceFieldError::MissingQuantity`].
    pub fn stresses(&self) -> Result<&Tensor> {
        self.stresses
            .as_ref()
            .ok_or_else(|| ForceFieldError::MissingQuantity("stresses were not computed".into()))
    }
}

/// Evaluate `model` on `batch`, deriving forces and stresses as requested.
///
/// Forces and stresses come from one joint backward pass of the summed
/// energy, so every structure's strain gradient is taken from the same
/// graph. In training mode the derived quantities keep their graph for the
/// loss backward pass; otherwise everything returned is detached.
///
/// # Errors
///
/// Returns [`ForceFieldError::UnsupportedModel`] when the model cannot
/// provide a requested quantity, or any error raised by the model.
pub fn evaluate(
    model: &dyn EnergyModel,
    batch: &GraphBatch,
    include_forces: bool,
    include_stresses: bool,
    head: Option<usize>,
) -> Result<ForwardOutput> {
    let capabilities = model.capabilities();
    if include_forces && !capabilities.forces {
        return Err(ForceFieldError::unsupported("model does not provide forces"));
    }
    if include_stresses && !capabilities.stress {
        return Err(ForceFieldError::unsupported("model does not provide stresses"));
    }
    enable_second_order();
    let training = model.is_training();
    if training && (include_forces || include_stresses) && !second_order_available()? {
        return Err(ForceFieldError::training(
            "gradients on this thread are detached, so force and stress losses cannot train \
             the model; call enable_second_order before the thread's first backward pass",
        ));
    }

    let inputs = apply_strain(batch, include_forces, include_stresses)?;
    let energy = model.forward(&inputs.batch, head)?;

    let mut output = ForwardOutput {
        energy: energy.clone(),
        forces: None,
        stresses: None,
    };

    if include_forces || include_stresses {
        let grads = energy.sum_all()?.backward()?;

        if let Some(positions) = &inputs.positions {
            if let Some(grad) = grads.get(positions.as_tensor()) {
                output.forces = Some(grad.neg()?);
            }
        }

        if let Some(strain) = &inputs.strain {
            if let Some(grad) = grads.get(strain.as_tensor()) {
                let volume = inputs.volume.reshape((batch.num_graphs(), 1, 1))?;
                output.stresses = Some((grad.broadcast_div(&volume)? * EV_PER_A3_TO_GPA)?);
            }
        }
    }

    if !training {
        output.energy = output.energy.detach();
        output.forces = output.forces.map(|f| f.detach());
        output.stresses = output.stresses.map(|s| s.detach());
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::{dimer, trimer};
    use crate::model::{Capabilities, MorseConfig, MorsePotential};
    use candle_core::Device;
    use candle_nn::{Init, VarBuilder, VarMap};

    /// Energy proportional to atom count: no dependence on geometry.
    struct CountingModel {
        var_map: VarMap,
        per_atom: Tensor,
    }

    impl CountingModel {
        fn new() -> Self {
            let var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, crate::batch::FLOAT, &Device::Cpu);
            let per_atom = vb.get_with_hints(1, "per_atom", Init::Const(-0.5)).unwrap();
            Self { var_map, per_atom }
        }
    }

    impl EnergyModel for CountingModel {
        fn forward(&self, batch: &GraphBatch, _head: Option<usize>) -> Result<Tensor> {
            Ok(batch.num_atoms_tensor()?.broadcast_mul(&self.per_atom)?)
        }
        fn model_args(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        fn var_map(&self) -> &VarMap {
            &self.var_map
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                forces: true,
                stress: false,
                finetune: false,
            }
        }
        fn set_training(&mut self, _training: bool) {}
        fn is_training(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_energy_only() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let batch = GraphBatch::collate(&[dimer(0.0), trimer()], &Device::Cpu).unwrap();
        let out = evaluate(&model, &batch, false, false, None).unwrap();
        assert_eq!(out.energy.dims(), &[2]);
        assert!(out.forces.is_none());
        assert!(out.stresses.is_none());
        assert!(matches!(
            out.forces(),
            Err(ForceFieldError::MissingQuantity(_))
        ));
    }

    #[test]
    fn test_forces_and_stresses_shapes() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let batch = GraphBatch::collate(&[dimer(0.0), trimer()], &Device::Cpu).unwrap();
        let out = evaluate(&model, &batch, true, true, None).unwrap();
        assert_eq!(out.forces().unwrap().dims(), &[5, 3]);
        assert_eq!(out.stresses().unwrap().dims(), &[2, 3, 3]);
    }

    #[test]
    fn test_stresses_without_forces() {
        let model = MorsePotential::new(MorseConfig::default(), &Device::Cpu).unwrap();
        let batch = GraphBatch::collate(&[dimer(0.0)], &Device::Cpu).unwrap();
        let alone = evaluate(&model, &batch, false, true, None).unwrap();
        assert!(alone.forces.is_none());
        let joint = evaluate(&model, &batch, true, true, None).unwrap();
        let diff = (alone.stresses().unwrap() - joint.stresses().unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f64>()
            .unwrap();
        assert!(diff < 1e-12);
    }

    #[test]
    fn test_geometry_independent_energy_omits_forces() {
        let model = CountingModel::new();
        let batch = GraphBatch::collate(&[trimer()], &Device::Cpu).unwrap();
        let out = evaluate(&model, &batch, true, false, None).unwrap();
        assert!(out.forces.is_none());
        let energy = out.energy.to_vec1::<f64>().unwrap();
        assert_eq!(energy, vec![-1.5]);
    }

    #[test]
    fn test_second_order_available_on_new_thread() {
        enable_second_order();
        let ready = std::thread::spawn(|| second_order_available().unwrap())
            .join()
            .unwrap();
        assert!(ready);
    }

    #[test]
    fn test_capability_negotiation() {
        let model = CountingModel::new();
        let batch = GraphBatch::collate(&[trimer()], &Device::Cpu).unwrap();
        assert!(matches!(
            evaluate(&model, &batch, true, true, None),
            Err(ForceFieldError::UnsupportedModel(_))
        ));
    }
}
