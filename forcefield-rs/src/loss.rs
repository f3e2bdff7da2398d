//! Loss composition and error metrics.
//!
//! Energies enter the loss per atom so structures of different sizes weigh
//! alike. Forces and stresses enter as they are, scaled by their weights.
//! Mean absolute errors are reported unweighted and never carry gradients.

use candle_core::{DType, Tensor};

use crate::batch::GraphBatch;
use crate::config::{LossKind, Quantity, TrainOptions};
use crate::engine::ForwardOutput;
use crate::error::{ForceFieldError, Result};

/// Which quantities enter the objective, and with what weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSettings {
    /// Elementwise loss.
    pub kind: LossKind,
    /// Fit per-atom energies.
    pub include_energy: bool,
    /// Fit forces.
    pub include_forces: bool,
    /// Fit stresses.
    pub include_stresses: bool,
    /// Weight of the force term.
    pub force_weight: f64,
    /// Weight of the stress term.
    pub stress_weight: f64,
}

impl LossSettings {
    /// Settings for a batch of the dataset called `dataset`, honouring that
    /// dataset's excluded quantities.
    pub fn for_dataset(options: &TrainOptions, dataset: Option<&str>) -> Self {
        Self {
            kind: options.loss,
            include_energy: options.includes(Quantity::Energy, dataset),
            include_forces: options.includes(Quantity::Forces, dataset),
            include_stresses: options.includes(Quantity::Stress, dataset),
            force_weight: options.force_loss_ratio,
            stress_weight: options.stress_loss_ratio,
        }
    }
}

impl Default for LossSettings {
    fn default() -> Self {
        Self::for_dataset(&TrainOptions::default(), None)
    }
}

/// Scalar objective and per-quantity errors of one batch.
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// Weighted objective, a scalar tensor.
    pub loss: Tensor,
    /// Per-atom energy MAE, 0 when excluded.
    pub mae_energy: f64,
    /// Force MAE, 0 when excluded.
    pub mae_forces: f64,
    /// Stress MAE, 0 when excluded.
    pub mae_stress: f64,
}

impl LossTerms {
    /// Objective as a plain number.
    pub fn loss_value(&self) -> Result<f64> {
        Ok(self.loss.detach().to_scalar::<f64>()?)
    }
}

/// Combine the per-quantity losses of `output` against the labels in `batch`.
///
/// # Errors
///
/// Returns [`ForceFieldError::MissingQuantity`] when an included quantity
/// has no prediction or no label.
pub fn compose(batch: &GraphBatch, output: &ForwardOutput, settings: &LossSettings) -> Result<LossTerms> {
    let mut loss = Tensor::zeros((), DType::F64, batch.device())?;
    let mut terms = LossTerms {
        loss: loss.clone(),
        mae_energy: 0.0,
        mae_forces: 0.0,
        mae_stress: 0.0,
    };

    if settings.include_energy {
        let num_atoms = batch.num_atoms_tensor()?;
        let target = label(&batch.energy, "energy")?.div(&num_atoms)?;
        let pred = output.energy.div(&num_atoms)?;
        loss = (loss + elementwise(settings.kind, &pred, &target)?)?;
        terms.mae_energy = mae(&pred, &target)?;
    }

    if settings.include_forces {
        let target = label(&batch.forces, "forces")?;
        let pred = output.forces()?;
        loss = (loss + (elementwise(settings.kind, pred, target)? * settings.force_weight)?)?;
        terms.mae_forces = mae(pred, target)?;
    }

    if settings.include_stresses {
        let target = label(&batch.stress, "stress")?;
        let pred = output.stresses()?;
        loss = (loss + (elementwise(settings.kind, pred, target)? * settings.stress_weight)?)?;
        terms.mae_stress = mae(pred, target)?;
    }

    terms.loss = loss;
    Ok(terms)
}

fn label<'a>(label: &'a Option<Tensor>, what: &str) -> Result<&'a Tensor> {
    label
        .as_ref()
        .ok_or_else(|| ForceFieldError::MissingQuantity(format!("batch has no {what} labels")))
}

/// Mean elementwise loss between `pred` and `target`.
pub fn elementwise(kind: LossKind, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = (pred - target)?;
    let per_element = match kind {
        LossKind::Mse => diff.sqr()?,
        LossKind::L1 => diff.abs()?,
        LossKind::Huber => {
            let abs = diff.abs()?;
            let quadratic = abs.minimum(1.0)?;
            ((quadratic.sqr()? * 0.5)? + (abs - quadratic)?)?
        }
    };
    Ok(per_element.mean_all()?)
}

fn mae(pred: &Tensor, target: &Tensor) -> Result<f64> {
    Ok((pred.detach() - target)?
        .abs()?
        .mean_all()?
        .to_scalar::<f64>()?)
}
