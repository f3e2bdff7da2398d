//! Strain injection for stress extraction.
//!
//! A zero strain `ε` of shape `(B, 3, 3)` is attached to every structure and
//! the inputs are rewritten as `cell' = cell · (I + ε)` and
//! `pos' = pos · (I + ε[batch])`. At `ε = 0` the rewritten inputs equal the
//! originals, while `∂E/∂ε` is the virial from which stress follows.

use candle_core::{Device, IndexOp, Tensor, Var};

use crate::batch::{GraphBatch, FLOAT};
use crate::error::Result;

/// Batch inputs after the strain rewrite.
pub struct StrainedInputs {
    /// Batch whose positions and cells are the (possibly) strained ones.
    pub batch: GraphBatch,
    /// Differentiable positions, present when forces are requested.
    pub positions: Option<Var>,
    /// Differentiable strain, present when stresses are requested.
    pub strain: Option<Var>,
    /// Zero strain tensor, `(B, 3, 3)`. Shares storage with `strain` when
    /// that is present.
    pub strain_tensor: Tensor,
    /// Cell volume per structure after the rewrite, `(B,)`.
    pub volume: Tensor,
}

/// Attach a strain parameter and mark the requested inputs differentiable.
///
/// Positions become a leaf variable before the strain rewrite, so the force
/// gradient is taken with respect to the unstrained positions. With neither
/// quantity requested nothing is marked differentiable and the batch is
/// passed through unchanged.
pub fn apply_strain(
    batch: &GraphBatch,
    include_forces: bool,
    include_stresses: bool,
) -> Result<StrainedInputs> {
    let device = batch.device();
    let num_graphs = batch.num_graphs();
    let mut strained = batch.clone();

    let positions = if include_forces {
        let var = Var::from_tensor(&batch.atom_pos.detach())?;
        strained.atom_pos = var.as_tensor().clone();
        Some(var)
    } else {
        None
    };

    let (strain, strain_tensor) = if include_stresses {
        let var = Var::zeros((num_graphs, 3, 3), FLOAT, device)?;
        let deformation = var
            .as_tensor()
            .broadcast_add(&identity3(device)?)?;
        strained.cell = batch.cell.matmul(&deformation)?;
        let per_atom = deformation.index_select(&batch.batch, 0)?;
        strained.atom_pos = strained
            .atom_pos
            .unsqueeze(1)?
            .matmul(&per_atom)?
            .squeeze(1)?;
        let tensor = var.as_tensor().clone();
        (Some(var), tensor)
    } else {
        (None, Tensor::zeros((num_graphs, 3, 3), FLOAT, device)?)
    };

    let volume = batched_det3(&strained.cell)?;

    Ok(StrainedInputs {
        batch: strained,
        positions,
        strain,
        strain_tensor,
        volume,
    })
}

fn identity3(device: &Device) -> Result<Tensor> {
    let eye = vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
    Ok(Tensor::from_vec(eye, (3, 3), device)?)
}

/// Determinant of every 3x3 matrix in a `(B, 3, 3)` tensor, as the triple
/// product of its rows.
pub fn batched_det3(m: &Tensor) -> Result<Tensor> {
    let a = m.i((.., 0, ..))?;
    let b = m.i((.., 1, ..))?;
    let c = m.i((.., 2, ..))?;
    Ok((a * cross3(&b, &c)?)?.sum(1)?)
}

/// Row-wise cross product of two `(B, 3)` tensors.
fn cross3(u: &Tensor, v: &Tensor) -> Result<Tensor> {
    let col = |t: &Tensor, k: usize| t.narrow(1, k, 1);
    let (u0, u1, u2) = (col(u, 0)?, col(u, 1)?, col(u, 2)?);
    let (v0, v1, v2) = (col(v, 0)?, col(v, 1)?, col(v, 2)?);
    let x = ((&u1 * &v2)? - (&u2 * &v1)?)?;
    let y = ((&u2 * &v0)? - (&u0 * &v2)?)?;
    let z = ((&u0 * &v1)? - (&u1 * &v0)?)?;
    Ok(Tensor::cat(&[x, y, z], 1)?)
}
