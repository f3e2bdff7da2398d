//! Learnable multi-term Morse pair potential.
//!
//! Each bond `i -> j` contributes half of
//!
//! ```text
//! sum_k D_k * ((1 - exp(-a_k (r - r0_k)))^2 - 1) * fc(r)
//! ```
//!
//! to its structure, where `fc` is a cosine cutoff. The neighbor list holds
//! both directions of every bond, so every pair is counted once. A per-species
//! reference energy and a per-head affine map `scale * E + shift * N` complete
//! the structure energy. The terms play the role of interaction layers for
//! partial fine-tuning.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::{named_vars, Capabilities, EnergyModel};
use crate::batch::{GraphBatch, FLOAT};
use crate::error::{ForceFieldError, Result};

/// Constructor arguments of [`MorsePotential`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MorseConfig {
    /// Number of Morse terms.
    #[serde(default = "default_num_terms")]
    pub num_terms: usize,

    /// Size of the per-species reference energy table.
    #[serde(default = "default_num_species")]
    pub num_species: usize,

    /// Interaction cutoff in Å.
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,

    /// Number of output heads.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Initial well depth of the first term in eV.
    #[serde(default = "default_depth")]
    pub init_depth: f64,

    /// Initial width parameter in 1/Å.
    #[serde(default = "default_alpha")]
    pub init_alpha: f64,

    /// Initial equilibrium distance of the first term in Å.
    #[serde(default = "default_r0")]
    pub init_r0: f64,
}

fn default_num_terms() -> usize {
    2
}
fn default_num_species() -> usize {
    95
}
fn default_cutoff() -> f64 {
    5.0
}
fn default_num_heads() -> usize {
    1
}
fn default_depth() -> f64 {
    0.2
}
fn default_alpha() -> f64 {
    1.5
}
fn default_r0() -> f64 {
    1.2
}

impl Default for MorseConfig {
    fn default() -> Self {
        Self {
            num_terms: default_num_terms(),
            num_species: default_num_species(),
            cutoff: default_cutoff(),
            num_heads: default_num_heads(),
            init_depth: default_depth(),
            init_alpha: default_alpha(),
            init_r0: default_r0(),
        }
    }
}

impl MorseConfig {
    /// Parse constructor arguments. `null` yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] for malformed or
    /// out-of-range arguments.
    pub fn from_args(args: &serde_json::Value) -> Result<Self> {
        let config: Self = if args.is_null() {
            Self::default()
        } else {
            serde_json::from_value(args.clone())
                .map_err(|e| ForceFieldError::invalid_config(format!("morse args: {e}")))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check argument ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] describing the bad value.
    pub fn validate(&self) -> Result<()> {
        if self.num_terms == 0 || self.num_heads == 0 || self.num_species == 0 {
            return Err(ForceFieldError::invalid_config(
                "morse num_terms, num_heads and num_species must be at least 1",
            ));
        }
        if !(self.cutoff > 0.0) {
            return Err(ForceFieldError::invalid_config(
                "morse cutoff must be positive",
            ));
        }
        Ok(())
    }
}

struct MorseTerm {
    depth: Tensor,
    alpha: Tensor,
    r0: Tensor,
}

struct Head {
    scale: Tensor,
    shift: Tensor,
}

/// Multi-term Morse pair potential with per-species reference energies.
pub struct MorsePotential {
    config: MorseConfig,
    var_map: VarMap,
    terms: Vec<MorseTerm>,
    heads: Vec<Head>,
    atom_ref: Tensor,
    training: bool,
}

impl MorsePotential {
    /// Create a freshly initialised model on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or parameter
    /// allocation fails.
    pub fn new(config: MorseConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, FLOAT, device);

        let terms = (0..config.num_terms)
            .map(|k| {
                let vb = vb.pp("terms").pp(k);
                Ok(MorseTerm {
                    depth: vb.get_with_hints(
                        1,
                        "depth",
                        Init::Const(config.init_depth / (k + 1) as f64),
                    )?,
                    alpha: vb.get_with_hints(1, "alpha", Init::Const(config.init_alpha))?,
                    r0: vb.get_with_hints(
                        1,
                        "r0",
                        Init::Const(config.init_r0 + 0.5 * k as f64),
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let heads = (0..config.num_heads)
            .map(|k| {
                let vb = vb.pp("heads").pp(k);
                Ok(Head {
                    scale: vb.get_with_hints(1, "scale", Init::Const(1.0))?,
                    shift: vb.get_with_hints(1, "shift", Init::Const(0.0))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let atom_ref = vb.get_with_hints(config.num_species, "atom_ref", Init::Const(0.0))?;

        Ok(Self {
            config,
            var_map,
            terms,
            heads,
            atom_ref,
            training: false,
        })
    }

    /// Constructor arguments.
    pub fn config(&self) -> &MorseConfig {
        &self.config
    }

    /// Pair energy summed per structure, `(B,)`.
    fn pair_energy(&self, batch: &GraphBatch) -> Result<Tensor> {
        let device = batch.device();
        let num_graphs = batch.num_graphs();
        let num_edges = batch.edge_index.dim(1)?;
        if num_edges == 0 {
            return Ok(Tensor::zeros(num_graphs, FLOAT, device)?);
        }

        let src = batch.edge_index.i(0)?.contiguous()?;
        let dst = batch.edge_index.i(1)?.contiguous()?;
        let cell_per_edge = batch.cell.index_select(&batch.edge_batch, 0)?;
        let image_shift = batch
            .pbc_offsets
            .unsqueeze(1)?
            .matmul(&cell_per_edge)?
            .squeeze(1)?;
        let rij = ((batch.atom_pos.index_select(&dst, 0)? + image_shift)?
            - batch.atom_pos.index_select(&src, 0)?)?;
        let dist = rij.sqr()?.sum(1)?.sqrt()?;

        let inside = dist.detach().lt(self.config.cutoff)?.to_dtype(FLOAT)?;
        let cutoff_fn = ((dist.affine(std::f64::consts::PI / self.config.cutoff, 0.0)?.cos()?
            + 1.0)?
            * 0.5)?
            .mul(&inside)?;

        let mut pair = Tensor::zeros(num_edges, FLOAT, device)?;
        for term in &self.terms {
            let x = dist.broadcast_sub(&term.r0)?.broadcast_mul(&term.alpha)?;
            let well = x.neg()?.exp()?.affine(-1.0, 1.0)?.sqr()?;
            pair = (pair + (well - 1.0)?.broadcast_mul(&term.depth)?)?;
        }
        let pair = (pair.mul(&cutoff_fn)? * 0.5)?;

        Ok(Tensor::zeros(num_graphs, FLOAT, device)?.index_add(&batch.edge_batch, &pair, 0)?)
    }

    /// Per-species reference energy summed per structure, `(B,)`.
    fn reference_energy(&self, batch: &GraphBatch) -> Result<Tensor> {
        let species = batch.atom_attr.squeeze(1)?.to_dtype(DType::U32)?;
        let max_species = species.max(0)?.to_scalar::<u32>()? as usize;
        if max_species >= self.config.num_species {
            return Err(ForceFieldError::invalid_batch(format!(
                "species {max_species} outside the reference table of {} entries",
                self.config.num_species
            )));
        }
        let per_atom = self.atom_ref.index_select(&species, 0)?;
        Ok(Tensor::zeros(batch.num_graphs(), FLOAT, batch.device())?
            .index_add(&batch.batch, &per_atom, 0)?)
    }
}

impl EnergyModel for MorsePotential {
    fn forward(&self, batch: &GraphBatch, head: Option<usize>) -> Result<Tensor> {
        let head_idx = head.unwrap_or(0);
        let head = self.heads.get(head_idx).ok_or_else(|| {
            ForceFieldError::invalid_batch(format!(
                "head {head_idx} requested from a model with {} heads",
                self.heads.len()
            ))
        })?;

        let pair = self.pair_energy(batch)?;
        let reference = self.reference_energy(batch)?;
        let num_atoms = batch.num_atoms_tensor()?;

        Ok(((pair.broadcast_mul(&head.scale)? + num_atoms.broadcast_mul(&head.shift)?)?
            + reference)?)
    }

    fn model_args(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            forces: true,
            stress: true,
            finetune: true,
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn num_heads(&self) -> usize {
        self.heads.len()
    }

    fn num_layers(&self) -> usize {
        self.terms.len()
    }

    fn finetune_parameters(&self, layers: usize) -> Result<Vec<String>> {
        let first = self.terms.len().saturating_sub(layers);
        let mut names: Vec<String> = (first..self.terms.len())
            .flat_map(|k| {
                ["depth", "alpha", "r0"].map(|p| format!("terms.{k}.{p}"))
            })
            .collect();
        for k in 0..self.heads.len() {
            names.push(format!("heads.{k}.scale"));
            names.push(format!("heads.{k}.shift"));
        }
        names.push("atom_ref".into());
        Ok(names)
    }

    fn reset_heads(&mut self) -> Result<()> {
        for (name, var) in named_vars(&self.var_map)? {
            let init = if name.ends_with(".scale") {
                1.0
            } else if name.starts_with("heads.") || name == "atom_ref" {
                0.0
            } else {
                continue;
            };
            let fresh = Tensor::full(init, var.shape(), var.device())?;
            var.set(&fresh)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::{dimer, trimer};

    fn model(num_heads: usize) -> MorsePotential {
        MorsePotential::new(
            MorseConfig {
                num_heads,
                num_species: 4,
                ..Default::default()
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let batch = GraphBatch::collate(&[dimer(0.0), trimer()], &Device::Cpu).unwrap();
        let energy = model(1).forward(&batch, None).unwrap();
        assert_eq!(energy.dims(), &[2]);
        let values = energy.to_vec1::<f64>().unwrap();
        assert!(values.iter().all(|e| e.is_finite()));
    }

    #[test]
    fn test_isolated_pair_matches_closed_form() {
        let record = crate::batch::GraphRecord {
            atom_pos: vec![[0.0; 3], [1.7, 0.0, 0.0]],
            cell: [[30.0, 0.0, 0.0], [0.0, 30.0, 0.0], [0.0, 0.0, 30.0]],
            atom_attr: vec![1.0, 1.0],
            edge_index: vec![[0, 1], [1, 0]],
            pbc_offsets: vec![[0.0; 3]; 2],
            three_body_indices: Vec::new(),
            num_triple_ij: Vec::new(),
            energy: None,
            forces: None,
            stress: None,
        };
        let batch = GraphBatch::collate(&[record], &Device::Cpu).unwrap();
        let m = MorsePotential::new(
            MorseConfig {
                num_terms: 1,
                num_species: 2,
                ..Default::default()
            },
            &Device::Cpu,
        )
        .unwrap();
        let energy = m.forward(&batch, None).unwrap().to_vec1::<f64>().unwrap()[0];

        let (d, a, r0, rc) = (0.2, 1.5, 1.2, 5.0);
        let r = 1.7f64;
        let fc = 0.5 * ((std::f64::consts::PI * r / rc).cos() + 1.0);
        let expected = d * ((1.0 - (-a * (r - r0)).exp()).powi(2) - 1.0) * fc;
        assert!((energy - expected).abs() < 1e-12);
    }

    #[test]
    fn test_head_out_of_range() {
        let batch = GraphBatch::collate(&[trimer()], &Device::Cpu).unwrap();
        assert!(model(2).forward(&batch, Some(1)).is_ok());
        assert!(model(2).forward(&batch, Some(2)).is_err());
    }

    #[test]
    fn test_species_out_of_range() {
        let mut record = trimer();
        record.atom_attr[0] = 9.0;
        let batch = GraphBatch::collate(&[record], &Device::Cpu).unwrap();
        assert!(matches!(
            model(1).forward(&batch, None),
            Err(ForceFieldError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_finetune_parameters() {
        let m = model(2);
        let names = m.finetune_parameters(1).unwrap();
        assert!(names.contains(&"terms.1.alpha".to_string()));
        assert!(!names.contains(&"terms.0.alpha".to_string()));
        assert!(names.contains(&"heads.1.shift".to_string()));
        assert!(names.contains(&"atom_ref".to_string()));
        assert_eq!(m.finetune_parameters(0).unwrap().len(), 5);
    }

    #[test]
    fn test_reset_heads() {
        let mut m = model(1);
        for (_, var) in named_vars(m.var_map()).unwrap() {
            var.set(&Tensor::full(3.0, var.shape(), var.device()).unwrap())
                .unwrap();
        }
        m.reset_heads().unwrap();
        let vars = named_vars(m.var_map()).unwrap();
        let value = |n: &str| {
            vars.iter()
                .find(|(name, _)| name == n)
                .unwrap()
                .1
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f64>()
                .unwrap()[0]
        };
        assert_eq!(value("heads.0.scale"), 1.0);
        assert_eq!(value("heads.0.shift"), 0.0);
        assert_eq!(value("atom_ref"), 0.0);
        assert_eq!(value("terms.0.depth"), 3.0);
    }

    #[test]
    fn test_model_args_roundtrip() {
        let m = model(3);
        let args = m.model_args().unwrap();
        assert_eq!(args["num_heads"], 3);
        assert_eq!(MorseConfig::from_args(&args).unwrap(), *m.config());
    }
}
