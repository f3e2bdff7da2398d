//! Structure graphs and batched model inputs.
//!
//! A [`GraphRecord`] is one atomic structure with its bond and three-body
//! connectivity, as produced by an external graph builder. [`GraphBatch`]
//! concatenates records into the canonical tensor field set consumed by the
//! strain transform and the energy model: positions, cells, periodic offsets,
//! atom attributes, edge and triple indices, per-structure counts, and the
//! structure-membership index of every atom.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ForceFieldError, Result};

/// Floating point type used by every tensor the engine creates.
pub const FLOAT: DType = DType::F64;

/// A single structure graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    /// Cartesian atom positions in Å.
    pub atom_pos: Vec<[f64; 3]>,
    /// Lattice vectors as rows.
    pub cell: [[f64; 3]; 3],
    /// Per-atom attribute (atomic number).
    pub atom_attr: Vec<f64>,
    /// Directed bonds `[i, j]` as local atom indices.
    pub edge_index: Vec<[u32; 2]>,
    /// Lattice image of atom `j` for every bond, in fractional units.
    pub pbc_offsets: Vec<[f64; 3]>,
    /// Pairs of local bond indices forming a triple.
    #[serde(default)]
    pub three_body_indices: Vec<[u32; 2]>,
    /// Number of triples centred on every bond.
    #[serde(default)]
    pub num_triple_ij: Vec<u32>,
    /// Total energy label in eV.
    #[serde(default)]
    pub energy: Option<f64>,
    /// Force labels in eV/Å.
    #[serde(default)]
    pub forces: Option<Vec<[f64; 3]>>,
    /// Stress label in GPa.
    #[serde(default)]
    pub stress: Option<[[f64; 3]; 3]>,
}

impl GraphRecord {
    /// Number of atoms.
    pub fn num_atoms(&self) -> usize {
        self.atom_pos.len()
    }

    /// Number of directed bonds.
    pub fn num_bonds(&self) -> usize {
        self.edge_index.len()
    }

    /// Number of three-body triples.
    pub fn num_three_body(&self) -> usize {
        self.three_body_indices.len()
    }

    /// Check that counts agree and every index references a valid local offset.
    pub fn validate(&self) -> Result<()> {
        let n = self.num_atoms();
        if n == 0 {
            return Err(ForceFieldError::invalid_batch("structure has no atoms"));
        }
        if self.atom_attr.len() != n {
            return Err(ForceFieldError::invalid_batch(format!(
                "{} atom attributes for {n} atoms",
                self.atom_attr.len()
            )));
        }
        if self.pbc_offsets.len() != self.num_bonds() {
            return Err(ForceFieldError::invalid_batch(format!(
                "{} periodic offsets for {} bonds",
                self.pbc_offsets.len(),
                self.num_bonds()
            )));
        }
        if let Some(bad) = self
            .edge_index
            .iter()
            .find(|[i, j]| *i as usize >= n || *j as usize >= n)
        {
            return Err(ForceFieldError::invalid_batch(format!(
                "bond {bad:?} references an atom outside 0..{n}"
            )));
        }
        let bonds = self.num_bonds();
        if let Some(bad) = self
            .three_body_indices
            .iter()
            .find(|[a, b]| *a as usize >= bonds || *b as usize >= bonds)
        {
            return Err(ForceFieldError::invalid_batch(format!(
                "triple {bad:?} references a bond outside 0..{bonds}"
            )));
        }
        if !self.num_triple_ij.is_empty() && self.num_triple_ij.len() != bonds {
            return Err(ForceFieldError::invalid_batch(format!(
                "{} triple counts for {bonds} bonds",
                self.num_triple_ij.len()
            )));
        }
        if let Some(forces) = &self.forces {
            if forces.len() != n {
                return Err(ForceFieldError::invalid_batch(format!(
                    "{} force labels for {n} atoms",
                    forces.len()
                )));
            }
        }
        Ok(())
    }
}

/// A batch of structure graphs laid out as tensors.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    /// Atom positions, `(N, 3)`.
    pub atom_pos: Tensor,
    /// Cells, `(B, 3, 3)`.
    pub cell: Tensor,
    /// Periodic image offsets per bond, `(E, 3)`.
    pub pbc_offsets: Tensor,
    /// Atom attributes, `(N, 1)`.
    pub atom_attr: Tensor,
    /// Bond endpoints as batch-global atom indices, `(2, E)` u32.
    pub edge_index: Tensor,
    /// Owning structure of every bond, `(E,)` u32.
    pub edge_batch: Tensor,
    /// Triples as batch-global bond indices, `(T, 2)` u32.
    pub three_body_indices: Tensor,
    /// Triples per bond, `(E,)` u32.
    pub num_triple_ij: Tensor,
    /// Owning structure of every atom, `(N,)` u32.
    pub batch: Tensor,
    /// Atoms per structure.
    pub num_atoms: Vec<usize>,
    /// Bonds per structure.
    pub num_bonds: Vec<usize>,
    /// Triples per structure.
    pub num_three_body: Vec<usize>,
    /// Energy labels, `(B,)`.
    pub energy: Option<Tensor>,
    /// Force labels, `(N, 3)`.
    pub forces: Option<Tensor>,
    /// Stress labels, `(B, 3, 3)`.
    pub stress: Option<Tensor>,
}

impl GraphBatch {
    /// Concatenate records into one batch, shifting bond and triple indices
    /// by the running atom and bond offsets.
    ///
    /// Labels are kept only when every record carries them.
    pub fn collate(records: &[GraphRecord], device: &Device) -> Result<Self> {
        if records.is_empty() {
            return Err(ForceFieldError::invalid_batch("cannot collate an empty batch"));
        }

        let mut pos: Vec<f64> = Vec::new();
        let mut cell: Vec<f64> = Vec::with_capacity(records.len() * 9);
        let mut offsets: Vec<f64> = Vec::new();
        let mut attr = Vec::new();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        let mut edge_batch = Vec::new();
        let mut triples = Vec::new();
        let mut triple_ij = Vec::new();
        let mut membership = Vec::new();
        let mut num_atoms = Vec::with_capacity(records.len());
        let mut num_bonds = Vec::with_capacity(records.len());
        let mut num_three_body = Vec::with_capacity(records.len());

        let mut atom_offset = 0u32;
        let mut bond_offset = 0u32;
        for (graph_idx, record) in records.iter().enumerate() {
            record.validate()?;
            let graph_idx = graph_idx as u32;

            pos.extend(record.atom_pos.iter().flatten());
            cell.extend(record.cell.iter().flatten());
            offsets.extend(record.pbc_offsets.iter().flatten());
            attr.extend_from_slice(&record.atom_attr);
            for [i, j] in &record.edge_index {
                src.push(i + atom_offset);
                dst.push(j + atom_offset);
                edge_batch.push(graph_idx);
            }
            for [a, b] in &record.three_body_indices {
                triples.push(a + bond_offset);
                triples.push(b + bond_offset);
            }
            if record.num_triple_ij.is_empty() {
                triple_ij.extend(std::iter::repeat(0u32).take(record.num_bonds()));
            } else {
                triple_ij.extend_from_slice(&record.num_triple_ij);
            }
            membership.extend(std::iter::repeat(graph_idx).take(record.num_atoms()));

            num_atoms.push(record.num_atoms());
            num_bonds.push(record.num_bonds());
            num_three_body.push(record.num_three_body());
            atom_offset += record.num_atoms() as u32;
            bond_offset += record.num_bonds() as u32;
        }

        let n = atom_offset as usize;
        let e = bond_offset as usize;
        let b = records.len();
        let t = triples.len() / 2;

        let energy = records
            .iter()
            .map(|r| r.energy)
            .collect::<Option<Vec<_>>>()
            .map(|e| Tensor::from_vec(e, b, device))
            .transpose()?;
        let forces = records
            .iter()
            .map(|r| r.forces.as_ref())
            .collect::<Option<Vec<_>>>()
            .map(|f| {
                let flat: Vec<f64> = f.into_iter().flatten().flatten().copied().collect();
                Tensor::from_vec(flat, (n, 3), device)
            })
            .transpose()?;
        let stress = records
            .iter()
            .map(|r| r.stress)
            .collect::<Option<Vec<_>>>()
            .map(|s| {
                let flat: Vec<f64> = s.iter().flatten().flatten().copied().collect();
                Tensor::from_vec(flat, (b, 3, 3), device)
            })
            .transpose()?;

        let mut edge_index = src;
        edge_index.extend(dst);

        Ok(Self {
            atom_pos: Tensor::from_vec(pos, (n, 3), device)?,
            cell: Tensor::from_vec(cell, (b, 3, 3), device)?,
            pbc_offsets: Tensor::from_vec(offsets, (e, 3), device)?,
            atom_attr: Tensor::from_vec(attr, (n, 1), device)?,
            edge_index: Tensor::from_vec(edge_index, (2, e), device)?,
            edge_batch: Tensor::from_vec(edge_batch, e, device)?,
            three_body_indices: Tensor::from_vec(triples, (t, 2), device)?,
            num_triple_ij: Tensor::from_vec(triple_ij, e, device)?,
            batch: Tensor::from_vec(membership, n, device)?,
            num_atoms,
            num_bonds,
            num_three_body,
            energy,
            forces,
            stress,
        })
    }

    /// Number of structures in the batch.
    pub fn num_graphs(&self) -> usize {
        self.num_atoms.len()
    }

    /// Total number of atoms in the batch.
    pub fn total_atoms(&self) -> usize {
        self.num_atoms.iter().sum()
    }

    /// Atom counts as a float tensor, `(B,)`.
    pub fn num_atoms_tensor(&self) -> Result<Tensor> {
        let counts: Vec<f64> = self.num_atoms.iter().map(|&n| n as f64).collect();
        Ok(Tensor::from_vec(counts, self.num_graphs(), self.atom_pos.device())?)
    }

    /// Device the batch lives on.
    pub fn device(&self) -> &Device {
        self.atom_pos.device()
    }

    /// Check that per-structure counts sum to the tensor extents.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("atoms", self.total_atoms(), self.atom_pos.dim(0)?),
            ("bonds", self.num_bonds.iter().sum(), self.edge_index.dim(1)?),
            (
                "triples",
                self.num_three_body.iter().sum(),
                self.three_body_indices.dim(0)?,
            ),
            ("cells", self.num_graphs(), self.cell.dim(0)?),
        ];
        for (what, counted, extent) in checks {
            if counted != extent {
                return Err(ForceFieldError::invalid_batch(format!(
                    "per-structure {what} sum to {counted} but the batch holds {extent}"
                )));
            }
        }
        Ok(())
    }

    /// Move every tensor to `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let move_opt = |t: &Option<Tensor>| -> Result<Option<Tensor>> {
            Ok(t.as_ref().map(|t| t.to_device(device)).transpose()?)
        };
        Ok(Self {
            atom_pos: self.atom_pos.to_device(device)?,
            cell: self.cell.to_device(device)?,
            pbc_offsets: self.pbc_offsets.to_device(device)?,
            atom_attr: self.atom_attr.to_device(device)?,
            edge_index: self.edge_index.to_device(device)?,
            edge_batch: self.edge_batch.to_device(device)?,
            three_body_indices: self.three_body_indices.to_device(device)?,
            num_triple_ij: self.num_triple_ij.to_device(device)?,
            batch: self.batch.to_device(device)?,
            num_atoms: self.num_atoms.clone(),
            num_bonds: self.num_bonds.clone(),
            num_three_body: self.num_three_body.clone(),
            energy: move_opt(&self.energy)?,
            forces: move_opt(&self.forces)?,
            stress: move_opt(&self.stress)?,
        })
    }
}

/// Split a per-atom tensor into one tensor per structure.
pub fn split_per_structure(values: &Tensor, counts: &[usize]) -> Result<Vec<Tensor>> {
    let mut start = 0;
    let mut parts = Vec::with_capacity(counts.len());
    for &count in counts {
        parts.push(values.narrow(0, start, count)?);
        start += count;
    }
    Ok(parts)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two-atom periodic cell with in-cell and image bonds.
    pub(crate) fn dimer(shift: f64) -> GraphRecord {
        GraphRecord {
            atom_pos: vec![[0.1, 0.0, 0.0], [1.3 + shift, 0.2, 0.1]],
            cell: [[3.0, 0.0, 0.0], [0.0, 3.2, 0.0], [0.0, 0.0, 3.4]],
            atom_attr: vec![1.0, 2.0],
            edge_index: vec![[0, 1], [1, 0], [0, 0], [0, 0], [1, 0], [0, 1]],
            pbc_offsets: vec![
                [0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [-1.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [-1.0, 0.0, 0.0],
            ],
            three_body_indices: vec![[0, 2], [2, 0]],
            num_triple_ij: vec![1, 0, 1, 0, 0, 0],
            energy: Some(-1.5),
            forces: Some(vec![[0.1, 0.0, 0.0], [-0.1, 0.0, 0.0]]),
            stress: Some([[0.5, 0.0, 0.0], [0.0, 0.2, 0.0], [0.0, 0.0, 0.1]]),
        }
    }

    /// Three atoms in a large box, no periodic images.
    pub(crate) fn trimer() -> GraphRecord {
        GraphRecord {
            atom_pos: vec![[0.0, 0.0, 0.0], [1.1, 0.0, 0.0], [0.3, 1.2, 0.2]],
            cell: [[20.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]],
            atom_attr: vec![1.0, 1.0, 2.0],
            edge_index: vec![[0, 1], [1, 0], [0, 2], [2, 0], [1, 2], [2, 1]],
            pbc_offsets: vec![[0.0; 3]; 6],
            three_body_indices: Vec::new(),
            num_triple_ij: Vec::new(),
            energy: Some(-2.0),
            forces: Some(vec![[0.0; 3]; 3]),
            stress: Some([[0.0; 3]; 3]),
        }
    }

    #[test]
    fn test_collate_offsets_indices() {
        let batch = GraphBatch::collate(&[dimer(0.0), trimer()], &Device::Cpu).unwrap();
        assert_eq!(batch.num_graphs(), 2);
        assert_eq!(batch.num_atoms, vec![2, 3]);
        assert_eq!(batch.num_bonds, vec![6, 6]);
        assert_eq!(batch.num_three_body, vec![2, 0]);
        batch.validate().unwrap();

        let edges = batch.edge_index.to_vec2::<u32>().unwrap();
        // Second structure's first bond [0, 1] shifted by two atoms.
        assert_eq!(edges[0][6], 2);
        assert_eq!(edges[1][6], 3);
        assert_eq!(
            batch.batch.to_vec1::<u32>().unwrap(),
            vec![0, 0, 1, 1, 1]
        );
        assert_eq!(batch.edge_batch.to_vec1::<u32>().unwrap()[7], 1);
        assert!(batch.energy.is_some());
        assert_eq!(batch.forces.as_ref().unwrap().dims(), &[5, 3]);
    }

    #[test]
    fn test_collate_drops_partial_labels() {
        let mut unlabeled = trimer();
        unlabeled.stress = None;
        let batch = GraphBatch::collate(&[dimer(0.0), unlabeled], &Device::Cpu).unwrap();
        assert!(batch.stress.is_none());
        assert!(batch.energy.is_some());
    }

    #[test]
    fn test_validate_rejects_dangling_bond() {
        let mut record = trimer();
        record.edge_index[0] = [0, 7];
        let err = GraphBatch::collate(&[record], &Device::Cpu).unwrap_err();
        assert!(matches!(err, ForceFieldError::InvalidBatch(_)));
    }

    #[test]
    fn test_split_per_structure() {
        let batch = GraphBatch::collate(&[dimer(0.0), trimer()], &Device::Cpu).unwrap();
        let parts = split_per_structure(&batch.atom_pos, &batch.num_atoms).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].dims(), &[3, 3]);
    }
}
