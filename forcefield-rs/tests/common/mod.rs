//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use candle_core::Device;
use forcefield_rs::engine::ForwardOutput;
use forcefield_rs::{GraphBatch, GraphRecord, Potential, PotentialConfig};

/// Two atoms in a small periodic box, bonded across several images.
pub fn dimer(shift: f64) -> GraphRecord {
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
        three_body_indices: Vec::new(),
        num_triple_ij: Vec::new(),
        energy: Some(-1.5),
        forces: Some(vec![[0.1, 0.0, 0.0], [-0.1, 0.0, 0.0]]),
        stress: Some([[0.5, 0.0, 0.0], [0.0, 0.2, 0.0], [0.0, 0.0, 0.1]]),
    }
}

/// Three atoms in a large box, no periodic images.
pub fn trimer() -> GraphRecord {
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

/// Simple cubic crystal with lattice constant `a`, repeated `n` times along
/// x. Every atom is bonded to its six nearest neighbours.
pub fn simple_cubic(a: f64, n: usize) -> GraphRecord {
    let mut edge_index = Vec::new();
    let mut pbc_offsets = Vec::new();
    for i in 0..n {
        // Neighbours along x: the next and previous atom, wrapping through
        // the cell boundary.
        let next = (i + 1) % n;
        let next_offset = if i + 1 == n { 1.0 } else { 0.0 };
        let prev = (i + n - 1) % n;
        let prev_offset = if i == 0 { -1.0 } else { 0.0 };
        edge_index.push([i as u32, next as u32]);
        pbc_offsets.push([next_offset, 0.0, 0.0]);
        edge_index.push([i as u32, prev as u32]);
        pbc_offsets.push([prev_offset, 0.0, 0.0]);
        for offset in [[0.0, 1.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, -1.0]] {
            edge_index.push([i as u32, i as u32]);
            pbc_offsets.push(offset);
        }
    }
    GraphRecord {
        atom_pos: (0..n).map(|i| [a * i as f64, 0.0, 0.0]).collect(),
        cell: [[a * n as f64, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]],
        atom_attr: vec![3.0; n],
        edge_index,
        pbc_offsets,
        three_body_indices: Vec::new(),
        num_triple_ij: Vec::new(),
        energy: Some(-0.5 * n as f64),
        forces: Some(vec![[0.0; 3]; n]),
        stress: Some([[0.0; 3]; 3]),
    }
}

/// Morse potential with `num_heads` heads and deterministic parameters.
pub fn morse(num_heads: usize) -> Potential {
    let args = serde_json::json!({ "num_terms": 2, "num_species": 4, "num_heads": num_heads });
    Potential::new("morse", &args, &PotentialConfig::default(), &Device::Cpu).unwrap()
}

/// Evaluate `records` as one batch.
pub fn evaluate(
    potential: &Potential,
    records: &[GraphRecord],
    include_forces: bool,
    include_stresses: bool,
) -> ForwardOutput {
    let batch = GraphBatch::collate(records, &Device::Cpu).unwrap();
    potential
        .evaluate(&batch, include_forces, include_stresses, None)
        .unwrap()
}

/// Total energy of a single structure.
pub fn energy(potential: &Potential, record: &GraphRecord) -> f64 {
    evaluate(potential, std::slice::from_ref(record), false, false)
        .energy
        .to_vec1::<f64>()
        .unwrap()[0]
}

/// Collated batches of `batch_size` structures.
pub fn batches(records: &[GraphRecord], batch_size: usize) -> Vec<GraphBatch> {
    forcefield_rs::data::make_batches(records, batch_size, &Device::Cpu).unwrap()
}
