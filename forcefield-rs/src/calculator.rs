//! Single-structure calculator for molecular simulation drivers.
//!
//! Graph construction from a structure is left to a [`GraphBuilder`]. The
//! calculator collates the graph into a one-structure batch, evaluates
//! energy, forces and optionally stress, and reports them in the units and
//! layout simulation codes expect.

use candle_core::Device;
use serde::Serialize;

use crate::batch::{GraphBatch, GraphRecord};
use crate::error::{ForceFieldError, Result};
use crate::potential::Potential;

/// Builds the graph of one structure.
pub trait GraphBuilder {
    /// Structure type accepted by the builder.
    type Structure;

    /// Graph of `structure`, with bonds and triples within the model cutoff.
    fn build(&self, structure: &Self::Structure) -> Result<GraphRecord>;
}

/// Builder for inputs that already are graphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrebuiltGraphs;

impl GraphBuilder for PrebuiltGraphs {
    type Structure = GraphRecord;

    fn build(&self, structure: &GraphRecord) -> Result<GraphRecord> {
        structure.validate()?;
        Ok(structure.clone())
    }
}

/// Properties of one structure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculatorResults {
    /// Total energy in eV.
    pub energy: f64,
    /// Free energy, equal to the total energy.
    pub free_energy: f64,
    /// Per-atom forces in eV/Å.
    pub forces: Vec<[f64; 3]>,
    /// Voigt stress `[xx, yy, zz, yz, xz, xy]` times the stress weight.
    pub stress: Option<[f64; 6]>,
}

/// Energy, force and stress calculator around a [`Potential`].
pub struct Calculator<B: GraphBuilder = PrebuiltGraphs> {
    potential: Potential,
    builder: B,
    compute_stress: bool,
    stress_weight: f64,
    cache: Option<(GraphRecord, CalculatorResults)>,
}

impl Calculator<PrebuiltGraphs> {
    /// Calculator over prebuilt graphs.
    pub fn new(potential: Potential) -> Self {
        Self::with_builder(potential, PrebuiltGraphs)
    }
}

impl<B: GraphBuilder> Calculator<B> {
    /// Calculator using `builder` for graph construction. Stress is computed
    /// with weight 1.0 unless configured otherwise.
    pub fn with_builder(mut potential: Potential, builder: B) -> Self {
        potential.set_training(false);
        Self {
            potential,
            builder,
            compute_stress: true,
            stress_weight: 1.0,
            cache: None,
        }
    }

    /// Enable or disable the stress calculation.
    #[must_use]
    pub fn compute_stress(mut self, enabled: bool) -> Self {
        self.compute_stress = enabled;
        self.cache = None;
        self
    }

    /// Factor applied to the Voigt stress, e.g. to convert GPa to eV/Å³.
    #[must_use]
    pub fn stress_weight(mut self, weight: f64) -> Self {
        self.stress_weight = weight;
        self.cache = None;
        self
    }

    /// Wrapped potential.
    pub fn potential(&self) -> &Potential {
        &self.potential
    }

    /// Release the wrapped potential.
    pub fn into_potential(self) -> Potential {
        self.potential
    }

    /// Properties of `structure`. Repeating the previous structure returns
    /// the previous results without evaluating the model.
    pub fn calculate(&mut self, structure: &B::Structure) -> Result<CalculatorResults> {
        let graph = self.builder.build(structure)?;
        if let Some((cached, results)) = &self.cache {
            if *cached == graph {
                return Ok(results.clone());
            }
        }

        let device: &Device = self.potential.device();
        let batch = GraphBatch::collate(std::slice::from_ref(&graph), device)?;
        let output = self.potential.evaluate(&batch, true, self.compute_stress, None)?;

        let energy = output
            .energy
            .to_vec1::<f64>()?
            .first()
            .copied()
            .ok_or_else(|| ForceFieldError::invalid_batch("model returned no energy"))?;
        let forces = output
            .forces()?
            .to_vec2::<f64>()?
            .into_iter()
            .map(|row| [row[0], row[1], row[2]])
            .collect();
        let stress = if self.compute_stress {
            let matrices = output.stresses()?.to_vec3::<f64>()?;
            let m = matrices
                .first()
                .ok_or_else(|| ForceFieldError::invalid_batch("model returned no stress"))?;
            Some(voigt(m).map(|v| v * self.stress_weight))
        } else {
            None
        };

        let results = CalculatorResults {
            energy,
            free_energy: energy,
            forces,
            stress,
        };
        self.cache = Some((graph, results.clone()));
        Ok(results)
    }
}

/// Symmetrised Voigt form `[xx, yy, zz, yz, xz, xy]` of a 3x3 tensor.
pub fn voigt(m: &[Vec<f64>]) -> [f64; 6] {
    [
        m[0][0],
        m[1][1],
        m[2][2],
        (m[1][2] + m[2][1]) / 2.0,
        (m[0][2] + m[2][0]) / 2.0,
        (m[0][1] + m[1][0]) / 2.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::{dimer, trimer};
    use crate::config::PotentialConfig;

    fn calculator() -> Calculator {
        let args = serde_json::json!({ "num_terms": 2, "num_species": 4 });
        let potential = Potential::new("morse", &args, &PotentialConfig::default(), &Device::Cpu).unwrap();
        Calculator::new(potential)
    }

    #[test]
    fn test_voigt_symmetrises() {
        let m = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![7.0, 8.0, 9.0]];
        assert_eq!(voigt(&m), [1.0, 5.0, 9.0, 7.0, 5.0, 3.0]);
    }

    #[test]
    fn test_calculate_matches_potential() {
        let mut calc = calculator();
        let results = calc.calculate(&dimer(0.0)).unwrap();
        assert_eq!(results.energy, results.free_energy);
        assert_eq!(results.forces.len(), 2);
        assert!(results.stress.is_some());

        let batch = GraphBatch::collate(&[dimer(0.0)], &Device::Cpu).unwrap();
        let output = calc.potential().evaluate(&batch, true, true, None).unwrap();
        let expected = output.energy.to_vec1::<f64>().unwrap()[0];
        assert!((results.energy - expected).abs() < 1e-12);
    }

    #[test]
    fn test_stress_weight_scales() {
        let mut plain = calculator();
        let base = plain.calculate(&dimer(0.05)).unwrap().stress.unwrap();
        let mut weighted = Calculator::new(plain.into_potential()).stress_weight(0.5);
        let scaled = weighted.calculate(&dimer(0.05)).unwrap().stress.unwrap();
        for (a, b) in base.iter().zip(&scaled) {
            assert!((a * 0.5 - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_stress_disabled() {
        let mut calc = calculator().compute_stress(false);
        let results = calc.calculate(&trimer()).unwrap();
        assert!(results.stress.is_none());
        assert_eq!(results.forces.len(), 3);
    }

    #[test]
    fn test_repeat_structure_uses_cache() {
        let mut calc = calculator();
        let first = calc.calculate(&trimer()).unwrap();
        let second = calc.calculate(&trimer()).unwrap();
        assert_eq!(first, second);
        let moved = calc.calculate(&dimer(0.2)).unwrap();
        assert_ne!(first.forces.len(), moved.forces.len());
    }

    #[test]
    fn test_invalid_graph_rejected() {
        let mut calc = calculator();
        let mut bad = trimer();
        bad.atom_attr.pop();
        assert!(calc.calculate(&bad).is_err());
    }
}
