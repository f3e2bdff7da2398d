//! Running metrics and metric sinks.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::config::SelectionMetric;
use crate::error::Result;
use crate::loss::{LossSettings, LossTerms};

/// Running mean over a stream of scalars.
#[derive(Debug, Clone, Default)]
pub struct MeanMetric {
    sum: f64,
    count: usize,
}

impl MeanMetric {
    /// Add one observation.
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Mean of the observations so far, 0 when empty.
    pub fn compute(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Number of observations.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Forget every observation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Loss and error accumulators of one pass over one dataset.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    loss: MeanMetric,
    mae_energy: MeanMetric,
    mae_forces: MeanMetric,
    mae_stress: MeanMetric,
}

impl EpochMetrics {
    /// Accumulate one batch. Errors of excluded quantities are skipped.
    pub fn update(&mut self, terms: &LossTerms, settings: &LossSettings) -> Result<()> {
        self.loss.update(terms.loss_value()?);
        if settings.include_energy {
            self.mae_energy.update(terms.mae_energy);
        }
        if settings.include_forces {
            self.mae_forces.update(terms.mae_forces);
        }
        if settings.include_stresses {
            self.mae_stress.update(terms.mae_stress);
        }
        Ok(())
    }

    /// Number of batches seen.
    pub fn batches(&self) -> usize {
        self.loss.count()
    }

    /// Epoch-level means.
    pub fn summary(&self) -> EpochSummary {
        EpochSummary {
            loss: self.loss.compute(),
            mae_energy: self.mae_energy.compute(),
            mae_forces: self.mae_forces.compute(),
            mae_stress: self.mae_stress.compute(),
        }
    }
}

/// Epoch-level loss and errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EpochSummary {
    /// Mean objective.
    pub loss: f64,
    /// Mean per-atom energy MAE.
    pub mae_energy: f64,
    /// Mean force MAE.
    pub mae_forces: f64,
    /// Mean stress MAE.
    pub mae_stress: f64,
}

impl EpochSummary {
    /// `(loss, mae_e, mae_f, mae_s)`.
    pub fn as_tuple(&self) -> (f64, f64, f64, f64) {
        (self.loss, self.mae_energy, self.mae_forces, self.mae_stress)
    }

    /// Value of the selection metric.
    pub fn metric(&self, metric: SelectionMetric) -> f64 {
        match metric {
            SelectionMetric::ValLoss => self.loss,
            SelectionMetric::ValMaeE => self.mae_energy,
            SelectionMetric::ValMaeF => self.mae_forces,
            SelectionMetric::ValMaeS => self.mae_stress,
        }
    }

    /// Element-wise sum, used to aggregate datasets.
    pub fn add(&self, other: &Self) -> Self {
        Self {
            loss: self.loss + other.loss,
            mae_energy: self.mae_energy + other.mae_energy,
            mae_forces: self.mae_forces + other.mae_forces,
            mae_stress: self.mae_stress + other.mae_stress,
        }
    }

    /// Metrics as stored in checkpoints.
    pub fn validation_metrics(&self) -> BTreeMap<String, f64> {
        [
            SelectionMetric::ValLoss,
            SelectionMetric::ValMaeE,
            SelectionMetric::ValMaeF,
            SelectionMetric::ValMaeS,
        ]
        .into_iter()
        .map(|m| (m.saved_key().to_string(), self.metric(m)))
        .collect()
    }

    /// Sink record for a single-head pass in `mode`.
    pub fn record(&self, mode: &str, lr: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (format!("{mode}/loss"), self.loss),
            (format!("{mode}/mae_e"), self.mae_energy),
            (format!("{mode}/mae_f"), self.mae_forces),
            (format!("{mode}/mae_s"), self.mae_stress),
            (format!("{mode}/lr"), lr),
            (
                format!("{mode}/mae_tot"),
                self.mae_energy + self.mae_forces + self.mae_stress,
            ),
        ])
    }

    /// Sink record for one dataset of a multi-head pass in `mode`.
    pub fn dataset_record(&self, dataset: &str, mode: &str) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (format!("{dataset}/{mode}_loss"), self.loss),
            (format!("{dataset}/{mode}_mae_e"), self.mae_energy),
            (format!("{dataset}/{mode}_mae_f"), self.mae_forces),
            (format!("{dataset}/{mode}_mae_s"), self.mae_stress),
        ])
    }
}

/// Receives flat metric records keyed by epoch.
pub trait MetricsSink {
    /// Record `values` for `epoch`.
    fn log(&mut self, epoch: usize, values: &BTreeMap<String, f64>) -> Result<()>;
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    epoch: usize,
    #[serde(flatten)]
    values: &'a BTreeMap<String, f64>,
}

/// Appends one JSON object per record to a file.
pub struct JsonlMetricsSink {
    writer: BufWriter<File>,
}

impl JsonlMetricsSink {
    /// Open `path` for appending, creating it if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn log(&mut self, epoch: usize, values: &BTreeMap<String, f64>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &JsonlRecord { epoch, values })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Records in arrival order.
    pub records: Vec<(usize, BTreeMap<String, f64>)>,
}

impl MemorySink {
    /// Most recent value logged under `key`.
    pub fn last(&self, key: &str) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .find_map(|(_, values)| values.get(key).copied())
    }
}

impl MetricsSink for MemorySink {
    fn log(&mut self, epoch: usize, values: &BTreeMap<String, f64>) -> Result<()> {
        self.records.push((epoch, values.clone()));
        Ok(())
    }
}
